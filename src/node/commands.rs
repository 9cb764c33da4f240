//! Command handling
//!
//! The signaling service issues two commands: delete cached fragments, and
//! download fragments from the origin into the most-free storage path.

use crate::config::{NodeInfo, StoragePathConfig};
use crate::origin::OriginFetcher;
use crate::signaling::events::{ResourceHash, EV_COMMAND_VERIFY};
use crate::signaling::{CommandPayload, SignalingClient};
use crate::storage::{self, FragmentIndex};
use std::path::PathBuf;
use std::sync::Arc;

pub const CMD_DELETE: &str = "delete";
pub const CMD_DOWNLOAD: &str = "download";

/// Executes delete/download commands against the fragment store
pub struct CommandHandler {
    index: Arc<FragmentIndex>,
    paths: Vec<StoragePathConfig>,
    signaling: SignalingClient,
}

impl CommandHandler {
    pub fn new(
        index: Arc<FragmentIndex>,
        paths: Vec<StoragePathConfig>,
        signaling: SignalingClient,
    ) -> Self {
        Self {
            index,
            paths,
            signaling,
        }
    }

    /// Dispatch one command. Unknown commands are logged and ignored.
    pub async fn handle(&self, command: CommandPayload, info: &NodeInfo) {
        match command.command.as_str() {
            CMD_DELETE => self.handle_delete(&command.payload).await,
            CMD_DOWNLOAD => self.handle_download(&command.payload, info).await,
            other => {
                tracing::warn!(command = other, "unknown command ignored");
            }
        }
    }

    /// Remove fragments from the index and unlink their files. Unknown ids
    /// are warned but the batch continues.
    async fn handle_delete(&self, fragment_ids: &[String]) {
        for fragment_id in fragment_ids {
            match self.index.remove(fragment_id) {
                Some(path) => match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        tracing::info!(fragment = %fragment_id, "fragment deleted");
                    }
                    Err(err) => {
                        tracing::warn!(fragment = %fragment_id, %err, "unlink failed");
                    }
                },
                None => {
                    tracing::warn!(fragment = %fragment_id, "delete for unknown fragment");
                }
            }
        }
    }

    /// Pull fragments from the origin. Each URL is resolved with a HEAD
    /// request, gated on free space, streamed to disk, indexed, and hashed.
    /// Per-URL failures are logged and skipped; one command_verify reports
    /// all successes.
    async fn handle_download(&self, urls: &[String], info: &NodeInfo) {
        let fetcher = match OriginFetcher::new(&info.id, &info.auth_token) {
            Ok(fetcher) => fetcher,
            Err(err) => {
                tracing::error!(%err, "cannot build origin client");
                return;
            }
        };

        let mut verified = Vec::new();
        for url in urls {
            match self.download_one(&fetcher, url).await {
                Ok(resource) => verified.push(resource),
                Err(err) => {
                    tracing::warn!(%url, %err, "download skipped");
                }
            }
        }

        if !verified.is_empty() {
            if let Err(err) = self.signaling.emit(EV_COMMAND_VERIFY, &verified) {
                tracing::warn!(%err, "command_verify not delivered");
            }
        }
    }

    async fn download_one(
        &self,
        fetcher: &OriginFetcher,
        url: &str,
    ) -> Result<ResourceHash, crate::NodeError> {
        let resolved = fetcher.resolve(url).await?;

        let dest = choose_destination(&self.paths, resolved.size)?.join(&resolved.filename);
        let path = fetcher.download(url, &dest).await?;

        self.index.insert(resolved.filename.clone(), path.clone());
        let hash = storage::hash_file(&path).await?;

        tracing::info!(
            fragment = %resolved.filename,
            bytes = resolved.size,
            "fragment downloaded"
        );
        Ok(ResourceHash {
            fragment_id: resolved.filename,
            hash: hash.to_hex(),
        })
    }
}

/// Pick the remote directory of the most-free storage path, requiring
/// enough capped free space for the payload
fn choose_destination(
    paths: &[StoragePathConfig],
    required: u64,
) -> Result<PathBuf, crate::NodeError> {
    let (entry, free) = storage::most_free_path(paths)?
        .ok_or_else(|| crate::NodeError::NoStorage("no storage paths configured".into()))?;

    if free < required {
        return Err(crate::NodeError::NoStorage(format!(
            "need {required} bytes, most-free path {} has {free}",
            entry.path.display()
        )));
    }
    Ok(storage::remote_dir(&entry.path))
}
