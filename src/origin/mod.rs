//! Origin Fetcher
//!
//! Pulls fragments from the origin over HTTP. A HEAD request resolves the
//! payload size and filename before any disk space is committed; the GET is
//! streamed straight to disk.

use futures::StreamExt;
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_DISPOSITION, CONTENT_LENGTH};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

const NODE_ID_HEADER: &str = "Node-Id";
const NODE_TOKEN_HEADER: &str = "Node-Token";

/// Compiled once, reused for every Content-Disposition header
static FILENAME_RE: OnceLock<Regex> = OnceLock::new();

#[derive(Error, Debug)]
pub enum OriginError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("origin returned status {0}")]
    Status(u16),

    #[error("missing or invalid {0} header")]
    MissingHeader(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Size and filename resolved from the origin's HEAD response
#[derive(Debug, Clone)]
pub struct ResolvedOrigin {
    pub size: u64,
    pub filename: String,
}

/// HTTP client for origin downloads, authenticated with node credentials
pub struct OriginFetcher {
    client: reqwest::Client,
    headers: HeaderMap,
}

impl OriginFetcher {
    pub fn new(node_id: &str, auth_token: &str) -> Result<Self, OriginError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            NODE_ID_HEADER,
            HeaderValue::from_str(node_id)
                .map_err(|_| OriginError::MissingHeader(NODE_ID_HEADER))?,
        );
        headers.insert(
            NODE_TOKEN_HEADER,
            HeaderValue::from_str(auth_token)
                .map_err(|_| OriginError::MissingHeader(NODE_TOKEN_HEADER))?,
        );

        Ok(Self {
            client: reqwest::Client::new(),
            headers,
        })
    }

    /// HEAD the origin URL and resolve Content-Length and the
    /// Content-Disposition filename. Both headers are required.
    pub async fn resolve(&self, url: &str) -> Result<ResolvedOrigin, OriginError> {
        let response = self
            .client
            .head(url)
            .headers(self.headers.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OriginError::Status(response.status().as_u16()));
        }

        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(OriginError::MissingHeader("Content-Length"))?;

        let filename = response
            .headers()
            .get(CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_disposition_filename)
            .ok_or(OriginError::MissingHeader("Content-Disposition"))?;

        Ok(ResolvedOrigin { size, filename })
    }

    /// Stream the fragment body to `dest`, yielding the final path.
    /// A partial file left by a failed stream is removed.
    pub async fn download(&self, url: &str, dest: &Path) -> Result<PathBuf, OriginError> {
        let response = self
            .client
            .get(url)
            .headers(self.headers.clone())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OriginError::Status(response.status().as_u16()));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(dest).await;
                    return Err(err.into());
                }
            };
            if let Err(err) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(dest).await;
                return Err(err.into());
            }
        }
        file.flush().await?;

        Ok(dest.to_path_buf())
    }
}

/// Extract the filename from a Content-Disposition header value
fn parse_disposition_filename(value: &str) -> Option<String> {
    let re = FILENAME_RE
        .get_or_init(|| Regex::new(r#"filename="([^"]+)""#).expect("valid filename pattern"));
    re.captures(value)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
