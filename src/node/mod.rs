//! Node Orchestration
//!
//! Wires the subsystems together: builds the fragment index, drives the
//! signaling connection, authenticates the node, reports the fragment
//! inventory, ships periodic device updates, and dispatches signaling events
//! to the peer session manager and the command handler.

mod commands;

pub use commands::CommandHandler;

use crate::config::{NodeInfo, Settings};
use crate::peer::PeerSessionManager;
use crate::signaling::events::{
    hash_verify_chunks, ResourceHash, SignInPayload, SignUpResponse, EV_COMMAND_ACK,
    EV_DEVICE_UPDATE, EV_HASH_EMPTY, EV_HASH_VERIFY, EV_SIGN_IN, EV_SIGN_UP,
};
use crate::signaling::{SignalingClient, SignalingError, SignalingEvent};
use crate::storage::{self, FragmentIndex};
use crate::system::DeviceSnapshot;
use crate::NodeError;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Sign-in/sign-up RPC timeout
const SIGN_IN_TIMEOUT: Duration = Duration::from_secs(5);

/// Device update cadence
const DEVICE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// The running storage-node agent
pub struct Node {
    settings: Settings,
    settings_path: PathBuf,
    index: Arc<FragmentIndex>,
    signaling: SignalingClient,
    manager: PeerSessionManager,
    commands: CommandHandler,
    device_task: Option<JoinHandle<()>>,
    inventory_sent: bool,
}

impl Node {
    /// Run the node until a fatal error. Startup scans the fragment store,
    /// then the loop follows the signaling connection: every (re)connect
    /// signs the node in and restarts device updates.
    pub async fn run(settings: Settings, settings_path: PathBuf) -> Result<(), NodeError> {
        let index = Arc::new(FragmentIndex::scan(&settings.paths)?);

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let (signaling, driver) =
            SignalingClient::new(settings.signaling_servers.clone(), event_tx);
        let mut driver_handle = tokio::spawn(driver.run());

        let manager =
            PeerSessionManager::new(&settings.webrtc, index.clone(), signaling.clone())?;
        manager.start();

        let commands = CommandHandler::new(
            index.clone(),
            settings.paths.clone(),
            signaling.clone(),
        );

        let mut node = Node {
            settings,
            settings_path,
            index,
            signaling,
            manager,
            commands,
            device_task: None,
            inventory_sent: false,
        };

        loop {
            tokio::select! {
                fatal = &mut driver_handle => {
                    node.manager.cleanup_all().await;
                    let err = match fatal {
                        Ok(err) => err,
                        Err(join) => SignalingError::Transport(join.to_string()),
                    };
                    return Err(err.into());
                }
                event = event_rx.recv() => {
                    match event {
                        Some(event) => node.dispatch(event).await?,
                        None => {
                            node.manager.cleanup_all().await;
                            return Err(SignalingError::ConnectionClosed.into());
                        }
                    }
                }
            }
        }
    }

    async fn dispatch(&mut self, event: SignalingEvent) -> Result<(), NodeError> {
        match event {
            SignalingEvent::Connected { server } => {
                tracing::info!(%server, "signaling up, authenticating");
                self.authenticate().await?;
                if !self.inventory_sent {
                    self.send_inventory().await;
                    self.inventory_sent = true;
                }
                self.restart_device_updates();
            }
            SignalingEvent::Offer(offer) => {
                self.manager.on_offer(&offer.remote_id, offer.sdp).await;
            }
            SignalingEvent::Answer(answer) => {
                self.manager.on_answer(&answer.remote_id, answer.sdp).await;
            }
            SignalingEvent::IceCandidate(candidate) => {
                self.manager.on_ice_candidate(candidate).await;
            }
            SignalingEvent::Command(command) => {
                if let Err(err) = self.signaling.emit(
                    EV_COMMAND_ACK,
                    &serde_json::json!({ "command": command.command }),
                ) {
                    tracing::debug!(%err, "command ack not delivered");
                }
                self.commands.handle(command, &self.settings.info).await;
            }
            SignalingEvent::StatsRequested => {
                self.manager.publish_stats_now().await;
            }
        }
        Ok(())
    }

    /// Sign in, signing up first when the node carries no credentials.
    /// Either RPC failing is fatal.
    async fn authenticate(&mut self) -> Result<(), NodeError> {
        if !self.settings.info.is_registered() {
            tracing::info!("no credentials, signing up");
            let ack = self
                .signaling
                .emit_with_ack(EV_SIGN_UP, &serde_json::json!({}), SIGN_IN_TIMEOUT)
                .await?;
            if !ack.success {
                return Err(SignalingError::Rejected(
                    ack.error.unwrap_or_else(|| "sign-up refused".into()),
                )
                .into());
            }
            let credentials: SignUpResponse =
                serde_json::from_value(ack.data.unwrap_or_default())
                    .map_err(SignalingError::Serialization)?;

            self.settings.info = NodeInfo {
                id: credentials.id,
                auth_token: credentials.auth_token,
            };
            self.settings.save(&self.settings_path)?;
            tracing::info!(node = %self.settings.info.id, "credentials persisted");
        }

        let payload = SignInPayload {
            id: self.settings.info.id.clone(),
            auth_token: self.settings.info.auth_token.clone(),
        };
        let ack = self
            .signaling
            .emit_with_ack(EV_SIGN_IN, &payload, SIGN_IN_TIMEOUT)
            .await?;
        if !ack.success {
            return Err(SignalingError::Rejected(
                ack.error.unwrap_or_else(|| "sign-in refused".into()),
            )
            .into());
        }

        tracing::info!(node = %self.settings.info.id, "signed in");
        Ok(())
    }

    /// Report the startup fragment inventory: hash_empty for a bare store,
    /// otherwise hash_verify chunks of id/hash pairs
    async fn send_inventory(&self) {
        if self.index.is_empty() {
            if let Err(err) = self.signaling.emit(EV_HASH_EMPTY, &serde_json::json!({})) {
                tracing::warn!(%err, "hash_empty not delivered");
            }
            return;
        }

        let resources = build_inventory(&self.index).await;
        for chunk in hash_verify_chunks(resources) {
            if let Err(err) = self.signaling.emit(EV_HASH_VERIFY, &chunk) {
                tracing::warn!(%err, "hash_verify chunk not delivered");
            }
        }
    }

    /// (Re)start the periodic device update ticker
    fn restart_device_updates(&mut self) {
        if let Some(task) = self.device_task.take() {
            task.abort();
        }
        let signaling = self.signaling.clone();
        let paths = self.settings.paths.clone();
        self.device_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(DEVICE_UPDATE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let snapshot = DeviceSnapshot::collect(&paths);
                if signaling.emit(EV_DEVICE_UPDATE, &snapshot).is_err() {
                    break;
                }
            }
        }));
    }
}

/// Hash every indexed fragment. Unreadable files are skipped with a warning
/// so one bad fragment does not block the inventory report.
async fn build_inventory(index: &FragmentIndex) -> Vec<ResourceHash> {
    let mut resources = Vec::new();
    for (fragment_id, path) in index.snapshot() {
        match storage::hash_file(&path).await {
            Ok(hash) => resources.push(ResourceHash {
                fragment_id,
                hash: hash.to_hex(),
            }),
            Err(err) => {
                tracing::warn!(fragment = %fragment_id, %err, "inventory hash failed");
            }
        }
    }
    resources
}
