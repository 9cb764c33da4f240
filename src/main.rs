//! Storage-node agent entry point

use p2p_node::config::{Settings, SETTINGS_FILE};
use p2p_node::node::Node;
use std::path::Path;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "p2p_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let settings_path = Path::new(SETTINGS_FILE);
    let settings = match Settings::load(settings_path) {
        Ok(settings) => settings,
        Err(err) => {
            tracing::error!(%err, "cannot start without valid settings");
            std::process::exit(1);
        }
    };

    tracing::info!(
        servers = settings.signaling_servers.len(),
        paths = settings.paths.len(),
        "starting storage node"
    );

    if let Err(err) = Node::run(settings, settings_path.to_path_buf()).await {
        tracing::error!(%err, "node terminated");
        std::process::exit(1);
    }
}
