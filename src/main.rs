use std::sync::Arc;

use flitch_realtime::config::Config;
use flitch_realtime::directory::InMemoryChatDirectory;
use flitch_realtime::{serve, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env().expect("invalid configuration");
    // Standalone mode: nothing fills this directory, so join_chat is refused. Embed the
    // library in the chat service to get a real directory and a publisher.
    tracing::warn!("running standalone with an empty chat directory");
    let directory = Arc::new(InMemoryChatDirectory::new());
    let state = AppState::new(&config, directory).expect("failed to register metrics");

    serve(&config, state).await.expect("server error");
}
