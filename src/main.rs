mod api;
mod bootstrap;
mod config;
mod dispatch;
mod error;
mod exchange;
mod ledger;
mod reconcile;
mod server;
mod staff;
mod stats;
mod store;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,p2p_desk=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    info!("Starting trade assignment and reconciliation engine");

    dotenv::dotenv().ok();
    let app_config = config::Config::from_env()?;
    let bind_address = app_config.bind_address.clone();

    let state = bootstrap::initialize_app_state(&app_config).await?;

    let app = server::create_app(state).await;
    server::run_server(app, &bind_address).await?;

    Ok(())
}
