use std::net::SocketAddr;

use anyhow::Result;
use storefront_relay::config::Config;
use storefront_relay::{AppState, init_pool, init_router};
use tokio::net::TcpListener;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    let pool = init_pool(&config.database_url).await?;
    let app_state = AppState::new(pool, &config);

    let addr: SocketAddr = ([0, 0, 0, 0], config.server_port).into();
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(port = config.server_port, "listening");
    axum::serve(listener, init_router(app_state)).await?;
    Ok(())
}
