//! The main library for the storefront payment relay.

pub mod adapters;
mod api;
pub mod client;
pub mod config;
pub mod delivery;
mod error;
pub mod ledger;
pub mod reconcile;
pub mod registry;
mod responses;
pub mod session;
pub mod types;

use std::str::FromStr;
use std::time::Duration;

pub use api::{AppState, init_router};
pub use error::{ApiError, ApiErrorWithMeta, StoreError};
pub use responses::{ApiOk, RequestMeta, SuccessEnvelope};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

/// Initializes the database pool and runs pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}
