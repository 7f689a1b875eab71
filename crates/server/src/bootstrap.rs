use std::sync::Arc;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use tracing::info;

use motocrm_core::config::{AppConfig, ConfigError, LoadOptions};
use motocrm_db::repositories::{
    SqlConversationRepository, SqlLeadRepository, SqlMessageRepository, SqlSyncQueueRepository,
};
use motocrm_db::{connect_with_settings, migrations, DbPool};
use motocrm_platform::{HttpPlatformClient, PlatformClient, PlatformError};
use motocrm_sync::{BulkSyncOrchestrator, EventProcessor, ProgressStore, SyncQueue};

/// Shared handler state for the API router.
#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<EventProcessor>,
    pub queue: Arc<SyncQueue>,
    pub bulk: Arc<BulkSyncOrchestrator>,
    pub verify_token: SecretString,
}

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("platform client construction failed: {0}")]
    Platform(#[source] PlatformError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(event_name = "system.bootstrap.start", "starting application bootstrap");

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(event_name = "system.bootstrap.database_connected", "database connection established");

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(event_name = "system.bootstrap.migrations_applied", "database migrations applied");

    let platform: Arc<dyn PlatformClient> = Arc::new(
        HttpPlatformClient::new(
            config.platform.api_base_url.clone(),
            config.platform.api_token.clone(),
            Duration::from_secs(config.platform.timeout_secs),
        )
        .map_err(BootstrapError::Platform)?,
    );

    let state = build_state(&config, &db_pool, platform);
    Ok(Application { config, db_pool, state })
}

/// Wires the processing stack over the given pool and platform client. Split
/// out so tests can swap in the fake platform.
pub fn build_state(
    config: &AppConfig,
    db_pool: &DbPool,
    platform: Arc<dyn PlatformClient>,
) -> AppState {
    let leads = Arc::new(SqlLeadRepository::new(db_pool.clone()));
    let conversations = Arc::new(SqlConversationRepository::new(db_pool.clone()));
    let messages = Arc::new(SqlMessageRepository::new(db_pool.clone()));
    let records = Arc::new(SqlSyncQueueRepository::new(db_pool.clone()));

    let processor = Arc::new(EventProcessor::new(
        leads.clone(),
        conversations.clone(),
        messages.clone(),
    ));
    let queue = Arc::new(SyncQueue::new(
        records,
        leads.clone(),
        platform.clone(),
        config.sync.max_attempts,
        Duration::from_millis(config.sync.drain_delay_ms),
    ));
    let bulk = Arc::new(BulkSyncOrchestrator::new(
        leads,
        platform,
        Arc::new(ProgressStore::new(
            Duration::from_secs(config.sync.progress_retention_secs),
            config.sync.max_recorded_errors,
        )),
        Duration::from_millis(config.sync.bulk_delay_ms),
    ));

    AppState {
        processor,
        queue,
        bulk,
        verify_token: config.platform.verify_token.clone(),
    }
}
