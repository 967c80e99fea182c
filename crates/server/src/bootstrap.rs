use std::sync::Arc;
use std::time::Duration;

use tandem_agent::{
    AgentDeps, BroadcastHub, CalendarService, HttpLlmClient, LlmClient, LlmError, LogNotifier,
    Orchestrator, TimeoutLlm,
};
use tandem_core::config::{AppConfig, ConfigError, LoadOptions};
use tandem_db::repositories::RepositorySet;
use tandem_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub orchestrator: Arc<Orchestrator>,
    pub calendar: Arc<CalendarService>,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client setup failed: {0}")]
    Llm(#[from] LlmError),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let http: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::from_config(&config.llm)?);
    let llm: Arc<dyn LlmClient> =
        Arc::new(TimeoutLlm::new(http, Duration::from_millis(config.llm.timeout_ms)));
    let repositories = RepositorySet::sql(db_pool.clone());
    let calendar = Arc::new(CalendarService::new(
        repositories.calendars.clone(),
        repositories.appointments.clone(),
        &config.calendar,
    ));
    let surfaces = Arc::new(BroadcastHub::default());
    let deps = AgentDeps::new(
        llm,
        repositories,
        calendar.clone(),
        Arc::new(LogNotifier),
        surfaces,
    );
    let orchestrator = Orchestrator::new(deps).with_pricing(config.llm.pricing);
    info!(
        event_name = "system.bootstrap.agent_ready",
        correlation_id = "bootstrap",
        llm_provider = config.llm.provider.as_str(),
        llm_model = %config.llm.model,
        "agent runtime initialized"
    );

    Ok(Application {
        config,
        db_pool,
        orchestrator: Arc::new(orchestrator),
        calendar,
    })
}
