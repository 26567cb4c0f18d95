//! Application wiring
//!
//! Builds the Postgres-backed controller, scheduler and resumption worker
//! from a loaded [`Config`].

use anyhow::Result;
use sqlx::PgPool;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::controller::{TriggerController, TriggerRequest};
use crate::scheduler::{PgResumptionScheduler, ResumptionWorker};
use crate::store::PgRunStore;

/// The Relay application instance
pub struct Application {
    pub config: Config,
    pub pool: PgPool,
    pub store: Arc<PgRunStore>,
    pub scheduler: Arc<PgResumptionScheduler>,
    pub controller: TriggerController<PgRunStore>,
}

impl Application {
    /// Pure instantiation, no I/O
    pub fn new(config: Config, pool: PgPool) -> Self {
        let store = Arc::new(PgRunStore::new(pool.clone()));
        let scheduler = Arc::new(PgResumptionScheduler::new(pool.clone()));
        let controller = TriggerController::new(store.clone(), config.trigger.ui_base_url.clone())
            .with_scheduler(scheduler.clone());

        Self {
            config,
            pool,
            store,
            scheduler,
            controller,
        }
    }

    /// Request for `workflow_id` carrying the configured poll interval and timeout.
    pub fn trigger_request(&self, workflow_id: impl Into<String>) -> TriggerRequest {
        TriggerRequest::new(workflow_id)
            .poll_interval(self.config.trigger.poll_interval())
            .timeout(self.config.trigger.timeout())
    }

    pub fn resumption_worker(&self) -> ResumptionWorker {
        ResumptionWorker::new(self.store.clone(), &self.config.resumption)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Overrides config file and env vars
    pub database_url: Option<String>,
    pub config_path: Option<PathBuf>,
    /// Run migrations before returning
    pub auto_migrate: bool,
    /// Workflows to register during initialization
    pub workflows: Vec<String>,
}

#[derive(Default)]
pub struct InitBuilder {
    options: InitOptions,
}

impl InitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.options.database_url = Some(url.into());
        self
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn auto_migrate(mut self, auto: bool) -> Self {
        self.options.auto_migrate = auto;
        self
    }

    pub fn workflows(mut self, workflows: Vec<String>) -> Self {
        self.options.workflows = workflows;
        self
    }

    pub async fn init(self) -> Result<Application> {
        initialize(self.options).await
    }
}

/// Load config, connect, optionally migrate, and register workflows.
pub async fn initialize(options: InitOptions) -> Result<Application> {
    use crate::store::RunStore;

    let config = Config::builder()
        .database_url(options.database_url)
        .config_path(options.config_path)
        .require_database(true)
        .build()?;

    let pool = crate::db::create_pool(&config.database).await?;
    if options.auto_migrate {
        crate::db::migrate(&pool).await?;
    }

    let app = Application::new(config, pool);
    for workflow_id in &options.workflows {
        app.store.register_workflow(workflow_id).await?;
    }

    Ok(app)
}
