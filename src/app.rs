//! Application wiring
//!
//! [`App::new`] builds every component from a [`Config`]; [`App::start`] runs
//! the startup recovery pass and spawns the background services:
//!
//! - the consumer, feeding task-created events to the execution engine
//! - the outbox relay, publishing committed events to the broker
//! - the cron scheduler with both recovery jobs
//! - the REST API server (when enabled)
//!
//! [`RunningApp::shutdown`] stops them all and records a clean shutdown.

use crate::api::{self, AppState};
use crate::config::{Config, RedispatchMode};
use crate::db::Database;
use crate::dispatcher::{Dispatcher, OutboxDispatcher};
use crate::downloader::DefaultDownloaderFactory;
use crate::engine::ExecutionEngine;
use crate::identity::{StaticTokenResolver, TokenResolver};
use crate::mq::{Consumer, MessageBroker, SqliteBroker};
use crate::outbox_relay::OutboxRelay;
use crate::recovery::{
    ExecuteAllPendingDownloadTask, RecoveryJob,
    UpdateDownloadingAndFailedDownloadTaskStatusToPending,
};
use crate::scheduler::CronScheduler;
use crate::storage::LocalBlobStore;
use crate::tasks::DownloadTaskService;
use crate::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for each background service to stop
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A fully constructed, not yet started application
pub struct App {
    config: Config,
    db: Database,
    broker: SqliteBroker,
    blobs: Arc<LocalBlobStore>,
    engine: Arc<ExecutionEngine>,
    relay: OutboxRelay,
    tasks: Arc<DownloadTaskService>,
    tokens: Arc<dyn TokenResolver>,
    pending_job: Arc<ExecuteAllPendingDownloadTask>,
    reset_job: Arc<UpdateDownloadingAndFailedDownloadTaskStatusToPending>,
    startup_reset_job: Arc<UpdateDownloadingAndFailedDownloadTaskStatusToPending>,
    shutdown: CancellationToken,
}

impl App {
    /// Validate `config` and build every component
    ///
    /// Fails when the configuration is invalid or a store cannot be opened.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let db = Database::open(&config.persistence).await?;
        let broker = SqliteBroker::open(&config.mq.broker_path).await?;
        let blobs = Arc::new(LocalBlobStore::new(&config.storage.download_dir).await?);
        let downloaders = DefaultDownloaderFactory::new(&config.download)?.shared();

        let engine = Arc::new(
            ExecutionEngine::new(db.clone(), blobs.clone(), downloaders)
                .with_heartbeat_interval(config.recovery.heartbeat_interval),
        );

        let shared_broker: Arc<dyn MessageBroker> = Arc::new(broker.clone());
        let relay = OutboxRelay::new(db.clone(), shared_broker, &config.mq);

        let dispatcher: Arc<dyn Dispatcher> = match config.recovery.redispatch {
            RedispatchMode::Outbox => Arc::new(OutboxDispatcher::new(
                db.clone(),
                config.mq.topic.clone(),
                relay.waker(),
            )),
            RedispatchMode::Direct => engine.clone(),
        };

        let shutdown = CancellationToken::new();
        let tasks = Arc::new(
            DownloadTaskService::new(
                db.clone(),
                blobs.clone(),
                config.mq.topic.clone(),
                relay.waker(),
                config.api.max_page_size,
            )
            .with_shutdown(shutdown.clone()),
        );
        let tokens: Arc<dyn TokenResolver> = Arc::new(StaticTokenResolver::new(&config.auth));

        let pending_job = Arc::new(ExecuteAllPendingDownloadTask::new(
            db.clone(),
            dispatcher,
            &config.recovery,
        ));
        let reset_job = Arc::new(UpdateDownloadingAndFailedDownloadTaskStatusToPending::new(
            db.clone(),
            &config.recovery,
        ));
        // Nothing of this process is transferring yet, so every Downloading row is stale
        let startup_reset_job = Arc::new(
            UpdateDownloadingAndFailedDownloadTaskStatusToPending::new(db.clone(), &config.recovery)
                .on_startup(),
        );

        Ok(Self {
            config,
            db,
            broker,
            blobs,
            engine,
            relay,
            tasks,
            tokens,
            pending_job,
            reset_job,
            startup_reset_job,
            shutdown,
        })
    }

    /// Task use cases, for embedding without the REST API
    pub fn tasks(&self) -> Arc<DownloadTaskService> {
        self.tasks.clone()
    }

    /// The execution engine
    pub fn engine(&self) -> Arc<ExecutionEngine> {
        self.engine.clone()
    }

    /// The task store
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// The configuration the app was built with
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run startup recovery and spawn the background services
    ///
    /// Staging files of transfers that never finished are removed first.
    /// Startup recovery resets every task left in Downloading or Failed and
    /// then re-dispatches every Pending task. A failing pass, a schedule that does
    /// not register, or an API address that cannot be bound is fatal.
    pub async fn start(self) -> Result<RunningApp> {
        if self.db.was_unclean_shutdown().await? {
            tracing::warn!("Previous session did not shut down cleanly, recovering interrupted tasks");
        }
        self.db.set_clean_start().await?;

        // No sink is open yet; anything staged belongs to a transfer that died
        self.blobs.sweep_staging().await?;

        for job in [
            self.startup_reset_job.clone() as Arc<dyn RecoveryJob>,
            self.pending_job.clone() as Arc<dyn RecoveryJob>,
        ] {
            let report = job.run().await.map_err(|e| {
                Error::Other(format!("startup recovery job {} failed: {}", job.name(), e))
            })?;
            tracing::info!(
                job = job.name(),
                scanned = report.scanned,
                processed = report.processed,
                failed = report.failed,
                "Startup recovery finished"
            );
        }

        let mut scheduler = CronScheduler::new();
        scheduler.register(
            &self.config.cron.execute_all_pending_download_task.schedule,
            self.pending_job.clone(),
        )?;
        scheduler.register(
            &self
                .config
                .cron
                .update_downloading_and_failed_download_task_status_to_pending
                .schedule,
            self.reset_job.clone(),
        )?;

        let mut consumer = Consumer::new(Arc::new(self.broker.clone()), &self.config.mq);
        let engine = self.engine.clone();
        consumer.register_handler(self.config.mq.topic.clone(), move |message| {
            let engine = engine.clone();
            async move { engine.handle_message(message).await }
        })?;

        // Bind before spawning anything so a taken port fails the start
        let api_listener = if self.config.api.enabled {
            Some(
                TcpListener::bind(self.config.api.bind_address)
                    .await
                    .map_err(Error::Io)?,
            )
        } else {
            None
        };

        let shutdown = self.shutdown;
        let mut services: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        services.push((
            "consumer",
            tokio::spawn({
                let shutdown = shutdown.clone();
                async move {
                    if let Err(e) = consumer.start(shutdown).await {
                        tracing::error!(error = %e, "Consumer stopped with an error");
                    }
                }
            }),
        ));
        services.push(("outbox relay", tokio::spawn(self.relay.run(shutdown.clone()))));
        services.push(("cron scheduler", tokio::spawn(scheduler.start(shutdown.clone()))));

        let mut api_address: Option<SocketAddr> = None;
        if let Some(listener) = api_listener {
            api_address = Some(listener.local_addr().map_err(Error::Io)?);
            let state = AppState::new(self.tasks.clone(), self.tokens.clone());
            let config = self.config.api.clone();
            let shutdown = shutdown.clone();
            services.push((
                "api server",
                tokio::spawn(async move {
                    if let Err(e) = api::serve(listener, state, &config, shutdown).await {
                        tracing::error!(error = %e, "API server stopped with an error");
                    }
                }),
            ));
        }

        tracing::info!(
            topic = %self.config.mq.topic,
            consumer_group = %self.config.mq.client_id,
            api = ?api_address,
            "url-dl started"
        );

        Ok(RunningApp {
            shutdown,
            services,
            db: self.db,
            broker: self.broker,
            tasks: self.tasks,
            api_address,
        })
    }
}

/// Handle to a started application
pub struct RunningApp {
    shutdown: CancellationToken,
    services: Vec<(&'static str, JoinHandle<()>)>,
    db: Database,
    broker: SqliteBroker,
    tasks: Arc<DownloadTaskService>,
    api_address: Option<SocketAddr>,
}

impl RunningApp {
    /// Task use cases
    pub fn tasks(&self) -> Arc<DownloadTaskService> {
        self.tasks.clone()
    }

    /// Address the API server is listening on, if it was enabled
    pub fn api_address(&self) -> Option<SocketAddr> {
        self.api_address
    }

    /// The task store
    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Stop every background service and close the stores
    ///
    /// Task changes made through [`tasks`](Self::tasks) fail with
    /// [`Error::ShuttingDown`] from here on.
    ///
    /// Each service gets [`SHUTDOWN_TIMEOUT`] to finish its current unit of
    /// work; a download in flight past that is abandoned and picked up by
    /// recovery on the next start.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");
        self.shutdown.cancel();

        for (name, handle) in self.services {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
                Ok(Ok(())) => tracing::debug!(service = name, "Service stopped"),
                Ok(Err(e)) => tracing::error!(service = name, error = %e, "Service panicked"),
                Err(_) => tracing::warn!(service = name, "Timeout waiting for service to stop"),
            }
        }

        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
        } else {
            tracing::info!("Marked clean shutdown in database");
        }

        self.broker.close().await;
        self.db.close().await;

        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}
