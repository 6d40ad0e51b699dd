//! Process wiring shared by the controller and recorder binaries.

use anyhow::Context;
use log::{info, warn};

use crate::config::{Config, ServiceKind};
use crate::db::{DbPool, init_pool};
use crate::health::{HealthRegistry, HealthServer};
use crate::logging::init_logging;
use crate::recordings::{RetentionPolicy, UploadPolicy};
use crate::tasks::{DatabaseProbe, DeviceSweepProbe, ProbeSet, RecordingProbe};

/// A running service: health endpoint plus its probes.
pub struct Service {
    kind: ServiceKind,
    pool: DbPool,
    registry: HealthRegistry,
    server: HealthServer,
    probes: ProbeSet,
    upload_policy: UploadPolicy,
    retention_policy: RetentionPolicy,
}

impl Service {
    /// Bind the health endpoint, then start the probes for `config.service`.
    ///
    /// The database is not contacted here. Its state shows up through the
    /// database probe once that has run.
    pub async fn start(config: &Config) -> anyhow::Result<Self> {
        let pool = init_pool(&config.database);
        let registry = HealthRegistry::new();

        let server = HealthServer::start(config.health_port, registry.clone(), config.health_wire)
            .await
            .context("failed to start health endpoint")?;

        let mut probes = ProbeSet::new(registry.clone());
        match config.service {
            ServiceKind::Controller => {
                probes.spawn(DatabaseProbe::new(pool.clone()).with_migrations());
                probes.spawn(DeviceSweepProbe::new(
                    pool.clone(),
                    config.device_timeout,
                    config.device_sweep_interval,
                ));
            }
            ServiceKind::Recorder => {
                probes.spawn(DatabaseProbe::new(pool.clone()));
                probes.spawn(RecordingProbe::new(&config.workspace, config.min_free_bytes));
            }
        }

        info!(
            "silvasonic-{} up: health on port {}, {} probe(s)",
            config.service,
            server.port(),
            probes.len()
        );
        info!(
            "Upload policy {}, retention policy {:?}",
            config.upload_policy, config.retention_policy
        );

        Ok(Self {
            kind: config.service,
            pool,
            registry,
            server,
            probes,
            upload_policy: config.upload_policy,
            retention_policy: config.retention_policy,
        })
    }

    pub fn health_port(&self) -> u16 {
        self.server.port()
    }

    pub fn registry(&self) -> &HealthRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Policy handed to upload workers started on this service.
    pub fn upload_policy(&self) -> UploadPolicy {
        self.upload_policy
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        self.retention_policy
    }

    /// Stop the probes first, then close the listener.
    pub async fn stop(self) -> anyhow::Result<()> {
        info!("silvasonic-{} shutting down", self.kind);
        self.probes.shutdown().await;
        self.server.stop().await
    }
}

/// Entry point of both binaries: configure, start, and run until SIGTERM
/// or SIGINT.
pub async fn run(kind: ServiceKind) -> anyhow::Result<()> {
    let config = Config::from_env(kind).context("invalid configuration")?;
    let _logger = init_logging(kind.name(), &config.logging)?;

    let service = Service::start(&config).await?;
    shutdown_signal().await;
    service.stop().await
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM, only SIGINT stops the service: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Cannot listen for SIGINT: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Received SIGINT");
}
