// ============================================================================
// EXPORTER
// ============================================================================
// Startup order: authenticate, check the controller answers, prime the
// template cache, bind the metric handlers and the listen address, start one
// poll task per domain, then serve scrapes. Shutdown cancels everything
// through one token and waits out a grace period.
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::communicator::{Communicator, DomainSource};
use crate::config::ExporterConfig;
use crate::context::ExporterContext;
use crate::error::ExporterResult;
use crate::poller::{PollStats, Poller};
use crate::types::EventKind;
use crate::{metrics, server, EXPORTER_FULL_NAME, EXPORTER_VERSION};

#[derive(Debug)]
pub struct Exporter {
    config: ExporterConfig,
    context: ExporterContext,
}

/// Handles of a started exporter.
#[derive(Debug)]
pub struct RunningExporter {
    poller: Poller,
    server: JoinHandle<ExporterResult<()>>,
    local_addr: SocketAddr,
}

impl Exporter {
    pub fn new(config: ExporterConfig) -> ExporterResult<Self> {
        let context = ExporterContext::from_config(&config)?;
        Ok(Self { config, context })
    }

    pub fn config(&self) -> &ExporterConfig {
        &self.config
    }

    pub fn context(&self) -> &ExporterContext {
        &self.context
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "anka_exporter::exporter", "Shutdown requested");
        self.context.cancel.cancel();
    }

    /// Bring up every component. Login and connectivity failures are fatal.
    pub async fn start(&self) -> ExporterResult<RunningExporter> {
        let config = &self.config;
        info!(
            target: "anka_exporter::exporter",
            version = EXPORTER_VERSION,
            controller = %config.controller.base_url(),
            "Starting {}",
            EXPORTER_FULL_NAME
        );

        let communicator = Arc::new(self.context.communicator(config));

        if let Some(session) = &self.context.auth {
            session.login().await.map_err(|e| {
                error!(
                    target: "anka_exporter::exporter",
                    error = %e,
                    hint = ?e.recovery_hint(),
                    "Initial UAK login failed"
                );
                e
            })?;
        }

        communicator.test_connection().await.map_err(|e| {
            error!(
                target: "anka_exporter::exporter",
                controller = %communicator.base_url(),
                error = %e,
                hint = ?e.recovery_hint(),
                "Controller is not reachable"
            );
            e
        })?;

        self.prime_templates(&communicator).await;

        metrics::install(&self.context)?;

        // Bound before any poll task exists so a busy port leaves nothing running
        let listener = server::bind(&config.server.listen_address).await?;
        let local_addr = listener.local_addr()?;

        let poller = self.context.poller(&config.polling)?;
        for kind in EventKind::ALL {
            if let Err(e) = poller.start(DomainSource::new(communicator.clone(), kind)) {
                poller
                    .shutdown(Duration::from_secs(config.polling.shutdown_grace_secs))
                    .await;
                return Err(e);
            }
        }

        let interval = if config.polling.disable_interval_optimizer {
            info!(target: "anka_exporter::exporter", "Interval optimizer disabled");
            None
        } else {
            Some(self.context.interval_controller.clone())
        };
        let app = server::router(self.context.registry.clone(), interval, &config.server.metrics_path);
        let server = tokio::spawn(server::serve(listener, app, self.context.cancel.clone()));

        info!(
            target: "anka_exporter::exporter",
            address = %local_addr,
            path = %config.server.metrics_path,
            interval_secs = self.context.interval.secs(),
            "Exporter started"
        );

        Ok(RunningExporter {
            poller,
            server,
            local_addr,
        })
    }

    /// Templates are fetched once before polling starts so the first
    /// instance payload already carries template names.
    async fn prime_templates(&self, communicator: &Communicator) {
        match communicator.registry_templates().await {
            Ok(templates) => info!(
                target: "anka_exporter::exporter",
                templates = templates.len(),
                "Template cache primed"
            ),
            Err(e) => warn!(
                target: "anka_exporter::exporter",
                error = %e,
                "Could not prime template cache"
            ),
        }
    }

    /// Start, then run until SIGINT, SIGTERM or [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> ExporterResult<()> {
        let running = self.start().await?;

        tokio::select! {
            _ = shutdown_signal() => {}
            _ = self.context.cancel.cancelled() => {
                info!(target: "anka_exporter::exporter", "Shutdown notification received");
            }
        }

        running
            .stop(Duration::from_secs(self.config.polling.shutdown_grace_secs))
            .await
    }
}

impl RunningExporter {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn stats(&self) -> Vec<PollStats> {
        self.poller.all_stats()
    }

    /// Cancel the poll tasks and the scrape endpoint, waiting at most
    /// `grace` for each.
    pub async fn stop(self, grace: Duration) -> ExporterResult<()> {
        info!(target: "anka_exporter::exporter", "Starting graceful shutdown");
        let started = Instant::now();

        self.poller.shutdown(grace).await;
        match tokio::time::timeout(grace, self.server).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => error!(target: "anka_exporter::exporter", error = %e, "Scrape endpoint task failed"),
            Err(_) => warn!(target: "anka_exporter::exporter", "Scrape endpoint did not stop in time"),
        }

        info!(
            target: "anka_exporter::exporter",
            duration_ms = started.elapsed().as_millis() as u64,
            "Exporter shutdown complete"
        );
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(target: "anka_exporter::exporter", error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(target: "anka_exporter::exporter", error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "anka_exporter::exporter", "Received SIGINT"),
        _ = terminate => info!(target: "anka_exporter::exporter", "Received SIGTERM"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communicator::{
        INSTANCES_ENDPOINT, NODES_ENDPOINT, REGISTRY_DISK_ENDPOINT, REGISTRY_TEMPLATES_ENDPOINT,
        STATUS_ENDPOINT,
    };
    use crate::error::{ApiError, ExporterError};
    use crate::test_support::FakeController;
    use serde_json::json;

    fn config(fake: &FakeController) -> ExporterConfig {
        let mut config = ExporterConfig::default();
        config.controller.address = fake.base_url();
        config.server.listen_address = "127.0.0.1:0".into();
        config.polling.shutdown_grace_secs = 2;
        config
    }

    fn healthy_controller(fake: &FakeController) {
        fake.respond_ok(STATUS_ENDPOINT, json!({ "status": "Running", "registry_status": "Running" }));
        fake.respond_ok(
            NODES_ENDPOINT,
            json!([
                { "node_id": "n1", "node_name": "mac-1", "state": "Active", "host_arch": "arm64" },
                { "node_id": "n2", "node_name": "mac-2", "state": "Active", "host_arch": "arm64" },
            ]),
        );
        fake.respond_ok(INSTANCES_ENDPOINT, json!([]));
        fake.respond_ok(REGISTRY_DISK_ENDPOINT, json!({ "total": 100, "free": 40 }));
        fake.respond_ok(
            REGISTRY_TEMPLATES_ENDPOINT,
            json!([{ "id": "t1", "name": "sonoma", "size": 10 }]),
        );
        fake.respond_ok(
            &format!("{}?id=t1", REGISTRY_TEMPLATES_ENDPOINT),
            json!({ "versions": [{ "tag": "v1", "size": 10 }] }),
        );
    }

    #[tokio::test]
    async fn test_start_serves_polled_metrics() {
        let fake = FakeController::start().await;
        healthy_controller(&fake);

        let exporter = Exporter::new(config(&fake)).unwrap();
        let running = exporter.start().await.unwrap();
        // primed before polling started
        assert_eq!(exporter.context().templates.name_of("t1").as_deref(), Some("sonoma"));

        let url = format!("http://{}/metrics", running.local_addr());
        let mut body = String::new();
        for _ in 0..50 {
            body = reqwest::get(&url).await.unwrap().text().await.unwrap();
            if body.contains("anka_nodes_count 2")
                && body.contains("anka_registry_disk_used_space 60")
                && body.contains("anka_exporter_last_successful_poll_timestamp_seconds{event=\"nodes\"}")
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(body.contains("anka_nodes_count 2"), "{}", body);
        assert!(body.contains("anka_registry_disk_used_space 60"), "{}", body);
        assert!(body.contains("anka_exporter_last_successful_poll_timestamp_seconds{event=\"nodes\"}"));

        assert_eq!(running.stats().len(), EventKind::ALL.len());
        running.stop(Duration::from_secs(2)).await.unwrap();
        assert!(exporter.context().cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_unreachable_controller_is_fatal() {
        let fake = FakeController::start().await;
        fake.respond_fail(STATUS_ENDPOINT, "maintenance");

        let exporter = Exporter::new(config(&fake)).unwrap();
        let err = exporter.start().await.unwrap_err();
        assert!(matches!(
            err,
            ExporterError::Api(ApiError::Upstream { ref message, .. }) if message == "maintenance"
        ));
        assert_eq!(fake.count("GET /api/v1/node"), 0);
    }

    #[tokio::test]
    async fn test_busy_listen_address_starts_no_polling() {
        let fake = FakeController::start().await;
        healthy_controller(&fake);
        let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = config(&fake);
        config.server.listen_address = occupied.local_addr().unwrap().to_string();
        let exporter = Exporter::new(config).unwrap();

        let err = exporter.start().await.unwrap_err();
        assert!(matches!(err, ExporterError::Io(_)));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(fake.count("GET /api/v1/node"), 0);
        assert_eq!(fake.count("GET /api/v1/registry/disk"), 0);
    }

    #[tokio::test]
    async fn test_run_returns_after_shutdown() {
        let fake = FakeController::start().await;
        healthy_controller(&fake);

        let exporter = Arc::new(Exporter::new(config(&fake)).unwrap());
        let handle = tokio::spawn({
            let exporter = exporter.clone();
            async move { exporter.run().await }
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        exporter.shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
