// ============================================================================
// EXPORTER CONTEXT
// ============================================================================
// Shared state built once at startup and handed to the pollers, the
// communicator, the metric handlers and the scrape endpoint.
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::AuthSession;
use crate::cache::TemplateCache;
use crate::cardinality::CardinalityGuard;
use crate::communicator::{build_client, Communicator, Credentials};
use crate::config::{CardinalityConfig, ExporterConfig, PollingConfig};
use crate::error::ExporterResult;
use crate::interval::{IntervalController, PollInterval};
use crate::poller::{EventBus, Poller, PollerMetrics};

pub struct ExporterContext {
    pub bus: Arc<EventBus>,
    pub interval: Arc<PollInterval>,
    pub interval_controller: Arc<IntervalController>,
    pub templates: Arc<TemplateCache>,
    pub cardinality: Arc<CardinalityGuard>,
    pub registry: Registry,
    pub auth: Option<Arc<AuthSession>>,
    pub client: reqwest::Client,
    pub cancel: CancellationToken,
}

impl ExporterContext {
    /// Context without credentials, using a default HTTP client.
    pub fn new(polling: &PollingConfig, cardinality: &CardinalityConfig) -> Self {
        let interval = Arc::new(PollInterval::new(
            polling.interval_secs,
            polling.max_interval_secs,
        ));

        Self {
            bus: Arc::new(EventBus::new()),
            interval_controller: Arc::new(IntervalController::new(interval.clone())),
            interval,
            templates: Arc::new(TemplateCache::new()),
            cardinality: Arc::new(CardinalityGuard::new(Duration::from_secs(
                cardinality.reset_ttl_secs,
            ))),
            registry: Registry::new(),
            auth: None,
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_auth(mut self, session: Arc<AuthSession>) -> Self {
        self.auth = Some(session);
        self
    }

    /// Build the HTTP client and, when a UAK is configured, the auth session.
    pub fn from_config(config: &ExporterConfig) -> ExporterResult<Self> {
        let client = build_client(&config.controller)?;
        let mut context = Self::new(&config.polling, &config.cardinality).with_client(client);

        if let Some(uak) = &config.controller.uak {
            let session =
                AuthSession::from_config(uak, config.controller.base_url(), context.client.clone())?;
            info!(
                target: "anka_exporter::context",
                key_id = session.key_id(),
                "UAK authentication configured"
            );
            context = context.with_auth(Arc::new(session));
        }

        Ok(context)
    }

    /// Credentials implied by the configuration: Basic when both username
    /// and password are set, the UAK session when one exists, else none.
    pub fn credentials(&self, config: &ExporterConfig) -> Credentials {
        let controller = &config.controller;
        match (&controller.username, &controller.password, &self.auth) {
            (Some(username), Some(password), _) if !username.is_empty() && !password.is_empty() => {
                Credentials::Basic {
                    username: username.clone(),
                    password: password.clone(),
                }
            }
            (_, _, Some(session)) => Credentials::Uak(session.clone()),
            _ => Credentials::None,
        }
    }

    pub fn communicator(&self, config: &ExporterConfig) -> Communicator {
        Communicator::new(
            config.controller.base_url(),
            self.client.clone(),
            self.credentials(config),
            self.templates.clone(),
        )
        .with_max_auth_retries(config.polling.max_auth_retries)
    }

    /// Poller bound to this context's bus, interval and cancellation token.
    pub fn poller(&self, polling: &PollingConfig) -> ExporterResult<Poller> {
        Ok(Poller::new(
            self.bus.clone(),
            self.interval.clone(),
            Duration::from_secs(polling.error_backoff_secs),
            PollerMetrics::register(&self.registry)?,
            self.cancel.clone(),
        ))
    }
}

impl Debug for ExporterContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterContext")
            .field("bus", &self.bus)
            .field("interval", &self.interval)
            .field("templates", &self.templates.len())
            .field("auth", &self.auth)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UakConfig;

    fn config() -> ExporterConfig {
        let mut config = ExporterConfig::default();
        config.controller.address = "http://controller:8090/".into();
        config
    }

    #[test]
    fn test_basic_credentials_selected() {
        let mut config = config();
        config.controller.username = Some("admin".into());
        config.controller.password = Some("secret".into());

        let context = ExporterContext::from_config(&config).unwrap();
        assert!(context.auth.is_none());
        assert!(matches!(
            context.credentials(&config),
            Credentials::Basic { ref username, .. } if username == "admin"
        ));
    }

    #[test]
    fn test_uak_session_built_from_config() {
        let mut config = config();
        config.controller.uak = Some(UakConfig {
            id: "exporter".into(),
            key_path: None,
            key_string: Some("ZmFrZQ==".into()),
        });

        let context = ExporterContext::from_config(&config).unwrap();
        let session = context.auth.clone().unwrap();
        assert_eq!(session.key_id(), "exporter");
        assert!(matches!(context.credentials(&config), Credentials::Uak(_)));

        let communicator = context.communicator(&config);
        assert_eq!(communicator.base_url(), "http://controller:8090");
        assert!(communicator.auth_session().is_some());
    }

    #[test]
    fn test_no_credentials() {
        let config = config();
        let context = ExporterContext::from_config(&config).unwrap();
        assert!(matches!(context.credentials(&config), Credentials::None));
        assert_eq!(context.interval.secs(), config.polling.interval_secs);
    }
}
