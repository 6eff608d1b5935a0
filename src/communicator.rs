// ============================================================================
// CONTROLLER COMMUNICATOR
// ============================================================================
// One authenticated GET per call, decoded from the `{status, message, body}`
// envelope. An expired UAK session ("Authentication Required") triggers a
// bounded renew-and-refetch cycle. Domain fetches serialize on a single lock
// so instance enrichment never reads the template cache mid-refresh.
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, instrument, warn};

use crate::auth::{AuthSession, BearerToken};
use crate::cache::TemplateCache;
use crate::config::ControllerConfig;
use crate::error::{ApiError, ApiResult, ExporterResult};
use crate::poller::DataSource;
use crate::types::{
    Envelope, EventKind, Instance, Node, Payload, RegistryDisk, Status, Template, TemplateTags,
};
use crate::{DEFAULT_MAX_AUTH_RETRIES, EXPORTER_NAME, EXPORTER_VERSION, STATUS_OK};

pub const STATUS_ENDPOINT: &str = "/api/v1/status";
pub const NODES_ENDPOINT: &str = "/api/v1/node";
pub const INSTANCES_ENDPOINT: &str = "/api/v1/vm";
pub const REGISTRY_DISK_ENDPOINT: &str = "/api/v1/registry/disk";
pub const REGISTRY_TEMPLATES_ENDPOINT: &str = "/api/v1/registry/vm";

// ----------------------------------------------------------------------------
// Credentials
// ----------------------------------------------------------------------------

/// How requests authenticate. Exactly one scheme per exporter.
pub enum Credentials {
    None,
    Basic { username: String, password: String },
    Uak(Arc<AuthSession>),
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::None => f.write_str("None"),
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .finish_non_exhaustive(),
            Credentials::Uak(session) => f.debug_tuple("Uak").field(session).finish(),
        }
    }
}

// ----------------------------------------------------------------------------
// HTTP Client
// ----------------------------------------------------------------------------

/// Build the shared HTTP client with the configured TLS material.
pub fn build_client(config: &ControllerConfig) -> ApiResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .user_agent(format!("{}/{}", EXPORTER_NAME, EXPORTER_VERSION));

    let tls = &config.tls;
    if let Some(ca_cert) = &tls.ca_cert {
        let pem = read_pem(ca_cert)?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ApiError::ClientBuild {
            message: format!("invalid CA certificate {}: {}", ca_cert.display(), e),
        })?;
        builder = builder.add_root_certificate(cert);
    }

    if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_cert_key) {
        let mut pem = read_pem(cert)?;
        pem.push(b'\n');
        pem.extend(read_pem(key)?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| ApiError::ClientBuild {
            message: format!("invalid client certificate {}: {}", cert.display(), e),
        })?;
        builder = builder.identity(identity);
    }

    if tls.skip_verification {
        warn!(target: "anka_exporter::communicator", "TLS certificate verification disabled");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(|e| ApiError::ClientBuild {
        message: e.to_string(),
    })
}

fn read_pem(path: &Path) -> ApiResult<Vec<u8>> {
    std::fs::read(path).map_err(|e| ApiError::ClientBuild {
        message: format!("failed to read {}: {}", path.display(), e),
    })
}

// ----------------------------------------------------------------------------
// Communicator
// ----------------------------------------------------------------------------

pub struct Communicator {
    base_url: String,
    client: reqwest::Client,
    credentials: Credentials,
    templates: Arc<TemplateCache>,
    fetch_lock: TokioMutex<()>,
    max_auth_retries: u32,
}

impl Communicator {
    pub fn new(
        base_url: impl Into<String>,
        client: reqwest::Client,
        credentials: Credentials,
        templates: Arc<TemplateCache>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            credentials,
            templates,
            fetch_lock: TokioMutex::new(()),
            max_auth_retries: DEFAULT_MAX_AUTH_RETRIES,
        }
    }

    pub fn with_max_auth_retries(mut self, retries: u32) -> Self {
        self.max_auth_retries = retries;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn auth_session(&self) -> Option<&Arc<AuthSession>> {
        match &self.credentials {
            Credentials::Uak(session) => Some(session),
            _ => None,
        }
    }

    pub fn templates(&self) -> &Arc<TemplateCache> {
        &self.templates
    }

    /// GET `endpoint` and return the envelope body.
    ///
    /// With a UAK session, an "Authentication Required" answer renews the
    /// session and repeats the request, up to `max_auth_retries` times.
    pub async fn fetch<T>(&self, endpoint: &str) -> ApiResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let Credentials::Uak(session) = &self.credentials else {
            return self.request(endpoint, None).await;
        };

        let mut renewals = 0;
        loop {
            // renewal is keyed to the token actually sent
            let token = session.token();
            let observed = token.as_ref().map_or(0, |t| t.generation);
            match self.request(endpoint, token.as_deref()).await {
                Err(e) if e.is_auth_required() && renewals < self.max_auth_retries => {
                    warn!(
                        target: "anka_exporter::auth",
                        endpoint = endpoint,
                        attempt = renewals + 1,
                        "UAK session expired"
                    );
                    if let Err(e) = session.renew(observed).await {
                        error!(
                            target: "anka_exporter::auth",
                            error = %e,
                            "Could not renew UAK session"
                        );
                    }
                    renewals += 1;
                }
                result => return result,
            }
        }
    }

    async fn request<T>(&self, endpoint: &str, token: Option<&BearerToken>) -> ApiResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let mut request = self.client.get(format!("{}{}", self.base_url, endpoint));
        request = match (&self.credentials, token) {
            (Credentials::Basic { username, password }, _) => request.basic_auth(username, Some(password)),
            (Credentials::Uak(_), Some(token)) => request.bearer_auth(&token.value),
            _ => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| ApiError::transport(endpoint, e))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ApiError::transport(endpoint, e))?;

        let envelope: Envelope<T> = match serde_json::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(ApiError::HttpStatus {
                    endpoint: endpoint.to_string(),
                    status: status.as_u16(),
                })
            }
            Err(e) => return Err(ApiError::decode(endpoint, e.to_string())),
        };

        if envelope.status != STATUS_OK {
            return Err(ApiError::Upstream {
                endpoint: endpoint.to_string(),
                message: envelope.message,
            });
        }
        Ok(envelope.body.unwrap_or_default())
    }

    /// Reachability check against the status endpoint.
    pub async fn test_connection(&self) -> ApiResult<()> {
        self.fetch::<serde_json::Value>(STATUS_ENDPOINT).await?;
        debug!(target: "anka_exporter::communicator", "Status endpoint communication success");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Domain Fetches
    // ------------------------------------------------------------------------

    pub async fn status(&self) -> ApiResult<Status> {
        let _guard = self.fetch_lock.lock().await;
        self.fetch(STATUS_ENDPOINT).await
    }

    pub async fn nodes(&self) -> ApiResult<Vec<Node>> {
        let _guard = self.fetch_lock.lock().await;
        self.fetch(NODES_ENDPOINT).await
    }

    /// Instances, with template names filled from the template cache.
    pub async fn instances(&self) -> ApiResult<Vec<Instance>> {
        let _guard = self.fetch_lock.lock().await;
        let mut instances: Vec<Instance> = self.fetch(INSTANCES_ENDPOINT).await?;

        let known = self.templates.get_all();
        for instance in &mut instances {
            if let Some(entry) = known.get(&instance.vm.template_uuid) {
                instance.vm.template_name = entry.name.clone();
            }
        }
        Ok(instances)
    }

    pub async fn registry_disk(&self) -> ApiResult<RegistryDisk> {
        let _guard = self.fetch_lock.lock().await;
        self.fetch(REGISTRY_DISK_ENDPOINT).await
    }

    /// Registry templates with their tags. A template's tag list is fetched
    /// only when its size differs from the cached one.
    #[instrument(skip(self), level = "debug")]
    pub async fn registry_templates(&self) -> ApiResult<Vec<Template>> {
        let _guard = self.fetch_lock.lock().await;
        let mut templates: Vec<Template> = self.fetch(REGISTRY_TEMPLATES_ENDPOINT).await?;

        for template in &mut templates {
            if let Some(tags) = self.templates.tags_if_unchanged(&template.uuid, template.size) {
                template.tags = tags;
                continue;
            }
            let endpoint = format!("{}?id={}", REGISTRY_TEMPLATES_ENDPOINT, template.uuid);
            let tags: TemplateTags = self.fetch(&endpoint).await.map_err(|e| ApiError::Upstream {
                endpoint: endpoint.clone(),
                message: format!("tags of {}/{}: {}", template.uuid, template.name, e),
            })?;
            template.tags = tags.versions;
        }

        self.templates.merge(&templates);
        Ok(templates)
    }

    /// Fetch the domain behind `kind` as a typed payload
    pub async fn fetch_payload(&self, kind: EventKind) -> ApiResult<Payload> {
        Ok(match kind {
            EventKind::Nodes => Payload::Nodes(self.nodes().await?),
            EventKind::Instances => Payload::Instances(self.instances().await?),
            EventKind::RegistryDisk => Payload::RegistryDisk(self.registry_disk().await?),
            EventKind::RegistryTemplates => Payload::RegistryTemplates(self.registry_templates().await?),
            EventKind::Status => Payload::Status(self.status().await?),
        })
    }
}

impl Debug for Communicator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("base_url", &self.base_url)
            .field("credentials", &self.credentials)
            .field("max_auth_retries", &self.max_auth_retries)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Poll Source
// ----------------------------------------------------------------------------

/// One controller domain as a poll task source.
#[derive(Debug, Clone)]
pub struct DomainSource {
    communicator: Arc<Communicator>,
    kind: EventKind,
}

impl DomainSource {
    pub fn new(communicator: Arc<Communicator>, kind: EventKind) -> Self {
        Self { communicator, kind }
    }
}

#[async_trait]
impl DataSource for DomainSource {
    fn event(&self) -> EventKind {
        self.kind
    }

    async fn fetch(&self) -> ExporterResult<Payload> {
        Ok(self.communicator.fetch_payload(self.kind).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{encode_grant, KeySource, HAND_ENDPOINT, SHAKE_ENDPOINT};
    use crate::test_support::{test_key, FakeController};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use pretty_assertions::assert_eq;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::{Oaep, RsaPublicKey};
    use serde_json::json;
    use sha2::Sha256;

    fn plain(fake: &FakeController) -> Communicator {
        Communicator::new(
            fake.base_url(),
            reqwest::Client::new(),
            Credentials::None,
            Arc::new(TemplateCache::new()),
        )
    }

    fn with_uak(fake: &FakeController) -> Communicator {
        let key = test_key();
        let challenge = RsaPublicKey::from(key)
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), b"s3cret")
            .unwrap();
        fake.respond_post(HAND_ENDPOINT, 200, STANDARD.encode(challenge));
        fake.respond_post(SHAKE_ENDPOINT, 200, json!({ "data": { "sid": "abc" } }).to_string());

        let source = KeySource::Inline(STANDARD.encode(key.to_pkcs1_der().unwrap().as_bytes()));
        let session = AuthSession::new("exporter", source, fake.base_url(), reqwest::Client::new());
        Communicator::new(
            fake.base_url(),
            reqwest::Client::new(),
            Credentials::Uak(Arc::new(session)),
            Arc::new(TemplateCache::new()),
        )
    }

    #[tokio::test]
    async fn test_fetch_decodes_envelope() {
        let fake = FakeController::start().await;
        fake.respond_ok(NODES_ENDPOINT, json!([{ "node_id": "n1", "node_name": "mac-1", "cpu_count": 8 }]));

        let nodes = plain(&fake).nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].node_id, "n1");
        assert_eq!(nodes[0].cpu_count, 8);
    }

    #[tokio::test]
    async fn test_non_ok_status_surfaces_message() {
        let fake = FakeController::start().await;
        fake.respond_fail(NODES_ENDPOINT, "Database unavailable");

        let err = plain(&fake).nodes().await.unwrap_err();
        assert!(matches!(err, ApiError::Upstream { ref message, .. } if message == "Database unavailable"));
        assert_eq!(fake.count("GET /api/v1/node"), 1);
    }

    #[tokio::test]
    async fn test_unparsable_error_reports_http_status() {
        let fake = FakeController::start().await;
        fake.respond_get(NODES_ENDPOINT, 502, "<html>Bad Gateway</html>".into());

        let err = plain(&fake).nodes().await.unwrap_err();
        assert!(matches!(err, ApiError::HttpStatus { status: 502, .. }));
    }

    #[tokio::test]
    async fn test_basic_credentials_are_sent() {
        let fake = FakeController::start().await;
        fake.respond_ok(STATUS_ENDPOINT, json!({ "status": "Running" }));

        let communicator = Communicator::new(
            fake.base_url(),
            reqwest::Client::new(),
            Credentials::Basic {
                username: "admin".into(),
                password: "pw".into(),
            },
            Arc::new(TemplateCache::new()),
        );
        communicator.test_connection().await.unwrap();

        let sent = fake.requests("GET /api/v1/status");
        let expected = format!("Basic {}", STANDARD.encode("admin:pw"));
        assert_eq!(sent[0].authorization.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_expired_session_is_retried_a_bounded_number_of_times() {
        let fake = FakeController::start().await;
        fake.respond_fail(NODES_ENDPOINT, "Authentication Required");

        let communicator = with_uak(&fake);
        let err = communicator.nodes().await.unwrap_err();

        assert!(err.is_auth_required());
        assert_eq!(fake.count("GET /api/v1/node"), 3);
        assert_eq!(fake.count("POST /tap/v1/hand"), 2);
        assert_eq!(fake.count("POST /tap/v1/shake"), 2);
    }

    #[tokio::test]
    async fn test_each_retry_renews_the_token_it_sent() {
        let fake = FakeController::start().await;
        fake.respond_fail(NODES_ENDPOINT, "Authentication Required");

        let communicator = with_uak(&fake);
        let session = communicator.auth_session().unwrap().clone();
        session.login().await.unwrap();
        // renewed elsewhere before this fetch
        assert!(session.renew(1).await.unwrap());

        communicator.nodes().await.unwrap_err();

        let bearer = format!("Bearer {}", encode_grant(&json!({ "sid": "abc" })).unwrap());
        let sent = fake.requests("GET /api/v1/node");
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|r| r.authorization.as_deref() == Some(bearer.as_str())));
        // login, the outside renewal, then one handshake per retry
        assert_eq!(fake.count("POST /tap/v1/hand"), 4);
        assert_eq!(session.generation(), 4);
    }

    #[tokio::test]
    async fn test_bearer_token_sent_after_login() {
        let fake = FakeController::start().await;
        fake.respond_ok(STATUS_ENDPOINT, json!({ "status": "Running" }));

        let communicator = with_uak(&fake);
        communicator.auth_session().unwrap().login().await.unwrap();
        let status = communicator.status().await.unwrap();
        assert_eq!(status.status, "Running");

        let expected = format!("Bearer {}", encode_grant(&json!({ "sid": "abc" })).unwrap());
        let sent = fake.requests("GET /api/v1/status").pop().unwrap();
        assert_eq!(sent.authorization.as_deref(), Some(expected.as_str()));
    }

    #[tokio::test]
    async fn test_template_tags_fetched_only_on_size_change() {
        let fake = FakeController::start().await;
        let communicator = plain(&fake);
        fake.respond_ok(
            REGISTRY_TEMPLATES_ENDPOINT,
            json!([{ "id": "t1", "name": "sonoma", "size": 100 }]),
        );
        fake.respond_ok(
            "/api/v1/registry/vm?id=t1",
            json!({ "versions": [{ "tag": "v1", "size": 100 }] }),
        );

        let first = communicator.registry_templates().await.unwrap();
        assert_eq!(first[0].tags.len(), 1);
        assert_eq!(fake.count("GET /api/v1/registry/vm?id=t1"), 1);

        // same size: cached tags, no tag request
        let second = communicator.registry_templates().await.unwrap();
        assert_eq!(second[0].tags, first[0].tags);
        assert_eq!(fake.count("GET /api/v1/registry/vm?id=t1"), 1);

        // size changed: exactly one more tag request, tags replaced
        fake.respond_ok(
            REGISTRY_TEMPLATES_ENDPOINT,
            json!([{ "id": "t1", "name": "sonoma", "size": 250 }]),
        );
        fake.respond_ok(
            "/api/v1/registry/vm?id=t1",
            json!({ "versions": [{ "tag": "v1", "size": 100 }, { "tag": "v2", "size": 150 }] }),
        );
        let third = communicator.registry_templates().await.unwrap();
        assert_eq!(fake.count("GET /api/v1/registry/vm?id=t1"), 2);
        assert_eq!(third[0].tags.len(), 2);
        assert_eq!(communicator.templates().get("t1").unwrap().tags.len(), 2);
    }

    #[tokio::test]
    async fn test_instances_are_enriched_with_template_names() {
        let fake = FakeController::start().await;
        let communicator = plain(&fake);
        communicator.templates().merge(&[Template {
            uuid: "t1".into(),
            name: "sonoma".into(),
            size: 1,
            tags: vec![],
        }]);
        fake.respond_ok(
            INSTANCES_ENDPOINT,
            json!([
                { "instance_id": "i1", "vm": { "instance_state": "Started", "vmid": "t1" } },
                { "instance_id": "i2", "vm": { "instance_state": "Started", "vmid": "t9" } }
            ]),
        );

        let instances = communicator.instances().await.unwrap();
        assert_eq!(instances[0].vm.template_name, "sonoma");
        assert_eq!(instances[1].vm.template_name, "");
    }

    #[tokio::test]
    async fn test_domain_source_wraps_payload() {
        let fake = FakeController::start().await;
        fake.respond_ok(REGISTRY_DISK_ENDPOINT, json!({ "total": 100, "free": 25 }));

        let source = DomainSource::new(Arc::new(plain(&fake)), EventKind::RegistryDisk);
        let payload = source.fetch().await.unwrap();

        assert_eq!(source.event(), EventKind::RegistryDisk);
        assert_eq!(payload, Payload::RegistryDisk(RegistryDisk { total: 100, free: 25 }));
    }
}
