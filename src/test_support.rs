//! Fake controller for tests: a real axum server on an ephemeral port that
//! records every request and answers from a table of canned responses.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use parking_lot::Mutex;
use rsa::RsaPrivateKey;
use serde_json::{json, Value as JsonValue};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub key: String,
    pub authorization: Option<String>,
    pub body: String,
}

#[derive(Debug, Default)]
struct FakeState {
    responses: Mutex<HashMap<String, (u16, String)>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeController {
    base_url: String,
    state: Arc<FakeState>,
}

impl FakeController {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let app = Router::new().fallback(handle).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    pub fn base_url(&self) -> String {
        self.base_url.clone()
    }

    pub fn respond_get(&self, path: &str, status: u16, body: String) {
        self.state
            .responses
            .lock()
            .insert(format!("GET {}", path), (status, body));
    }

    pub fn respond_post(&self, path: &str, status: u16, body: String) {
        self.state
            .responses
            .lock()
            .insert(format!("POST {}", path), (status, body));
    }

    /// Answer `GET path` with an OK envelope around `body`
    pub fn respond_ok(&self, path: &str, body: JsonValue) {
        self.respond_get(
            path,
            200,
            json!({ "status": "OK", "message": "", "body": body }).to_string(),
        );
    }

    /// Answer `GET path` with a failed envelope
    pub fn respond_fail(&self, path: &str, message: &str) {
        self.respond_get(
            path,
            200,
            json!({ "status": "FAIL", "message": message }).to_string(),
        );
    }

    pub fn count(&self, key: &str) -> usize {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.key == key)
            .count()
    }

    pub fn requests(&self, key: &str) -> Vec<RecordedRequest> {
        self.state
            .requests
            .lock()
            .iter()
            .filter(|r| r.key == key)
            .cloned()
            .collect()
    }

    pub fn last_body(&self, key: &str) -> Option<String> {
        self.requests(key).pop().map(|r| r.body)
    }
}

async fn handle(
    State(state): State<Arc<FakeState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> (StatusCode, String) {
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let key = format!("{} {}", method, path);

    state.requests.lock().push(RecordedRequest {
        key: key.clone(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    match state.responses.lock().get(&key) {
        Some((status, body)) => (
            StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body.clone(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            json!({ "status": "FAIL", "message": format!("no route for {}", key) }).to_string(),
        ),
    }
}

/// One RSA key shared by every test; generation is slow in debug builds.
pub(crate) fn test_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
}

/// A key that is not the UAK's, for challenges the exporter cannot decrypt.
pub(crate) fn foreign_key() -> &'static RsaPrivateKey {
    static KEY: OnceLock<RsaPrivateKey> = OnceLock::new();
    KEY.get_or_init(|| RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap())
}
