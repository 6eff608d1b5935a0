// ============================================================================
// UAK SESSION (challenge-response login)
// ============================================================================
// A User API Key logs in without sending the private key:
//
//   1. POST {"id"} to /tap/v1/hand    -> base64 RSA-OAEP(SHA-256) ciphertext
//   2. decrypt the secret locally with the private key
//   3. POST {"id","secret"} to /tap/v1/shake -> {"data": <grant>}
//   4. bearer token = base64(JSON(grant))
//
// Renewal is single-flight. Every token carries a generation; a caller that
// saw a rejected token passes that generation to `renew`, and whoever gets
// the renewal lock first performs the handshake. Callers queued behind it
// find the generation moved on and reuse the fresh token.
// ============================================================================

use std::fmt::{self, Debug, Formatter};
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use serde_json::{json, Value as JsonValue};
use sha2::Sha256;
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, instrument};

use crate::config::UakConfig;
use crate::error::{AuthError, AuthResult};

pub const HAND_ENDPOINT: &str = "/tap/v1/hand";
pub const SHAKE_ENDPOINT: &str = "/tap/v1/shake";

// ----------------------------------------------------------------------------
// Key Material
// ----------------------------------------------------------------------------

/// Where the UAK private key comes from.
#[derive(Clone)]
pub enum KeySource {
    /// PEM file (PKCS#1, or PKCS#8 as a fallback)
    File(PathBuf),
    /// Base64-encoded DER
    Inline(String),
}

impl KeySource {
    /// A key file takes precedence over an inline key.
    pub fn from_config(uak: &UakConfig) -> AuthResult<Self> {
        match (&uak.key_path, &uak.key_string) {
            (Some(path), _) => Ok(KeySource::File(path.clone())),
            (None, Some(inline)) if !inline.trim().is_empty() => Ok(KeySource::Inline(inline.clone())),
            _ => Err(AuthError::KeyNotConfigured),
        }
    }
}

impl Debug for KeySource {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::File(path) => f.debug_tuple("File").field(path).finish(),
            KeySource::Inline(_) => f.write_str("Inline(<redacted>)"),
        }
    }
}

pub fn load_private_key(source: &KeySource) -> AuthResult<RsaPrivateKey> {
    match source {
        KeySource::File(path) => {
            let pem = std::fs::read_to_string(path).map_err(|source| AuthError::KeyFile {
                path: path.clone(),
                source,
            })?;
            RsaPrivateKey::from_pkcs1_pem(&pem)
                .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
                .map_err(|e| AuthError::KeyMaterial(format!("{}: {}", path.display(), e)))
        }
        KeySource::Inline(encoded) => {
            let der = STANDARD.decode(encoded.trim())?;
            RsaPrivateKey::from_pkcs1_der(&der)
                .or_else(|_| RsaPrivateKey::from_pkcs8_der(&der))
                .map_err(|e| AuthError::KeyMaterial(e.to_string()))
        }
    }
}

/// Decode and decrypt the `hand` challenge into the cleartext secret.
pub fn decrypt_secret(key: &RsaPrivateKey, encoded: &str) -> AuthResult<String> {
    let ciphertext = STANDARD.decode(encoded.trim())?;
    let mut rng = rand::thread_rng();
    let plaintext = key
        .decrypt_blinded(&mut rng, Oaep::new::<Sha256>(), &ciphertext)
        .map_err(|e| AuthError::Decrypt(e.to_string()))?;
    String::from_utf8(plaintext).map_err(|e| AuthError::Decrypt(e.to_string()))
}

/// Bearer token for a `shake` grant. Object keys serialize in sorted order.
pub fn encode_grant(grant: &JsonValue) -> AuthResult<String> {
    let json = serde_json::to_string(grant)?;
    Ok(STANDARD.encode(json))
}

// ----------------------------------------------------------------------------
// Session
// ----------------------------------------------------------------------------

/// A bearer token and the renewal that produced it.
#[derive(Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub value: String,
    pub generation: u64,
}

impl Debug for BearerToken {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("BearerToken")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

pub struct AuthSession {
    key_id: String,
    key_source: KeySource,
    base_url: String,
    client: reqwest::Client,
    token: ArcSwapOption<BearerToken>,
    renewal: TokioMutex<()>,
}

impl AuthSession {
    pub fn new(
        key_id: impl Into<String>,
        key_source: KeySource,
        base_url: impl Into<String>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            key_source,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            token: ArcSwapOption::empty(),
            renewal: TokioMutex::new(()),
        }
    }

    pub fn from_config(uak: &UakConfig, base_url: &str, client: reqwest::Client) -> AuthResult<Self> {
        Ok(Self::new(
            uak.id.clone(),
            KeySource::from_config(uak)?,
            base_url,
            client,
        ))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn token(&self) -> Option<Arc<BearerToken>> {
        self.token.load_full()
    }

    /// Generation of the current token, 0 before the first login
    pub fn generation(&self) -> u64 {
        self.token.load().as_ref().map_or(0, |t| t.generation)
    }

    /// Obtain a token if none has been issued yet.
    pub async fn login(&self) -> AuthResult<()> {
        self.renew(0).await.map(|_| ())
    }

    /// Replace the token last seen at `observed_generation`.
    ///
    /// Returns `Ok(false)` without contacting the controller when another
    /// caller already renewed it while this one waited.
    #[instrument(skip(self), fields(key_id = %self.key_id))]
    pub async fn renew(&self, observed_generation: u64) -> AuthResult<bool> {
        let _guard = self.renewal.lock().await;

        let current = self.generation();
        if current != observed_generation {
            debug!(
                target: "anka_exporter::auth",
                generation = current,
                "UAK session already renewed"
            );
            return Ok(false);
        }

        let value = self.handshake().await?;
        self.token.store(Some(Arc::new(BearerToken {
            value,
            generation: current + 1,
        })));

        info!(
            target: "anka_exporter::auth",
            key_id = %self.key_id,
            generation = current + 1,
            "Obtained new UAK session"
        );
        Ok(true)
    }

    async fn handshake(&self) -> AuthResult<String> {
        // Bad key material fails before anything goes on the wire
        let key = load_private_key(&self.key_source)?;

        let challenge = self
            .post(HAND_ENDPOINT, json!({ "id": self.key_id }), "hand")
            .await?
            .text()
            .await
            .map_err(|source| AuthError::Request { step: "hand", source })?;
        let secret = decrypt_secret(&key, &challenge)?;

        let grant: JsonValue = self
            .post(
                SHAKE_ENDPOINT,
                json!({ "id": self.key_id, "secret": secret }),
                "shake",
            )
            .await?
            .json()
            .await
            .map_err(|source| AuthError::Request { step: "shake", source })?;

        match grant.get("data") {
            Some(data) if !data.is_null() => encode_grant(data),
            _ => Err(AuthError::MissingGrant),
        }
    }

    async fn post(
        &self,
        endpoint: &str,
        body: JsonValue,
        step: &'static str,
    ) -> AuthResult<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|source| AuthError::Request { step, source })?;

        if !response.status().is_success() {
            return Err(AuthError::Rejected {
                step,
                status: response.status().as_u16(),
            });
        }
        Ok(response)
    }
}

impl Debug for AuthSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession")
            .field("key_id", &self.key_id)
            .field("key_source", &self.key_source)
            .field("base_url", &self.base_url)
            .field("generation", &self.generation())
            .finish()
    }
}
