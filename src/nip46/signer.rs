//! Remote signer facade
//!
//! [`RemoteSigner`] is what applications hold. It validates arguments before
//! anything goes on the wire, forwards to the session, turns raw RPC results
//! into typed values and records every operation in the audit log.
//!
//! Key design decisions:
//! - The user key is cached at connect time; `get_public_key` never round trips
//! - Correlator errors pass through unchanged, so callers can tell a timeout
//!   from a refusal
//! - Event templates are checked here, the signer only ever sees well-formed JSON

use std::sync::Arc;

use nostr::prelude::*;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};

use super::audit::AuditLog;
use super::cipher::CipherPolicy;
use super::config::SessionConfig;
use super::error::{Error, Result};
use super::pool::RelayPool;
use super::session::{Session, SessionStatus};
use super::store::KeyValueStore;

/// An unsigned event as sent in a `sign_event` request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventTemplate {
    pub kind: u16,
    pub content: String,
    pub tags: Vec<Vec<String>>,
    pub created_at: u64,
}

impl EventTemplate {
    pub fn new(kind: u16, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            tags: Vec::new(),
            created_at: Timestamp::now().as_secs(),
        }
    }

    pub fn tag<I, S>(mut self, tag: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.push(tag.into_iter().map(Into::into).collect());
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    /// Validate an arbitrary JSON template
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid("event template must be a JSON object"))?;

        let kind = object
            .get("kind")
            .and_then(Value::as_u64)
            .and_then(|k| u16::try_from(k).ok())
            .ok_or_else(|| invalid("`kind` must be an integer between 0 and 65535"))?;

        let content = object
            .get("content")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("`content` must be a string"))?
            .to_string();

        let tags = object
            .get("tags")
            .and_then(Value::as_array)
            .ok_or_else(|| invalid("`tags` must be an array of string arrays"))?
            .iter()
            .map(|tag| {
                tag.as_array()
                    .and_then(|items| {
                        items
                            .iter()
                            .map(|item| item.as_str().map(str::to_string))
                            .collect::<Option<Vec<_>>>()
                    })
                    .ok_or_else(|| invalid("`tags` must be an array of string arrays"))
            })
            .collect::<Result<Vec<_>>>()?;

        let created_at = match object.get("created_at") {
            None | Some(Value::Null) => Timestamp::now().as_secs(),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| invalid("`created_at` must be a non-negative integer"))?,
        };

        Ok(Self {
            kind,
            content,
            tags,
            created_at,
        })
    }
}

/// Signing and encryption delegated to a NIP-46 remote signer
pub struct RemoteSigner {
    session: Session,
    audit: Arc<Mutex<AuditLog>>,
}

impl RemoteSigner {
    pub fn new(pool: Arc<dyn RelayPool>, store: Arc<dyn KeyValueStore>, config: SessionConfig) -> Self {
        Self {
            session: Session::new(pool, store, config),
            audit: Arc::new(Mutex::new(AuditLog::disabled())),
        }
    }

    pub fn with_audit(mut self, audit: Arc<Mutex<AuditLog>>) -> Self {
        self.audit = audit;
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn connect(&self, connection_string: &str, policy: CipherPolicy) -> Result<PublicKey> {
        let outcome = self.session.connect(connection_string, policy).await;
        self.audit_connect("bunker_connect", &outcome).await;
        outcome
    }

    /// Reconnect from the stored session
    pub async fn restore(&self, policy: CipherPolicy) -> Result<PublicKey> {
        let outcome = self.session.restore(policy).await;
        self.audit_connect("bunker_restore", &outcome).await;
        outcome
    }

    pub async fn disconnect(&self) {
        self.session.disconnect().await;
        self.record("bunker_disconnect", "").await;
    }

    /// Disconnect and erase the stored session
    pub async fn forget(&self) -> Result<()> {
        self.session.forget().await?;
        self.record("bunker_forget", "").await;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.session.watch_status()
    }

    pub fn auth_challenges(&self) -> broadcast::Receiver<String> {
        self.session.auth_challenges()
    }

    /// The user's public key, as reported by the signer during connect
    pub async fn get_public_key(&self) -> Result<PublicKey> {
        if !self.session.is_connected() {
            return Err(Error::NotConnected);
        }
        self.session.user_public_key().ok_or(Error::NotConnected)
    }

    /// Sign a JSON event template
    pub async fn sign_event(&self, template: &Value) -> Result<Event> {
        let template = EventTemplate::from_value(template)?;
        self.sign_template(template).await
    }

    pub async fn sign_template(&self, template: EventTemplate) -> Result<Event> {
        let kind = template.kind;
        self.record("sign_event_request", &format!("kind: {}", kind)).await;

        let outcome = async {
            let encoded = serde_json::to_string(&template)?;
            let result = self.session.request("sign_event", vec![encoded]).await?;
            serde_json::from_value::<Event>(result)
                .map_err(|e| Error::Protocol(format!("signer returned an invalid event: {}", e)))
        }
        .await;

        match &outcome {
            Ok(event) => {
                self.record(
                    "sign_event_success",
                    &format!("event_id: {}, kind: {}", event.id.to_hex(), event.kind.as_u16()),
                )
                .await
            }
            Err(e) => self.record("sign_event_failed", &format!("kind: {}, error: {}", kind, e)).await,
        }
        outcome
    }

    pub async fn nip04_encrypt(&self, peer: &str, plaintext: &str) -> Result<String> {
        self.crypto("nip04_encrypt", peer, plaintext).await
    }

    pub async fn nip04_decrypt(&self, peer: &str, ciphertext: &str) -> Result<String> {
        self.crypto("nip04_decrypt", peer, ciphertext).await
    }

    pub async fn nip44_encrypt(&self, peer: &str, plaintext: &str) -> Result<String> {
        self.crypto("nip44_encrypt", peer, plaintext).await
    }

    pub async fn nip44_decrypt(&self, peer: &str, ciphertext: &str) -> Result<String> {
        self.crypto("nip44_decrypt", peer, ciphertext).await
    }

    async fn crypto(&self, method: &str, peer: &str, text: &str) -> Result<String> {
        let peer = validate_peer(peer)?;
        if text.is_empty() {
            return Err(invalid("text must not be empty"));
        }
        let short_peer = &peer[..16];

        let outcome = async {
            let result = self.session.request(method, vec![peer.clone(), text.to_string()]).await?;
            match result {
                Value::String(s) => Ok(s),
                other => Err(Error::Protocol(format!("{} returned a non-string result: {}", method, other))),
            }
        }
        .await;

        match &outcome {
            Ok(_) => self.record(method, &format!("peer: {}", short_peer)).await,
            Err(e) => {
                self.record(&format!("{}_failed", method), &format!("peer: {}, error: {}", short_peer, e))
                    .await
            }
        }
        outcome
    }

    async fn audit_connect(&self, operation: &str, outcome: &Result<PublicKey>) {
        match outcome {
            Ok(user) => self.record(operation, &format!("user pubkey: {}", user.to_hex())).await,
            Err(e) => self.record(&format!("{}_failed", operation), &e.to_string()).await,
        }
    }

    async fn record(&self, operation: &str, details: &str) {
        self.audit.lock().await.record(operation, details);
    }
}

/// Peer keys go to the signer as 64 lowercase hex characters
fn validate_peer(peer: &str) -> Result<String> {
    if peer.len() != 64 || !peer.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid("peer public key must be 64 hex characters"));
    }
    Ok(peer.to_ascii_lowercase())
}

fn invalid(message: &str) -> Error {
    Error::InvalidInput(message.to_string())
}
