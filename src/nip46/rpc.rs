//! Encrypted request/response correlation
//!
//! Requests go out as kind 24133 envelopes to every relay of the target.
//! Responses come back through the subscription, get decrypted here and are
//! matched to the pending request by id. Each pending entry is settled
//! exactly once: by its response, its deadline, or a session shutdown,
//! whichever removes it from the map first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nostr::prelude::*;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cipher::CipherHandle;
use super::error::{Error, Result};
use super::pool::RelayPool;

/// The one method whose result is a JSON-encoded event string
const SIGN_EVENT: &str = "sign_event";
/// `result` value announcing an auth challenge; the URL rides in `error`
const AUTH_URL: &str = "auth_url";

type Outcome = Result<Value>;

struct PendingRequest {
    method: String,
    created_at: Instant,
    deadline: Instant,
    challenged: bool,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Debug, Deserialize)]
struct Response {
    id: String,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

/// Tracks in-flight requests for one ephemeral identity and cipher
pub struct Correlator {
    pool: Arc<dyn RelayPool>,
    relays: Vec<String>,
    signer: PublicKey,
    cipher: CipherHandle,
    app_name: Option<String>,
    keys: Mutex<Option<Keys>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    auth_urls: broadcast::Sender<String>,
}

impl Correlator {
    pub fn new(
        pool: Arc<dyn RelayPool>,
        relays: Vec<String>,
        signer: PublicKey,
        keys: Keys,
        cipher: CipherHandle,
        app_name: Option<String>,
        auth_urls: broadcast::Sender<String>,
    ) -> Self {
        Self {
            pool,
            relays,
            signer,
            cipher,
            app_name,
            keys: Mutex::new(Some(keys)),
            pending: Mutex::new(HashMap::new()),
            auth_urls,
        }
    }

    pub fn cipher(&self) -> CipherHandle {
        self.cipher
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    /// Send `method` and wait for the signer's answer, at most `timeout`
    pub async fn request(&self, method: &str, params: Vec<String>, timeout: Duration) -> Result<Value> {
        let keys = self.keys()?;
        let (id, mut rx) = self.register(method, timeout);

        let envelope = match self.envelope(&keys, &id, method, &params) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.take(&id);
                return Err(e);
            }
        };

        debug!("sending {} request {} to {} relay(s)", method, id, self.relays.len());
        match self.pool.publish(&self.relays, &envelope).await {
            Ok(outcome) => {
                for (relay, reason) in &outcome.failed {
                    debug!("relay {} refused request {}: {}", relay, id, reason);
                }
            }
            Err(e) => {
                self.take(&id);
                return Err(e);
            }
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without a value: the correlator itself went away
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => match self.take(&id) {
                Some(request) => {
                    warn!(
                        "{} request {} timed out after {:?} (deadline {:?} past)",
                        request.method,
                        id,
                        request.created_at.elapsed(),
                        request.deadline.elapsed()
                    );
                    Err(Error::timeout(method))
                }
                // Settled by a response or shutdown as the deadline hit
                None => rx.try_recv().unwrap_or_else(|_| Err(Error::timeout(method))),
            },
        }
    }

    /// Publish a request nobody waits for
    pub async fn notify(&self, method: &str, params: Vec<String>) -> Result<()> {
        let keys = self.keys()?;
        let id = random_id();
        let envelope = self.envelope(&keys, &id, method, &params)?;
        self.pool.publish(&self.relays, &envelope).await?;
        Ok(())
    }

    /// Handle one inbound envelope. Unknown and already settled ids are
    /// dropped without complaint: every relay delivers its own copy.
    pub fn deliver(&self, event: &Event) {
        let Some(keys) = self.keys_opt() else {
            return;
        };

        let plaintext = match self.cipher.decrypt(&event.content, keys.secret_key(), &self.signer) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                self.reject_undecryptable(e);
                return;
            }
        };

        let response: Response = match serde_json::from_str(&plaintext) {
            Ok(response) => response,
            Err(e) => {
                warn!("dropping malformed response envelope {}: {}", event.id, e);
                return;
            }
        };

        let mut pending = self.lock_pending();

        if response.result.as_ref().and_then(Value::as_str) == Some(AUTH_URL) {
            if let Some(request) = pending.get_mut(&response.id) {
                let url = response.error.as_ref().and_then(Value::as_str).unwrap_or_default();
                if !request.challenged && !url.is_empty() {
                    request.challenged = true;
                    info!("remote signer asks for authorization of {}: {}", request.method, url);
                    let _ = self.auth_urls.send(url.to_string());
                }
            }
            return;
        }

        let Some(request) = pending.remove(&response.id) else {
            debug!("discarding response for unknown or settled request {}", response.id);
            return;
        };
        let outcome = settle(&request.method, response);
        if let Err(e) = &outcome {
            debug!("{} request failed: {}", request.method, e);
        }
        // Sent under the lock so a racing timeout always finds the value
        let _ = request.tx.send(outcome);
    }

    /// Reject everything still pending and forget the ephemeral key
    pub fn shutdown(&self) {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).take();
        let drained: Vec<PendingRequest> = self.lock_pending().drain().map(|(_, r)| r).collect();
        if !drained.is_empty() {
            debug!("rejecting {} pending request(s) on shutdown", drained.len());
        }
        for request in drained {
            let _ = request.tx.send(Err(Error::Disconnected));
        }
    }

    /// Feed envelopes from `inbox` into [`Correlator::deliver`] until the
    /// sending side goes away
    pub fn spawn_pump(self: &Arc<Self>, mut inbox: mpsc::UnboundedReceiver<Event>) -> JoinHandle<()> {
        let correlator = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = inbox.recv().await {
                correlator.deliver(&event);
            }
            debug!("response pump ended");
        })
    }

    fn register(&self, method: &str, timeout: Duration) -> (String, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let mut pending = self.lock_pending();
        let id = loop {
            let id = random_id();
            if !pending.contains_key(&id) {
                break id;
            }
        };
        pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                created_at: now,
                deadline: now + timeout,
                challenged: false,
                tx,
            },
        );
        (id, rx)
    }

    fn take(&self, id: &str) -> Option<PendingRequest> {
        self.lock_pending().remove(id)
    }

    /// The request id lives inside the ciphertext, so an envelope from the
    /// signer that does not decrypt cannot be attributed. It means the
    /// signer speaks another cipher, and every pending request fails with it.
    fn reject_undecryptable(&self, error: Error) {
        let reason = match error {
            Error::Decrypt(reason) => reason,
            other => other.to_string(),
        };
        let drained: Vec<PendingRequest> = self.lock_pending().drain().map(|(_, r)| r).collect();
        if drained.is_empty() {
            warn!("dropping undecryptable envelope, nothing pending: {}", reason);
            return;
        }
        warn!(
            "response could not be decrypted ({}), failing {} pending request(s)",
            reason,
            drained.len()
        );
        for request in drained {
            debug!("{} request failed to decrypt", request.method);
            let _ = request.tx.send(Err(Error::Decrypt(reason.clone())));
        }
    }

    fn envelope(&self, keys: &Keys, id: &str, method: &str, params: &[String]) -> Result<Event> {
        let payload = json!({ "id": id, "method": method, "params": params }).to_string();
        let content = self.cipher.encrypt(&payload, keys.secret_key(), &self.signer)?;

        let mut builder = EventBuilder::new(Kind::NostrConnect, content).tag(Tag::public_key(self.signer));
        if let Some(app) = &self.app_name {
            builder = builder.tag(Tag::custom(TagKind::custom("client"), [app.as_str()]));
        }
        builder
            .sign_with_keys(keys)
            .map_err(|e| Error::Protocol(format!("failed to sign envelope: {}", e)))
    }

    fn keys(&self) -> Result<Keys> {
        self.keys_opt().ok_or(Error::NotConnected)
    }

    fn keys_opt(&self) -> Option<Keys> {
        self.keys.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Turn a matched response into the caller's outcome
fn settle(method: &str, response: Response) -> Outcome {
    let error = match response.error {
        Some(Value::String(s)) if s.is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Null) | None => None,
        Some(other) => Some(other.to_string()),
    };
    if let Some(message) = error {
        return Err(Error::remote(message));
    }

    let result = response
        .result
        .ok_or_else(|| Error::Protocol(format!("{} response has neither result nor error", method)))?;

    if method == SIGN_EVENT {
        return match result {
            Value::String(encoded) => serde_json::from_str(&encoded)
                .map_err(|e| Error::Protocol(format!("signed event is not valid JSON: {}", e))),
            Value::Object(_) => Ok(result),
            other => Err(Error::Protocol(format!("unexpected sign_event result: {}", other))),
        };
    }
    Ok(result)
}

fn random_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}
