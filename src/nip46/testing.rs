//! In-memory relay pool and a scripted remote signer for tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr::nips::{nip04, nip44};
use nostr::prelude::*;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::cipher::{CipherHandle, CipherScheme};
use super::error::{Error, Result};
use super::pool::{PoolSubscription, PublishOutcome, RelayPool, SubscriptionEvent};

/// Poll `cond` until it holds, failing the test after two seconds
pub(crate) async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s");
}

#[derive(Default)]
struct PoolState {
    subscriptions: HashMap<String, mpsc::UnboundedSender<SubscriptionEvent>>,
    next_id: u64,
    subscribe_calls: usize,
    published: Vec<Event>,
    fail_publish: bool,
}

/// Relay pool that lives in memory. Every published request is shown to
/// the attached [`MockSigner`]; its reply is delivered once per relay,
/// so tests see the same duplicates a real multi-relay setup produces.
#[derive(Default)]
pub(crate) struct MockPool {
    state: Mutex<PoolState>,
    signer: Option<Arc<MockSigner>>,
}

impl MockPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_signer(signer: Arc<MockSigner>) -> Self {
        Self {
            state: Mutex::new(PoolState::default()),
            signer: Some(signer),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap()
    }

    /// Push `event` into every live subscription `copies` times
    pub fn deliver(&self, event: Event, copies: usize) {
        let state = self.state();
        for tx in state.subscriptions.values() {
            for _ in 0..copies {
                let _ = tx.send(SubscriptionEvent::Event(Box::new(event.clone())));
            }
        }
    }

    /// Relay-initiated CLOSED on every live subscription
    pub fn close_subscriptions(&self, reason: &str) {
        let mut state = self.state();
        for (_, tx) in state.subscriptions.drain() {
            let _ = tx.send(SubscriptionEvent::Closed(reason.to_string()));
        }
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state().fail_publish = fail;
    }

    pub fn subscribe_calls(&self) -> usize {
        self.state().subscribe_calls
    }

    pub fn live_subscriptions(&self) -> usize {
        self.state().subscriptions.len()
    }

    pub fn published(&self) -> Vec<Event> {
        self.state().published.clone()
    }
}

#[async_trait]
impl RelayPool for MockPool {
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishOutcome> {
        {
            let mut state = self.state();
            if state.fail_publish {
                return Err(Error::Transport("all relays refused".to_string()));
            }
            state.published.push(event.clone());
        }

        if let Some(reply) = self.signer.as_ref().and_then(|s| s.handle(event)) {
            self.deliver(reply, relays.len());
        }

        Ok(PublishOutcome {
            success: relays.to_vec(),
            failed: Vec::new(),
        })
    }

    async fn subscribe(&self, _relays: &[String], _filter: Filter) -> Result<PoolSubscription> {
        let mut state = self.state();
        state.next_id += 1;
        state.subscribe_calls += 1;
        let id = format!("mock-{}", state.next_id);
        let (tx, rx) = mpsc::unbounded_channel();
        state.subscriptions.insert(id.clone(), tx);
        Ok(PoolSubscription { id, events: rx })
    }

    async fn unsubscribe(&self, id: &str) {
        self.state().subscriptions.remove(id);
    }

    async fn query(&self, _relays: &[String], _filter: Filter, _timeout: Duration) -> Result<Vec<Event>> {
        Ok(self.published())
    }
}

#[derive(Default)]
struct SignerState {
    authorized: HashSet<PublicKey>,
    calls: Vec<String>,
    silent: HashSet<String>,
    errors: HashMap<String, String>,
}

/// A scripted bunker. It reads requests in either cipher, the way deployed
/// signers do, but always answers in `scheme`.
pub(crate) struct MockSigner {
    pub keys: Keys,
    pub user: Keys,
    pub scheme: CipherScheme,
    state: Mutex<SignerState>,
}

impl MockSigner {
    pub fn new(scheme: CipherScheme) -> Arc<Self> {
        Arc::new(Self {
            keys: Keys::generate(),
            user: Keys::generate(),
            scheme,
            state: Mutex::new(SignerState::default()),
        })
    }

    pub fn bunker_uri(&self, secret: Option<&str>) -> String {
        let mut uri = format!(
            "bunker://{}?relay=wss://relay.example&relay=wss://relay2.example",
            self.keys.public_key().to_hex()
        );
        if let Some(secret) = secret {
            uri.push_str("&secret=");
            uri.push_str(secret);
        }
        uri
    }

    /// Never answer `method`
    pub fn stay_silent_on(&self, method: &str) {
        self.state.lock().unwrap().silent.insert(method.to_string());
    }

    /// Answer `method` with an error
    pub fn fail(&self, method: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .errors
            .insert(method.to_string(), message.to_string());
    }

    /// Forget every authorized client key
    pub fn revoke_all(&self) {
        self.state.lock().unwrap().authorized.clear();
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Decode a request envelope addressed to this signer.
    ///
    /// Reads either cipher but always answers in `scheme`, so a mismatch
    /// shows up client side as an undecryptable reply. A real NIP-04-only
    /// signer would stay silent on a NIP-44 request instead, and negotiation
    /// does not move on from a silent signer: that case ends in a timeout.
    pub fn open_request(&self, request: &Event) -> Option<Value> {
        if request.kind != Kind::NostrConnect
            || !request.tags.public_keys().any(|pk| *pk == self.keys.public_key())
        {
            return None;
        }
        let sk = self.keys.secret_key();
        let plaintext = nip44::decrypt(sk, &request.pubkey, &request.content)
            .or_else(|_| nip04::decrypt(sk, &request.pubkey, &request.content))
            .ok()?;
        serde_json::from_str(&plaintext).ok()
    }

    /// Build a reply envelope for `client` carrying `payload`
    pub fn reply(&self, client: &PublicKey, payload: &Value) -> Event {
        let content = CipherHandle::new(self.scheme)
            .encrypt(&payload.to_string(), self.keys.secret_key(), client)
            .unwrap();
        EventBuilder::new(Kind::NostrConnect, content)
            .tag(Tag::public_key(*client))
            .sign_with_keys(&self.keys)
            .unwrap()
    }

    fn handle(&self, request: &Event) -> Option<Event> {
        let body = self.open_request(request)?;
        let id = body["id"].as_str()?.to_string();
        let method = body["method"].as_str()?.to_string();
        let params: Vec<String> = body["params"]
            .as_array()
            .map(|a| a.iter().filter_map(|p| p.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.calls.push(method.clone());
            if state.silent.contains(&method) {
                return None;
            }
            match state.errors.get(&method) {
                Some(message) => Err(message.clone()),
                None => {
                    if method == "connect" {
                        state.authorized.insert(request.pubkey);
                    }
                    let authorized = state.authorized.contains(&request.pubkey);
                    drop(state);
                    self.execute(&method, &params, authorized)
                }
            }
        };

        let payload = match outcome {
            Ok(result) => json!({ "id": id, "result": result }),
            Err(error) => json!({ "id": id, "result": "", "error": error }),
        };
        Some(self.reply(&request.pubkey, &payload))
    }

    fn execute(&self, method: &str, params: &[String], authorized: bool) -> Result<String, String> {
        if !authorized {
            return Err("unauthorized client".to_string());
        }
        let sk = self.user.secret_key();
        let peer = || {
            params
                .first()
                .and_then(|p| PublicKey::from_hex(p).ok())
                .ok_or_else(|| "bad pubkey".to_string())
        };
        let text = || params.get(1).cloned().ok_or_else(|| "missing text".to_string());

        match method {
            "connect" | "disconnect" => Ok("ack".to_string()),
            "ping" => Ok("pong".to_string()),
            "get_public_key" => Ok(self.user.public_key().to_hex()),
            "sign_event" => {
                let template: Value = params
                    .first()
                    .and_then(|p| serde_json::from_str(p).ok())
                    .ok_or_else(|| "bad template".to_string())?;
                let tags = template["tags"]
                    .as_array()
                    .map(|tags| {
                        tags.iter()
                            .filter_map(|t| {
                                let parts: Vec<String> = t
                                    .as_array()?
                                    .iter()
                                    .filter_map(|p| p.as_str().map(str::to_string))
                                    .collect();
                                Tag::parse(parts).ok()
                            })
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default();
                let kind = template["kind"].as_u64().unwrap_or(1) as u16;
                let event = EventBuilder::new(Kind::from(kind), template["content"].as_str().unwrap_or(""))
                    .tags(tags)
                    .custom_created_at(Timestamp::from(template["created_at"].as_u64().unwrap_or(0)))
                    .sign_with_keys(&self.user)
                    .map_err(|e| e.to_string())?;
                Ok(event.as_json())
            }
            "nip04_encrypt" => nip04::encrypt(sk, &peer()?, text()?).map_err(|e| e.to_string()),
            "nip04_decrypt" => nip04::decrypt(sk, &peer()?, text()?).map_err(|e| e.to_string()),
            "nip44_encrypt" => {
                nip44::encrypt(sk, &peer()?, text()?, nip44::Version::V2).map_err(|e| e.to_string())
            }
            "nip44_decrypt" => nip44::decrypt(sk, &peer()?, text()?).map_err(|e| e.to_string()),
            other => Err(format!("unsupported method {}", other)),
        }
    }
}
