//! Relay pool contract and the nostr-sdk backed implementation
//!
//! The session engine never talks to websockets directly. It publishes
//! signed envelopes and opens one subscription through a [`RelayPool`],
//! which may be shared with unrelated parts of the host application.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use nostr_sdk::prelude::*;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::{Error, Result};

/// Time given to freshly added relays to finish their websocket handshake
const CONNECT_SETTLE: Duration = Duration::from_secs(2);

/// What a subscription delivers
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Event(Box<Event>),
    /// End of stored events
    Eose,
    /// The relays closed the subscription
    Closed(String),
}

/// A live subscription. The stream ending also means closed.
#[derive(Debug)]
pub struct PoolSubscription {
    pub id: String,
    pub events: mpsc::UnboundedReceiver<SubscriptionEvent>,
}

/// Per-relay result of a publish
#[derive(Debug, Clone, Default)]
pub struct PublishOutcome {
    pub success: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[async_trait]
pub trait RelayPool: Send + Sync {
    /// Best-effort publish to every listed relay. Errors only when no relay accepted it.
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishOutcome>;

    async fn subscribe(&self, relays: &[String], filter: Filter) -> Result<PoolSubscription>;

    async fn unsubscribe(&self, id: &str);

    /// One-shot fetch, used for optional post-publish verification
    async fn query(&self, relays: &[String], filter: Filter, timeout: Duration) -> Result<Vec<Event>>;
}

struct Route {
    tx: mpsc::UnboundedSender<SubscriptionEvent>,
    open_relays: HashSet<RelayUrl>,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// [`RelayPool`] over a `nostr_sdk::Client`
pub struct NostrSdkPool {
    client: Client,
    routes: Routes,
    router: JoinHandle<()>,
}

impl NostrSdkPool {
    pub fn new(client: Client) -> Self {
        let routes: Routes = Arc::new(Mutex::new(HashMap::new()));
        let router = tokio::spawn(route_notifications(client.notifications(), routes.clone()));
        Self {
            client,
            routes,
            router,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    async fn ensure_relays(&self, relays: &[String]) -> Result<Vec<RelayUrl>> {
        let mut urls = Vec::with_capacity(relays.len());
        let mut added = false;
        for relay in relays {
            let url = RelayUrl::parse(relay)
                .map_err(|e| Error::Transport(format!("invalid relay {}: {}", relay, e)))?;
            added |= self
                .client
                .add_relay(url.clone())
                .await
                .map_err(|e| Error::Transport(format!("failed to add relay {}: {}", relay, e)))?;
            urls.push(url);
        }
        if added {
            self.client.connect().await;
            tokio::time::sleep(CONNECT_SETTLE).await;
        }
        Ok(urls)
    }

    fn lock_routes(&self) -> std::sync::MutexGuard<'_, HashMap<String, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for NostrSdkPool {
    fn drop(&mut self) {
        self.router.abort();
    }
}

#[async_trait]
impl RelayPool for NostrSdkPool {
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishOutcome> {
        let urls = self.ensure_relays(relays).await?;
        let output = self
            .client
            .send_event_to(urls, event)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let outcome = PublishOutcome {
            success: output.success.iter().map(|u| u.to_string()).collect(),
            failed: output
                .failed
                .iter()
                .map(|(u, reason)| (u.to_string(), reason.to_string()))
                .collect(),
        };
        if outcome.success.is_empty() {
            return Err(Error::Transport(format!(
                "no relay accepted event {}",
                event.id.to_hex()
            )));
        }
        Ok(outcome)
    }

    async fn subscribe(&self, relays: &[String], filter: Filter) -> Result<PoolSubscription> {
        let urls = self.ensure_relays(relays).await?;
        let sub_id = SubscriptionId::generate();
        let key = sub_id.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        // Route first: the relay may answer before subscribe returns
        self.lock_routes().insert(
            key.clone(),
            Route {
                tx,
                open_relays: urls.iter().cloned().collect(),
            },
        );

        let output = match self
            .client
            .subscribe_with_id_to(urls, sub_id, filter, None)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                self.lock_routes().remove(&key);
                return Err(Error::Transport(e.to_string()));
            }
        };

        if output.success.is_empty() {
            self.lock_routes().remove(&key);
            return Err(Error::Transport("no relay accepted the subscription".to_string()));
        }
        if let Some(route) = self.lock_routes().get_mut(&key) {
            route.open_relays.retain(|u| output.success.contains(u));
        }

        info!("subscription {} open on {} relay(s)", key, output.success.len());
        Ok(PoolSubscription { id: key, events: rx })
    }

    async fn unsubscribe(&self, id: &str) {
        let routed = self.lock_routes().remove(id).is_some();
        if routed {
            self.client.unsubscribe(&SubscriptionId::new(id)).await;
            debug!("subscription {} closed", id);
        }
    }

    async fn query(&self, relays: &[String], filter: Filter, timeout: Duration) -> Result<Vec<Event>> {
        let urls = self.ensure_relays(relays).await?;
        let events = self
            .client
            .fetch_events_from(urls, filter, timeout)
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        Ok(events.into_iter().collect())
    }
}

/// Fan pool notifications out to per-subscription channels
async fn route_notifications(mut notifications: broadcast::Receiver<RelayPoolNotification>, routes: Routes) {
    loop {
        let notification = match notifications.recv().await {
            Ok(n) => n,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("relay notifications lagged, skipped {}", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let mut table = routes.lock().unwrap_or_else(|e| e.into_inner());
        match notification {
            RelayPoolNotification::Event {
                subscription_id,
                event,
                ..
            } => {
                if let Some(route) = table.get(&subscription_id.to_string()) {
                    let _ = route.tx.send(SubscriptionEvent::Event(event));
                }
            }
            RelayPoolNotification::Message { relay_url, message } => match message {
                RelayMessage::EndOfStoredEvents(subscription_id) => {
                    let subscription_id: &SubscriptionId = &subscription_id;
                    if let Some(route) = table.get(&subscription_id.to_string()) {
                        let _ = route.tx.send(SubscriptionEvent::Eose);
                    }
                }
                RelayMessage::Closed {
                    subscription_id,
                    message,
                } => {
                    let subscription_id: &SubscriptionId = &subscription_id;
                    let key = subscription_id.to_string();
                    let all_closed = match table.get_mut(&key) {
                        Some(route) => {
                            route.open_relays.remove(&relay_url);
                            debug!("relay {} closed subscription {}: {}", relay_url, key, message);
                            route.open_relays.is_empty()
                        }
                        None => false,
                    };
                    if all_closed {
                        if let Some(route) = table.remove(&key) {
                            let _ = route.tx.send(SubscriptionEvent::Closed(message.to_string()));
                        }
                    }
                }
                _ => {}
            },
            RelayPoolNotification::Shutdown => {
                for (_, route) in table.drain() {
                    let _ = route
                        .tx
                        .send(SubscriptionEvent::Closed("relay pool shut down".to_string()));
                }
                break;
            }
        }
    }
}
