//! Inbound envelope subscription with bounded recovery
//!
//! One logical subscription spans every relay of the target. When the relays
//! close it while the session is connected, it is re-opened once after a
//! short delay. The budget is one re-open per handle: a second closure is
//! final even if envelopes arrived in between. The handle then reports
//! itself closed and the session notices on its next status check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nostr::prelude::*;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::error::Result;
use super::pool::{PoolSubscription, RelayPool, SubscriptionEvent};
use super::session::SessionStatus;

/// Which events belong to a session: NIP-46 envelopes from the signer,
/// addressed to our ephemeral key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeFilter {
    signer: PublicKey,
    local: PublicKey,
}

impl EnvelopeFilter {
    pub fn new(signer: PublicKey, local: PublicKey) -> Self {
        Self { signer, local }
    }

    /// The relay-side filter
    pub fn filter(&self) -> Filter {
        Filter::new()
            .kind(Kind::NostrConnect)
            .author(self.signer)
            .pubkey(self.local)
    }

    /// Client-side re-check; relays are not trusted to filter
    pub fn accepts(&self, event: &Event) -> bool {
        event.kind == Kind::NostrConnect
            && event.pubkey == self.signer
            && event.tags.public_keys().any(|pk| *pk == self.local)
    }
}

/// Owned handle to a supervised subscription
pub struct SubscriptionHandle {
    open: Arc<AtomicBool>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionHandle {
    /// Subscribe on `relays` and forward matching envelopes to `sink`.
    ///
    /// `status` is the owning session's status; recovery only happens
    /// while it reads `Connected`.
    pub async fn open(
        pool: Arc<dyn RelayPool>,
        relays: Vec<String>,
        filter: EnvelopeFilter,
        sink: mpsc::UnboundedSender<Event>,
        status: watch::Receiver<SessionStatus>,
        reopen_delay: Duration,
    ) -> Result<Self> {
        let subscription = pool.subscribe(&relays, filter.filter()).await?;
        debug!("envelope subscription {} opened", subscription.id);

        let open = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let supervisor = Supervisor {
            pool,
            relays,
            filter,
            sink,
            status,
            reopen_delay,
            open: open.clone(),
        };
        let task = tokio::spawn(supervisor.run(subscription, shutdown_rx));

        Ok(Self {
            open,
            shutdown: Mutex::new(Some(shutdown_tx)),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Close the subscription and wait for the relays to be told. Idempotent.
    pub async fn close(&self) {
        self.signal_shutdown();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.open.store(false, Ordering::SeqCst);
    }

    fn signal_shutdown(&self) {
        let tx = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

struct Supervisor {
    pool: Arc<dyn RelayPool>,
    relays: Vec<String>,
    filter: EnvelopeFilter,
    sink: mpsc::UnboundedSender<Event>,
    status: watch::Receiver<SessionStatus>,
    reopen_delay: Duration,
    open: Arc<AtomicBool>,
}

impl Supervisor {
    async fn run(self, mut subscription: PoolSubscription, mut shutdown: oneshot::Receiver<()>) {
        // Set after the one automatic re-open this handle gets
        let mut reopened = false;

        loop {
            let message = tokio::select! {
                _ = &mut shutdown => break,
                message = subscription.events.recv() => message,
            };

            let reason = match message {
                Some(SubscriptionEvent::Event(event)) => {
                    if !self.filter.accepts(&event) {
                        debug!("ignoring event {} not addressed to this session", event.id);
                        continue;
                    }
                    if self.sink.send(*event).is_err() {
                        debug!("envelope sink dropped, stopping subscription");
                        break;
                    }
                    continue;
                }
                Some(SubscriptionEvent::Eose) => {
                    debug!("subscription {} reached end of stored events", subscription.id);
                    continue;
                }
                Some(SubscriptionEvent::Closed(reason)) => reason,
                None => "stream ended".to_string(),
            };

            let connected = *self.status.borrow() == SessionStatus::Connected;
            if reopened || !connected {
                warn!(
                    "subscription {} closed by relays ({}), giving up",
                    subscription.id, reason
                );
                self.pool.unsubscribe(&subscription.id).await;
                self.open.store(false, Ordering::SeqCst);
                return;
            }

            warn!(
                "subscription {} closed by relays ({}), re-opening in {:?}",
                subscription.id, reason, self.reopen_delay
            );
            reopened = true;

            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.reopen_delay) => {}
            }

            match self.pool.subscribe(&self.relays, self.filter.filter()).await {
                Ok(fresh) => {
                    self.pool.unsubscribe(&subscription.id).await;
                    info!("subscription re-opened as {}", fresh.id);
                    subscription = fresh;
                }
                Err(e) => {
                    warn!("failed to re-open subscription: {}", e);
                    self.pool.unsubscribe(&subscription.id).await;
                    self.open.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }

        self.pool.unsubscribe(&subscription.id).await;
        self.open.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip46::testing::{wait_until, MockPool};

    struct Fixture {
        pool: Arc<MockPool>,
        signer: Keys,
        local: Keys,
        status: watch::Sender<SessionStatus>,
        inbox: mpsc::UnboundedReceiver<Event>,
        handle: SubscriptionHandle,
    }

    async fn fixture(status: SessionStatus) -> Fixture {
        let pool = Arc::new(MockPool::new());
        let signer = Keys::generate();
        let local = Keys::generate();
        let (status_tx, status_rx) = watch::channel(status);
        let (sink, inbox) = mpsc::unbounded_channel();
        let handle = SubscriptionHandle::open(
            pool.clone(),
            vec!["wss://relay.example".to_string()],
            EnvelopeFilter::new(signer.public_key(), local.public_key()),
            sink,
            status_rx,
            Duration::from_millis(10),
        )
        .await
        .unwrap();
        Fixture {
            pool,
            signer,
            local,
            status: status_tx,
            inbox,
            handle,
        }
    }

    fn envelope(author: &Keys, to: &PublicKey) -> Event {
        EventBuilder::new(Kind::NostrConnect, "opaque")
            .tag(Tag::public_key(*to))
            .sign_with_keys(author)
            .unwrap()
    }

    #[test]
    fn test_envelope_filter_accepts() {
        let signer = Keys::generate();
        let local = Keys::generate();
        let stranger = Keys::generate();
        let filter = EnvelopeFilter::new(signer.public_key(), local.public_key());

        assert!(filter.accepts(&envelope(&signer, &local.public_key())));
        assert!(!filter.accepts(&envelope(&stranger, &local.public_key())));
        assert!(!filter.accepts(&envelope(&signer, &stranger.public_key())));

        let wrong_kind = EventBuilder::new(Kind::TextNote, "hi")
            .tag(Tag::public_key(local.public_key()))
            .sign_with_keys(&signer)
            .unwrap();
        assert!(!filter.accepts(&wrong_kind));
    }

    #[tokio::test]
    async fn test_forwards_only_matching_envelopes() {
        let mut f = fixture(SessionStatus::Connected).await;
        let stranger = Keys::generate();

        f.pool.deliver(envelope(&stranger, &f.local.public_key()), 1);
        let good = envelope(&f.signer, &f.local.public_key());
        f.pool.deliver(good.clone(), 1);

        let received = tokio::time::timeout(Duration::from_secs(1), f.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.id, good.id);
        assert!(f.inbox.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reopens_once_then_gives_up() {
        let f = fixture(SessionStatus::Connected).await;
        assert_eq!(f.pool.subscribe_calls(), 1);

        f.pool.close_subscriptions("rate limited");
        wait_until(|| f.pool.subscribe_calls() == 2).await;
        wait_until(|| f.pool.live_subscriptions() == 1).await;
        assert!(f.handle.is_open());

        f.pool.close_subscriptions("rate limited again");
        wait_until(|| !f.handle.is_open()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.pool.subscribe_calls(), 2);
    }

    #[tokio::test]
    async fn test_second_closure_is_final_after_envelope() {
        let mut f = fixture(SessionStatus::Connected).await;

        f.pool.close_subscriptions("blip");
        wait_until(|| f.pool.subscribe_calls() == 2 && f.pool.live_subscriptions() == 1).await;

        // Traffic on the re-opened subscription does not buy another retry
        f.pool.deliver(envelope(&f.signer, &f.local.public_key()), 1);
        tokio::time::timeout(Duration::from_secs(1), f.inbox.recv())
            .await
            .unwrap()
            .unwrap();

        f.pool.close_subscriptions("blip");
        wait_until(|| !f.handle.is_open()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.pool.subscribe_calls(), 2);
        assert_eq!(f.pool.live_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_no_reopen_unless_connected() {
        let f = fixture(SessionStatus::Connecting).await;
        f.pool.close_subscriptions("closed");
        wait_until(|| !f.handle.is_open()).await;
        assert_eq!(f.pool.subscribe_calls(), 1);
        drop(f.status);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let f = fixture(SessionStatus::Connected).await;
        f.handle.close().await;
        assert!(!f.handle.is_open());
        assert_eq!(f.pool.live_subscriptions(), 0);
        f.handle.close().await;
        assert!(!f.handle.is_open());
    }

    #[tokio::test]
    async fn test_drop_unsubscribes() {
        let f = fixture(SessionStatus::Connected).await;
        let pool = f.pool.clone();
        drop(f);
        wait_until(|| pool.live_subscriptions() == 0).await;
    }
}
