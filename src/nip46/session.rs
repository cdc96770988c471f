//! Remote signer session lifecycle
//!
//! A [`Session`] owns at most one live link to a remote signer: the
//! ephemeral identity, the correlator that speaks for it and the inbound
//! subscription feeding that correlator. Connect, restore and disconnect are
//! serialised; requests run concurrently over whatever link is current.

use std::fmt;
use std::sync::{Arc, RwLock};

use nostr::prelude::*;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cipher::{CipherHandle, CipherPolicy, CipherScheme};
use super::config::{SessionConfig, StoredSession};
use super::error::{Error, Result};
use super::pool::RelayPool;
use super::rpc::Correlator;
use super::store::KeyValueStore;
use super::subscription::{EnvelopeFilter, SubscriptionHandle};
use super::uri::ConnectionTarget;

const AUTH_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Connecting => "connecting",
            SessionStatus::Connected => "connected",
            SessionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Correlator plus the plumbing that feeds it
struct Channel {
    correlator: Arc<Correlator>,
    subscription: SubscriptionHandle,
    pump: JoinHandle<()>,
}

impl Channel {
    async fn close(&self) {
        self.subscription.close().await;
        self.correlator.shutdown();
        self.pump.abort();
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

struct Link {
    channel: Channel,
    target: ConnectionTarget,
    user: PublicKey,
}

pub struct Session {
    pool: Arc<dyn RelayPool>,
    store: Arc<dyn KeyValueStore>,
    config: SessionConfig,
    status: watch::Sender<SessionStatus>,
    link: RwLock<Option<Arc<Link>>>,
    lifecycle: Mutex<()>,
    auth_urls: broadcast::Sender<String>,
}

impl Session {
    pub fn new(pool: Arc<dyn RelayPool>, store: Arc<dyn KeyValueStore>, config: SessionConfig) -> Self {
        let (status, _) = watch::channel(SessionStatus::Disconnected);
        let (auth_urls, _) = broadcast::channel(AUTH_CHANNEL_CAPACITY);
        Self {
            pool,
            store,
            config,
            status,
            link: RwLock::new(None),
            lifecycle: Mutex::new(()),
            auth_urls,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Observe every status transition
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Authorization URLs sent by the signer while a request waits for approval
    pub fn auth_challenges(&self) -> broadcast::Receiver<String> {
        self.auth_urls.subscribe()
    }

    /// The user key learned during the handshake
    pub fn user_public_key(&self) -> Option<PublicKey> {
        self.current_link().map(|link| link.user)
    }

    pub fn target(&self) -> Option<ConnectionTarget> {
        self.current_link().map(|link| link.target.clone())
    }

    pub fn cipher(&self) -> Option<CipherScheme> {
        self.current_link()
            .map(|link| link.channel.correlator.cipher().scheme())
    }

    /// Connect to the signer described by `raw`, replacing any current link.
    ///
    /// A stored identity for the same signer is tried first; if the signer
    /// no longer answers it, a fresh identity goes through `connect`.
    pub async fn connect(&self, raw: &str, policy: CipherPolicy) -> Result<PublicKey> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;

        let target = ConnectionTarget::parse(raw)?;
        let signer = target.signer_key()?;

        info!(
            "connecting to remote signer {} via {} relay(s)",
            target.signer_hex(),
            target.relays().len()
        );
        self.set_status(SessionStatus::Connecting);

        let establish = self.establish(&target, raw, signer, policy);
        let outcome = match self.config.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, establish)
                .await
                .unwrap_or_else(|_| Err(Error::timeout("connect"))),
            None => establish.await,
        };

        match outcome {
            Ok(link) => {
                let user = link.user;
                info!(
                    "connected to remote signer, user {} ({})",
                    user.to_hex(),
                    link.channel.correlator.cipher().scheme()
                );
                *self.link.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(link));
                self.set_status(SessionStatus::Connected);
                Ok(user)
            }
            Err(e) => {
                warn!("failed to connect to remote signer: {}", e);
                self.set_status(SessionStatus::Failed);
                Err(e)
            }
        }
    }

    /// Reconnect using the persisted session record
    pub async fn restore(&self, policy: CipherPolicy) -> Result<PublicKey> {
        let stored = StoredSession::load(self.store.as_ref())?.ok_or(Error::NothingToRestore)?;
        self.connect(&stored.connection_string, policy).await
    }

    /// Tell the signer goodbye (best effort) and drop the link. The stored
    /// record survives so the next connect can reuse the identity.
    pub async fn disconnect(&self) {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
    }

    /// Disconnect and erase the stored record
    pub async fn forget(&self) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;
        StoredSession::forget(self.store.as_ref())?;
        info!("forgot stored remote signer session");
        Ok(())
    }

    /// True while connected with a live subscription. A session whose
    /// subscription died is marked `Failed` here.
    pub fn is_connected(&self) -> bool {
        if self.status() != SessionStatus::Connected {
            return false;
        }
        let open = self
            .current_link()
            .map(|link| link.channel.subscription.is_open())
            .unwrap_or(false);
        if !open {
            warn!("subscription to remote signer is gone, marking session failed");
            self.status.send_if_modified(|status| {
                if *status == SessionStatus::Connected {
                    *status = SessionStatus::Failed;
                    true
                } else {
                    false
                }
            });
        }
        open
    }

    pub(crate) async fn request(&self, method: &str, params: Vec<String>) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let link = self.current_link().ok_or(Error::NotConnected)?;
        link.channel
            .correlator
            .request(method, params, self.config.request_timeout)
            .await
    }

    async fn establish(
        &self,
        target: &ConnectionTarget,
        raw: &str,
        signer: PublicKey,
        policy: CipherPolicy,
    ) -> Result<Link> {
        match StoredSession::load(self.store.as_ref()) {
            Ok(Some(stored)) if stored.matches(target) => {
                match self.reuse(target, signer, stored, policy).await {
                    Ok(link) => return Ok(link),
                    Err(e) => {
                        warn!("stored identity not accepted ({}), starting a new session", e);
                        if let Err(e) = StoredSession::forget(self.store.as_ref()) {
                            warn!("failed to discard stored session: {}", e);
                        }
                    }
                }
            }
            Ok(_) => {}
            Err(e) => warn!("ignoring unreadable stored session: {}", e),
        }

        self.fresh(target, raw, signer, policy).await
    }

    async fn reuse(
        &self,
        target: &ConnectionTarget,
        signer: PublicKey,
        mut stored: StoredSession,
        policy: CipherPolicy,
    ) -> Result<Link> {
        let keys = stored.client_keys()?;
        let scheme = match (policy, stored.cipher) {
            (CipherPolicy::Negotiate { .. }, Some(scheme)) => scheme,
            _ => policy.negotiate(target).scheme(),
        };
        debug!("probing stored identity {} ({})", keys.public_key().to_hex(), scheme);

        let channel = self.open_channel(target, signer, &keys, CipherHandle::new(scheme)).await?;
        let probed = async {
            channel
                .correlator
                .request("ping", Vec::new(), self.config.probe_timeout)
                .await?;
            self.fetch_user(&channel).await
        }
        .await;

        let user = match probed {
            Ok(user) => user,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        stored.update_connected(user, scheme);
        if let Err(e) = stored.save(self.store.as_ref()) {
            warn!("failed to update stored session: {}", e);
        }
        Ok(Link {
            channel,
            target: target.clone(),
            user,
        })
    }

    async fn fresh(
        &self,
        target: &ConnectionTarget,
        raw: &str,
        signer: PublicKey,
        policy: CipherPolicy,
    ) -> Result<Link> {
        let keys = Keys::generate();
        let mut stored = StoredSession::new(target, raw, &keys);
        stored.save(self.store.as_ref())?;
        debug!("generated client identity {}", keys.public_key().to_hex());

        let mut last_error = None;
        for scheme in policy.candidates() {
            let channel = self.open_channel(target, signer, &keys, CipherHandle::new(scheme)).await?;
            match self.handshake(&channel, target, &keys).await {
                Ok(user) => {
                    stored.update_connected(user, scheme);
                    if let Err(e) = stored.save(self.store.as_ref()) {
                        warn!("failed to update stored session: {}", e);
                    }
                    return Ok(Link {
                        channel,
                        target: target.clone(),
                        user,
                    });
                }
                Err(e) => {
                    channel.close().await;
                    if !e.is_decrypt() {
                        return Err(e);
                    }
                    info!("remote signer does not answer in {}: {}", scheme, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Protocol("no cipher scheme to try".to_string())))
    }

    async fn handshake(&self, channel: &Channel, target: &ConnectionTarget, keys: &Keys) -> Result<PublicKey> {
        let mut params = vec![
            keys.public_key().to_hex(),
            target.secret().unwrap_or_default().to_string(),
        ];
        if let Some(perms) = &self.config.perms {
            params.push(perms.clone());
        }

        let result = channel
            .correlator
            .request("connect", params, self.config.request_timeout)
            .await?;
        match result.as_str() {
            Some("ack") => {}
            Some(echo) if Some(echo) == target.secret() => {}
            _ => debug!("unexpected connect result {}, continuing", result),
        }

        self.fetch_user(channel).await
    }

    async fn fetch_user(&self, channel: &Channel) -> Result<PublicKey> {
        let result = channel
            .correlator
            .request("get_public_key", Vec::new(), self.config.request_timeout)
            .await?;
        result
            .as_str()
            .and_then(|hex| PublicKey::from_hex(hex).ok())
            .ok_or_else(|| Error::Protocol(format!("signer returned an invalid user key: {}", result)))
    }

    async fn open_channel(
        &self,
        target: &ConnectionTarget,
        signer: PublicKey,
        keys: &Keys,
        cipher: CipherHandle,
    ) -> Result<Channel> {
        let relays = target.relays().to_vec();
        let correlator = Arc::new(Correlator::new(
            self.pool.clone(),
            relays.clone(),
            signer,
            keys.clone(),
            cipher,
            self.config.app_name.clone(),
            self.auth_urls.clone(),
        ));

        let (sink, inbox) = mpsc::unbounded_channel();
        let subscription = SubscriptionHandle::open(
            self.pool.clone(),
            relays,
            EnvelopeFilter::new(signer, keys.public_key()),
            sink,
            self.status.subscribe(),
            self.config.reopen_delay,
        )
        .await?;
        let pump = correlator.spawn_pump(inbox);

        Ok(Channel {
            correlator,
            subscription,
            pump,
        })
    }

    /// Drop the current link, if any, and settle on `Disconnected`
    async fn teardown(&self) {
        let link = self.link.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(link) = link {
            if self.status() == SessionStatus::Connected {
                let goodbye = link.channel.correlator.notify("disconnect", Vec::new());
                match tokio::time::timeout(self.config.probe_timeout, goodbye).await {
                    Ok(Ok(())) => debug!("sent disconnect to remote signer"),
                    Ok(Err(e)) => warn!("failed to send disconnect: {}", e),
                    Err(_) => warn!("timed out sending disconnect"),
                }
            }
            link.channel.close().await;
            info!("disconnected from remote signer {}", link.target.signer_hex());
        }
        self.set_status(SessionStatus::Disconnected);
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_status(&self, next: SessionStatus) {
        self.status.send_if_modified(|status| {
            if *status == next {
                return false;
            }
            debug!("session status {} -> {}", status, next);
            *status = next;
            true
        });
    }
}
