//! Session tuning, persisted session state and signing mode selection
//!
//! The persisted [`StoredSession`] keeps the ephemeral client key next to the
//! connection string it was authorized for, so a later connect can reuse the
//! authorization instead of asking the user to approve a new key.

use std::time::Duration;

use nostr::prelude::*;
use serde::{Deserialize, Serialize};

use super::cipher::CipherScheme;
use super::error::{Error, Result};
use super::store::KeyValueStore;
use super::uri::ConnectionTarget;

/// Default deadline for a single RPC round trip
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Deadline for the liveness probe on the reuse path
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause before the single automatic subscription re-open
pub const DEFAULT_REOPEN_DELAY: Duration = Duration::from_secs(2);

/// Tuning knobs for a session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    pub reopen_delay: Duration,
    /// Bound on the whole connect handshake. `None` leaves it to the
    /// sum of the per-request timeouts.
    pub connect_timeout: Option<Duration>,
    /// Added as a `client` tag on every request
    pub app_name: Option<String>,
    /// Permissions requested in the `connect` call, e.g. `sign_event:1,nip44_encrypt`
    pub perms: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            reopen_delay: DEFAULT_REOPEN_DELAY,
            connect_timeout: None,
            app_name: None,
            perms: None,
        }
    }
}

/// Persisted remote signer session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    /// The raw bunker:// URI the user supplied
    pub connection_string: String,
    /// The remote signer's public key (hex)
    pub remote_signer_pubkey: String,
    /// Our ephemeral client key (hex). The bunker authorizes this key,
    /// so it is kept across restarts.
    pub client_secret_key: String,
    /// The user's public key as reported by the bunker (hex)
    pub user_pubkey: Option<String>,
    /// Cipher the bunker answered with last time
    pub cipher: Option<CipherScheme>,
    pub created_at: String,
    pub last_connected: Option<String>,
}

impl StoredSession {
    /// Store key the record lives under
    pub const KEY: &'static str = "nip46.session";

    pub fn new(target: &ConnectionTarget, connection_string: &str, client_keys: &Keys) -> Self {
        Self {
            connection_string: connection_string.to_string(),
            remote_signer_pubkey: target.signer_hex(),
            client_secret_key: client_keys.secret_key().to_secret_hex(),
            user_pubkey: None,
            cipher: None,
            created_at: chrono::Utc::now().to_rfc3339(),
            last_connected: None,
        }
    }

    /// Whether this record was created for the same remote signer
    pub fn matches(&self, target: &ConnectionTarget) -> bool {
        self.remote_signer_pubkey.eq_ignore_ascii_case(&target.signer_hex())
    }

    /// The persisted ephemeral keypair
    pub fn client_keys(&self) -> Result<Keys> {
        let sk = SecretKey::from_hex(&self.client_secret_key)
            .map_err(|e| Error::Storage(format!("invalid stored client key: {}", e)))?;
        Ok(Keys::new(sk))
    }

    pub fn cached_user_pubkey(&self) -> Option<PublicKey> {
        self.user_pubkey
            .as_ref()
            .and_then(|hex| PublicKey::from_hex(hex).ok())
    }

    pub fn update_connected(&mut self, user_pubkey: PublicKey, cipher: CipherScheme) {
        self.user_pubkey = Some(user_pubkey.to_hex());
        self.cipher = Some(cipher);
        self.last_connected = Some(chrono::Utc::now().to_rfc3339());
    }

    pub fn load(store: &dyn KeyValueStore) -> Result<Option<Self>> {
        let Some(raw) = store.get(Self::KEY)? else {
            return Ok(None);
        };
        let session = serde_json::from_str(&raw)
            .map_err(|e| Error::Storage(format!("failed to parse stored session: {}", e)))?;
        Ok(Some(session))
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> Result<()> {
        let raw = serde_json::to_string(self)
            .map_err(|e| Error::Storage(format!("failed to serialize session: {}", e)))?;
        store.set(Self::KEY, &raw)
    }

    /// Erase the persisted session. The next connect generates a new key.
    pub fn forget(store: &dyn KeyValueStore) -> Result<()> {
        store.remove(Self::KEY)
    }
}

/// Where event signatures come from
#[derive(Debug, Clone)]
pub enum SigningMode {
    /// Keys available locally
    Local(Keys),
    /// Delegated to a remote signer session
    Remote(StoredSession),
}

impl SigningMode {
    /// Pick a signing mode: an explicit key wins, then a stored session
    pub fn resolve(nsec: Option<&str>, store: &dyn KeyValueStore) -> Result<Option<Self>> {
        if let Some(nsec) = nsec {
            let keys = Keys::parse(nsec)
                .map_err(|e| Error::InvalidInput(format!("invalid secret key: {}", e)))?;
            return Ok(Some(SigningMode::Local(keys)));
        }

        Ok(StoredSession::load(store)?.map(SigningMode::Remote))
    }

    pub fn description(&self) -> &'static str {
        match self {
            SigningMode::Local(_) => "local key",
            SigningMode::Remote(_) => "NIP-46 bunker",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nip46::store::MemoryStore;

    const URI: &str = "bunker://79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3?relay=wss://relay.nsec.app&secret=test123";

    fn stored() -> (StoredSession, Keys) {
        let target = ConnectionTarget::parse(URI).unwrap();
        let keys = Keys::generate();
        (StoredSession::new(&target, URI, &keys), keys)
    }

    #[test]
    fn test_new_session_record() {
        let (session, keys) = stored();
        assert_eq!(
            session.remote_signer_pubkey,
            "79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3"
        );
        assert_eq!(session.connection_string, URI);
        assert!(session.user_pubkey.is_none());
        assert!(session.cipher.is_none());
        assert_eq!(session.client_keys().unwrap().public_key(), keys.public_key());
    }

    #[test]
    fn test_matches_target() {
        let (session, _) = stored();
        assert!(session.matches(&ConnectionTarget::parse(URI).unwrap()));

        let other = format!("bunker://{}?relay=wss://relay.nsec.app", Keys::generate().public_key().to_hex());
        assert!(!session.matches(&ConnectionTarget::parse(&other).unwrap()));
    }

    #[test]
    fn test_save_load_forget() {
        let store = MemoryStore::new();
        assert!(StoredSession::load(&store).unwrap().is_none());

        let (mut session, _) = stored();
        let user = Keys::generate().public_key();
        session.update_connected(user, CipherScheme::Nip04);
        session.save(&store).unwrap();

        let loaded = StoredSession::load(&store).unwrap().unwrap();
        assert_eq!(loaded, session);
        assert_eq!(loaded.cached_user_pubkey(), Some(user));
        assert_eq!(loaded.cipher, Some(CipherScheme::Nip04));
        assert!(loaded.last_connected.is_some());

        StoredSession::forget(&store).unwrap();
        assert!(StoredSession::load(&store).unwrap().is_none());
    }

    #[test]
    fn test_load_corrupt_record() {
        let store = MemoryStore::new();
        store.set(StoredSession::KEY, "{not json").unwrap();
        assert!(matches!(StoredSession::load(&store), Err(Error::Storage(_))));
    }

    #[test]
    fn test_signing_mode_resolve_nsec() {
        let store = MemoryStore::new();
        let keys = Keys::generate();
        let nsec = keys.secret_key().to_bech32().unwrap();
        let mode = SigningMode::resolve(Some(&nsec), &store).unwrap().unwrap();
        assert!(matches!(mode, SigningMode::Local(k) if k.public_key() == keys.public_key()));
    }

    #[test]
    fn test_signing_mode_resolve_stored() {
        let store = MemoryStore::new();
        assert!(SigningMode::resolve(None, &store).unwrap().is_none());

        let (session, _) = stored();
        session.save(&store).unwrap();
        let mode = SigningMode::resolve(None, &store).unwrap().unwrap();
        assert!(matches!(mode, SigningMode::Remote(_)));
        assert_eq!(mode.description(), "NIP-46 bunker");
    }

    #[test]
    fn test_signing_mode_bad_nsec() {
        let store = MemoryStore::new();
        assert!(matches!(
            SigningMode::resolve(Some("nsec1garbage"), &store),
            Err(Error::InvalidInput(_))
        ));
    }
}
