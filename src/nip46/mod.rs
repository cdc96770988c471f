//! NIP-46 remote signing client
//!
//! Everything needed to delegate signing to a bunker: `bunker://` parsing,
//! cipher negotiation between NIP-44 and NIP-04, the session lifecycle, the
//! encrypted request/response correlator and a supervised relay
//! subscription. [`RemoteSigner`] is the entry point.

pub mod audit;
pub mod cipher;
pub mod config;
pub mod error;
pub mod pool;
pub mod rpc;
pub mod session;
pub mod signer;
pub mod store;
pub mod subscription;
pub mod uri;

#[cfg(test)]
mod testing;

pub use audit::AuditLog;
pub use cipher::{CipherHandle, CipherPolicy, CipherScheme};
pub use config::{SessionConfig, SigningMode, StoredSession};
pub use error::{Error, ParseError, Result};
pub use pool::{NostrSdkPool, RelayPool};
pub use session::{Session, SessionStatus};
pub use signer::{EventTemplate, RemoteSigner};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use uri::ConnectionTarget;
