//! Envelope encryption: NIP-44 (v2) and legacy NIP-04
//!
//! Remote signers in the wild speak exactly one of the two, and the two are
//! not interoperable. Which one a session uses is decided by a
//! [`CipherPolicy`], never hardcoded.

use std::fmt;
use std::str::FromStr;

use nostr::nips::{nip04, nip44};
use nostr::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};

use super::error::{Error, Result};
use super::uri::ConnectionTarget;

/// Supported envelope encryption schemes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CipherScheme {
    /// ECDH conversation key + ChaCha20/HMAC-SHA256
    Nip44,
    /// Shared-secret AES-256-CBC with a random IV per message
    Nip04,
}

impl CipherScheme {
    pub fn other(self) -> Self {
        match self {
            CipherScheme::Nip44 => CipherScheme::Nip04,
            CipherScheme::Nip04 => CipherScheme::Nip44,
        }
    }
}

impl fmt::Display for CipherScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CipherScheme::Nip44 => f.write_str("nip44"),
            CipherScheme::Nip04 => f.write_str("nip04"),
        }
    }
}

impl FromStr for CipherScheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nip44" | "nip-44" => Ok(CipherScheme::Nip44),
            "nip04" | "nip-04" => Ok(CipherScheme::Nip04),
            other => Err(Error::InvalidInput(format!("unknown cipher scheme `{}`", other))),
        }
    }
}

/// How a session picks its envelope cipher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherPolicy {
    /// The caller knows which scheme the signer speaks
    Fixed(CipherScheme),
    /// Try `prefer` first; if the handshake response cannot be decrypted,
    /// retry the session with the other scheme
    Negotiate { prefer: CipherScheme },
}

impl Default for CipherPolicy {
    fn default() -> Self {
        CipherPolicy::Negotiate {
            prefer: CipherScheme::Nip44,
        }
    }
}

impl CipherPolicy {
    /// The handle a session against `target` starts with
    pub fn negotiate(&self, _target: &ConnectionTarget) -> CipherHandle {
        CipherHandle::new(self.candidates()[0])
    }

    /// Schemes to attempt, in order
    pub fn candidates(&self) -> Vec<CipherScheme> {
        match *self {
            CipherPolicy::Fixed(scheme) => vec![scheme],
            CipherPolicy::Negotiate { prefer } => vec![prefer, prefer.other()],
        }
    }
}

/// Encrypt/decrypt under one negotiated scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherHandle {
    scheme: CipherScheme,
}

impl CipherHandle {
    pub fn new(scheme: CipherScheme) -> Self {
        Self { scheme }
    }

    pub fn scheme(&self) -> CipherScheme {
        self.scheme
    }

    pub fn encrypt(&self, plaintext: &str, local: &SecretKey, remote: &PublicKey) -> Result<String> {
        match self.scheme {
            CipherScheme::Nip44 => nip44::encrypt(local, remote, plaintext, nip44::Version::V2)
                .map_err(|e| Error::Protocol(format!("nip44 encrypt: {}", e))),
            CipherScheme::Nip04 => nip04::encrypt(local, remote, plaintext)
                .map_err(|e| Error::Protocol(format!("nip04 encrypt: {}", e))),
        }
    }

    /// Any failure here is a [`Error::Decrypt`], never an empty result
    pub fn decrypt(&self, ciphertext: &str, local: &SecretKey, remote: &PublicKey) -> Result<String> {
        match self.scheme {
            CipherScheme::Nip44 => nip44::decrypt(local, remote, ciphertext)
                .map_err(|e| Error::Decrypt(format!("nip44: {}", e))),
            CipherScheme::Nip04 => nip04::decrypt(local, remote, ciphertext)
                .map_err(|e| Error::Decrypt(format!("nip04: {}", e))),
        }
    }
}
