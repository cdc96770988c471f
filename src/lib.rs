//! Client side of the Nostr Connect (NIP-46) remote signing protocol

pub mod nip46;
