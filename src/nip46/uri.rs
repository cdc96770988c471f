//! bunker:// connection string parsing
//!
//! Format: `bunker://<remote-signer-pubkey>?relay=wss://...&relay=wss://...&secret=TOKEN`
//!
//! The query segment is split by hand: a bunker URI routinely repeats the
//! `relay` key and every occurrence has to be kept, in order.

use std::fmt;

use nostr::PublicKey;
use url::Url;

use super::error::ParseError;

/// Upper bound on accepted connection string length
pub const MAX_URI_LEN: usize = 8192;

const SCHEME: &str = "bunker://";
const FORBIDDEN_RELAY_CHARS: [char; 4] = ['<', '>', '"', '\''];

/// A validated remote signer target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    signer: [u8; 32],
    relays: Vec<String>,
    secret: Option<String>,
}

impl ConnectionTarget {
    /// Parse and validate a bunker:// URI
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        if raw.len() > MAX_URI_LEN {
            return Err(ParseError::TooLong {
                len: raw.len(),
                max: MAX_URI_LEN,
            });
        }

        let raw = raw.trim();
        let rest = match raw.get(..SCHEME.len()) {
            Some(prefix) if prefix.eq_ignore_ascii_case(SCHEME) => &raw[SCHEME.len()..],
            _ => return Err(ParseError::InvalidScheme),
        };
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }

        let (identity, query) = match rest.split_once('?') {
            Some((identity, query)) => (identity, query),
            None => (rest, ""),
        };
        let signer = parse_identity(identity.trim_end_matches('/'))?;

        let mut relays: Vec<String> = Vec::new();
        let mut secret = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "relay" => {
                    let relay = percent_decode(value)
                        .ok_or_else(|| ParseError::InvalidRelay(value.to_string()))?;
                    validate_relay(&relay)?;
                    if !relays.contains(&relay) {
                        relays.push(relay);
                    }
                }
                "secret" => {
                    let decoded = percent_decode(value).ok_or(ParseError::EmptySecret)?;
                    if decoded.is_empty() {
                        return Err(ParseError::EmptySecret);
                    }
                    secret = Some(decoded);
                }
                _ => {}
            }
        }

        if relays.is_empty() {
            return Err(ParseError::NoRelays);
        }

        Ok(Self {
            signer,
            relays,
            secret,
        })
    }

    /// Raw 32-byte identity of the remote signer
    pub fn signer(&self) -> &[u8; 32] {
        &self.signer
    }

    pub fn signer_hex(&self) -> String {
        hex::encode(self.signer)
    }

    /// The signer identity as a curve point, needed to encrypt for it
    pub fn signer_key(&self) -> Result<PublicKey, ParseError> {
        PublicKey::from_slice(&self.signer).map_err(|_| ParseError::InvalidIdentity)
    }

    /// Relays in the order they appeared in the URI
    pub fn relays(&self) -> &[String] {
        &self.relays
    }

    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref()
    }

    /// Render the canonical bunker:// form
    pub fn to_uri(&self) -> String {
        let mut uri = format!("{}{}", SCHEME, self.signer_hex());
        let mut sep = '?';
        for relay in &self.relays {
            uri.push(sep);
            uri.push_str("relay=");
            uri.push_str(&urlencoding::encode(relay));
            sep = '&';
        }
        if let Some(secret) = &self.secret {
            uri.push(sep);
            uri.push_str("secret=");
            uri.push_str(&urlencoding::encode(secret));
        }
        uri
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

fn parse_identity(identity: &str) -> Result<[u8; 32], ParseError> {
    if identity.len() != 64 {
        return Err(ParseError::InvalidIdentity);
    }
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(identity, &mut bytes).map_err(|_| ParseError::InvalidIdentity)?;
    Ok(bytes)
}

/// Percent-decode a query value. `+` stays literal.
fn percent_decode(value: &str) -> Option<String> {
    urlencoding::decode(value).ok().map(|v| v.into_owned())
}

fn validate_relay(relay: &str) -> Result<(), ParseError> {
    let invalid = || ParseError::InvalidRelay(relay.to_string());

    if relay.contains(FORBIDDEN_RELAY_CHARS) {
        return Err(invalid());
    }
    let url = Url::parse(relay).map_err(|_| invalid())?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(invalid());
    }
    match url.host_str() {
        Some(host) if !host.is_empty() => Ok(()),
        _ => Err(invalid()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNER: &str = "79dff8f82963424e0bb02708a22e44b4980893e3a4be0fa3cb60a43b946764e3";

    fn uri(query: &str) -> String {
        format!("bunker://{}?{}", SIGNER, query)
    }

    #[test]
    fn test_parse_single_relay_with_secret() {
        let target = ConnectionTarget::parse(&uri("relay=wss://relay.nsec.app&secret=test123")).unwrap();
        assert_eq!(target.signer_hex(), SIGNER);
        assert!(target.signer_key().is_ok());
        assert_eq!(target.relays(), ["wss://relay.nsec.app"]);
        assert_eq!(target.secret(), Some("test123"));
    }

    #[test]
    fn test_parse_keeps_every_repeated_relay_in_order() {
        let target = ConnectionTarget::parse(&uri(
            "relay=wss://a.example&relay=wss://b.example&relay=wss://c.example&relay=ws://d.example:7777",
        ))
        .unwrap();
        assert_eq!(
            target.relays(),
            [
                "wss://a.example",
                "wss://b.example",
                "wss://c.example",
                "ws://d.example:7777"
            ]
        );
        assert!(target.secret().is_none());
    }

    #[test]
    fn test_parse_zero_key_scenario() {
        let raw = format!(
            "bunker://{}?relay=wss://relay.example&relay=wss://relay2.example&secret=abc",
            "0".repeat(64)
        );
        let target = ConnectionTarget::parse(&raw).unwrap();
        assert_eq!(target.signer(), &[0u8; 32]);
        assert_eq!(target.relays(), ["wss://relay.example", "wss://relay2.example"]);
        assert_eq!(target.secret(), Some("abc"));
        // Well-formed, but not a point anyone can encrypt to
        assert_eq!(target.signer_key(), Err(ParseError::InvalidIdentity));
    }

    #[test]
    fn test_parse_uppercase_identity() {
        let target =
            ConnectionTarget::parse(&format!("bunker://{}?relay=wss://r.example", SIGNER.to_uppercase())).unwrap();
        assert_eq!(target.signer_hex(), SIGNER);
    }

    #[test]
    fn test_parse_percent_encoded_values() {
        let target = ConnectionTarget::parse(&uri(
            "relay=wss%3A%2F%2Frelay.example%2Fpath&secret=a%20b%2Bc",
        ))
        .unwrap();
        assert_eq!(target.relays(), ["wss://relay.example/path"]);
        assert_eq!(target.secret(), Some("a b+c"));
    }

    #[test]
    fn test_parse_duplicate_relays_collapse() {
        let target = ConnectionTarget::parse(&uri(
            "relay=wss://a.example&relay=wss://b.example&relay=wss://a.example",
        ))
        .unwrap();
        assert_eq!(target.relays(), ["wss://a.example", "wss://b.example"]);
    }

    #[test]
    fn test_parse_rejects_relay_with_angle_bracket() {
        let err = ConnectionTarget::parse(&uri("relay=wss://ok.example&relay=wss://evil<script>.example"))
            .unwrap_err();
        assert!(matches!(err, ParseError::InvalidRelay(r) if r.contains('<')));

        let err = ConnectionTarget::parse(&uri("relay=wss%3A%2F%2Fevil%3C.example")).unwrap_err();
        assert!(matches!(err, ParseError::InvalidRelay(_)));
    }

    #[test]
    fn test_parse_rejects_non_websocket_relay() {
        let err = ConnectionTarget::parse(&uri("relay=https://relay.example")).unwrap_err();
        assert_eq!(err, ParseError::InvalidRelay("https://relay.example".into()));
        assert!(matches!(
            ConnectionTarget::parse(&uri("relay=wss://")),
            Err(ParseError::InvalidRelay(_))
        ));
    }

    #[test]
    fn test_parse_requires_relay() {
        assert_eq!(ConnectionTarget::parse(&uri("secret=abc")), Err(ParseError::NoRelays));
        assert_eq!(
            ConnectionTarget::parse(&format!("bunker://{}", SIGNER)),
            Err(ParseError::NoRelays)
        );
    }

    #[test]
    fn test_parse_empty_secret() {
        assert_eq!(
            ConnectionTarget::parse(&uri("relay=wss://r.example&secret=")),
            Err(ParseError::EmptySecret)
        );
    }

    #[test]
    fn test_parse_bad_identity() {
        assert_eq!(
            ConnectionTarget::parse("bunker://abcd?relay=wss://r.example"),
            Err(ParseError::InvalidIdentity)
        );
        let not_hex = format!("bunker://{}?relay=wss://r.example", "g".repeat(64));
        assert_eq!(ConnectionTarget::parse(&not_hex), Err(ParseError::InvalidIdentity));
    }

    #[test]
    fn test_parse_scheme_and_length() {
        assert_eq!(ConnectionTarget::parse("https://example.com"), Err(ParseError::InvalidScheme));
        assert_eq!(ConnectionTarget::parse("not-a-bunker-uri"), Err(ParseError::InvalidScheme));
        assert_eq!(ConnectionTarget::parse("bunker://"), Err(ParseError::Empty));

        let long = uri(&format!("relay=wss://r.example&secret={}", "x".repeat(MAX_URI_LEN)));
        assert!(matches!(ConnectionTarget::parse(&long), Err(ParseError::TooLong { .. })));
    }

    #[test]
    fn test_to_uri_reparses() {
        let target = ConnectionTarget::parse(&uri(
            "relay=wss://a.example&relay=wss://b.example&secret=s%26t",
        ))
        .unwrap();
        assert_eq!(target.secret(), Some("s&t"));
        let again = ConnectionTarget::parse(&target.to_uri()).unwrap();
        assert_eq!(again, target);
    }
}
