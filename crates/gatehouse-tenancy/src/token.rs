//! Tenant token generation, parsing, and constant-time verification.
//!
//! Wire form: `tenant:{tenantId}:{secret}` where the secret is 32 bytes of
//! OS randomness, URL-safe base64 without padding. Only the secret's
//! SHA-256 is ever persisted; the plaintext token is returned exactly once,
//! at create or rotate.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use gatehouse_core::is_valid_tenant_id;

/// Secret entropy in bytes.
const SECRET_BYTES: usize = 32;

/// A parsed `tenant:{id}:{secret}` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedToken<'a> {
    /// Tenant id segment.
    pub tenant_id: &'a str,
    /// Plaintext secret segment.
    pub secret: &'a str,
}

/// Generate a fresh URL-safe secret (43 characters for 32 bytes).
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Assemble the wire form of a token.
#[must_use]
pub fn format_token(tenant_id: &str, secret: &str) -> String {
    format!("tenant:{tenant_id}:{secret}")
}

/// Parse a token string.
///
/// Returns `None` when the prefix is wrong, the tenant-id segment fails the
/// id pattern, or the secret segment is empty.
#[must_use]
pub fn parse_token(token: &str) -> Option<ParsedToken<'_>> {
    let rest = token.strip_prefix("tenant:")?;
    let (tenant_id, secret) = rest.split_once(':')?;
    if !is_valid_tenant_id(tenant_id) || secret.is_empty() {
        return None;
    }
    Some(ParsedToken { tenant_id, secret })
}

/// Hex-encoded SHA-256 of a secret, the only form ever persisted.
#[must_use]
pub fn hash_secret(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Verify a presented secret against a stored hex hash in constant time.
///
/// The presented secret is hashed first so the comparison always runs over
/// two equal-length 32-byte strings, regardless of what the caller sent.
#[must_use]
pub fn verify_secret(presented: &str, stored_hash_hex: &str) -> bool {
    let Ok(stored) = hex::decode(stored_hash_hex) else {
        return false;
    };
    if stored.len() != Sha256::output_size() {
        return false;
    }
    let presented_hash = Sha256::digest(presented.as_bytes());
    presented_hash.as_slice().ct_eq(&stored).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_are_long_and_urlsafe() {
        let secret = generate_secret();
        assert!(secret.len() >= 32);
        assert!(
            secret
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
        );
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn token_round_trip() {
        let secret = generate_secret();
        let token = format_token("demo", &secret);
        let parsed = parse_token(&token).unwrap();
        assert_eq!(parsed.tenant_id, "demo");
        assert_eq!(parsed.secret, secret);
    }

    #[test]
    fn parse_rejects_bad_forms() {
        assert!(parse_token("demo:secret").is_none());
        assert!(parse_token("tenant:demo").is_none());
        assert!(parse_token("tenant:demo:").is_none());
        assert!(parse_token("tenant:Bad Id:secret").is_none());
        assert!(parse_token("tenant:-bad:secret").is_none());
    }

    #[test]
    fn verify_accepts_matching_secret() {
        let secret = generate_secret();
        let hash = hash_secret(&secret);
        assert!(verify_secret(&secret, &hash));
    }

    #[test]
    fn verify_rejects_flipped_byte() {
        let secret = generate_secret();
        let hash = hash_secret(&secret);
        let mut bytes = secret.into_bytes();
        bytes[0] = if bytes[0] == b'A' { b'B' } else { b'A' };
        let flipped = String::from_utf8(bytes).unwrap();
        assert!(!verify_secret(&flipped, &hash));
    }

    #[test]
    fn verify_rejects_malformed_stored_hash() {
        assert!(!verify_secret("anything", "not-hex"));
        assert!(!verify_secret("anything", "abcd"));
    }
}
