//! Opaque wire encoding of tokens.
//!
//! `base64url(payload_bytes) "." base64url(tag)` where
//! `tag = HMAC-SHA-256(secret, payload_bytes)`. The payload is the JSON
//! encoding of [`TokenPayload`]; struct field order fixes the byte layout,
//! and the tag covers the payload bytes verbatim, so verification never
//! depends on parser behavior: the signature is checked before the payload
//! is parsed at all.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Scope;
use crate::crypto;
use crate::error::AuthFailure;

/// The signed token record. Field order is the canonical encoding order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPayload {
    /// Token id (registry key, used for revocation)
    pub token_id: Uuid,
    /// Owning agent
    pub agent_id: Uuid,
    /// Authorized surface
    pub scope: Scope,
    /// Issue instant, Unix seconds
    pub issued_at: i64,
    /// Expiry instant, Unix seconds (inclusive)
    pub expires_at: i64,
    /// Fresh 128-bit nonce, hex encoded
    pub nonce: String,
    /// KEK version at issue time (provenance)
    pub kek_version: u32,
}

/// Encode and sign a payload into the opaque wire form.
#[must_use]
pub fn encode(payload: &TokenPayload, secret: &[u8]) -> String {
    let bytes = serde_json::to_vec(payload).expect("token payload serializes");
    let tag = crypto::sign(secret, &bytes);
    format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(&bytes),
        URL_SAFE_NO_PAD.encode(tag)
    )
}

/// Verify and decode a wire token.
///
/// The tag is verified in constant time against the raw payload bytes
/// before any parsing happens.
pub fn decode(wire: &str, secret: &[u8]) -> Result<TokenPayload, AuthFailure> {
    let (payload_part, tag_part) = wire.split_once('.').ok_or(AuthFailure::Malformed)?;
    let payload_bytes = URL_SAFE_NO_PAD
        .decode(payload_part)
        .map_err(|_| AuthFailure::Malformed)?;
    let tag = URL_SAFE_NO_PAD
        .decode(tag_part)
        .map_err(|_| AuthFailure::Malformed)?;

    if !crypto::verify(secret, &payload_bytes, &tag) {
        return Err(AuthFailure::BadSignature);
    }

    serde_json::from_slice(&payload_bytes).map_err(|_| AuthFailure::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn payload() -> TokenPayload {
        TokenPayload {
            token_id: Uuid::new_v4(),
            agent_id: Uuid::new_v4(),
            scope: Scope::new(
                vec!["serpapi".into()],
                vec!["search".into()],
                vec!["read".into()],
            ),
            issued_at: 1_700_000_000,
            expires_at: 1_700_000_600,
            nonce: "00112233445566778899aabbccddeeff".into(),
            kek_version: 1,
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let p = payload();
        let wire = encode(&p, b"signing-secret");
        assert_eq!(wire.matches('.').count(), 1);
        let decoded = decode(&wire, b"signing-secret").unwrap();
        assert_eq!(decoded, p);
    }

    #[test]
    fn wrong_secret_is_bad_signature() {
        let wire = encode(&payload(), b"signing-secret");
        assert_eq!(decode(&wire, b"other-secret"), Err(AuthFailure::BadSignature));
    }

    #[test]
    fn tampered_payload_is_bad_signature() {
        let p = payload();
        let wire = encode(&p, b"signing-secret");
        // Re-encode a different payload under the original tag
        let mut altered = p;
        altered.expires_at += 3600;
        let altered_bytes = serde_json::to_vec(&altered).unwrap();
        let tag_part = wire.split_once('.').unwrap().1;
        let forged = format!("{}.{}", URL_SAFE_NO_PAD.encode(&altered_bytes), tag_part);
        assert_eq!(
            decode(&forged, b"signing-secret"),
            Err(AuthFailure::BadSignature)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        assert_eq!(decode("", b"s"), Err(AuthFailure::Malformed));
        assert_eq!(decode("no-dot-here", b"s"), Err(AuthFailure::Malformed));
        assert_eq!(decode("a.b.c", b"s"), Err(AuthFailure::Malformed));
        assert_eq!(decode("!!!.???", b"s"), Err(AuthFailure::Malformed));
    }

    proptest! {
        #[test]
        fn random_strings_never_validate(wire in "[a-zA-Z0-9._-]{0,128}") {
            prop_assert!(decode(&wire, b"signing-secret").is_err());
        }
    }
}
