//! Request fingerprints.
//!
//! A stable SHA-256 over (tool, action, canonicalized params, scope digest),
//! used as the cache key and the single-flight coalescing key. Params are
//! canonicalized by JSON serialization with sorted object keys, so
//! semantically equal requests hash identically regardless of field order.
//! Mixing in the scope digest keeps differently-scoped tokens from sharing
//! cache entries.

use serde_json::Value;

use crate::crypto;

/// Compute the fingerprint for a request, hex encoded.
#[must_use]
pub fn fingerprint(tool: &str, action: &str, params: &Value, scope_digest: &[u8; 32]) -> String {
    let canonical = serde_json::to_vec(params).unwrap_or_default();
    let mut input = Vec::with_capacity(tool.len() + action.len() + canonical.len() + 34);
    input.extend_from_slice(tool.as_bytes());
    input.push(0);
    input.extend_from_slice(action.as_bytes());
    input.push(0);
    input.extend_from_slice(&canonical);
    input.extend_from_slice(scope_digest);
    hex::encode(crypto::hash(&input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn equal_requests_hash_identically() {
        let digest = [0u8; 32];
        let a = fingerprint("serpapi", "search", &json!({"q": "x", "n": 3}), &digest);
        let b = fingerprint("serpapi", "search", &json!({"n": 3, "q": "x"}), &digest);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn any_component_changes_the_fingerprint() {
        let digest = [0u8; 32];
        let base = fingerprint("serpapi", "search", &json!({"q": "x"}), &digest);
        assert_ne!(base, fingerprint("http_fetch", "search", &json!({"q": "x"}), &digest));
        assert_ne!(base, fingerprint("serpapi", "other", &json!({"q": "x"}), &digest));
        assert_ne!(base, fingerprint("serpapi", "search", &json!({"q": "y"}), &digest));
        assert_ne!(base, fingerprint("serpapi", "search", &json!({"q": "x"}), &[1u8; 32]));
    }

    #[test]
    fn separator_prevents_boundary_collisions() {
        let digest = [0u8; 32];
        let a = fingerprint("ab", "c", &json!({}), &digest);
        let b = fingerprint("a", "bc", &json!({}), &digest);
        assert_ne!(a, b);
    }
}
