//! BLAKE3 content hashing for inputs, artefacts, and manifests.

/// Hash raw bytes. Returns `"blake3:{hex}"`.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("blake3:{}", blake3::hash(bytes).to_hex())
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash any serializable value through its canonical JSON form.
///
/// JSON object keys are emitted in sorted order, so two structurally equal
/// values always hash identically regardless of how they were built.
pub fn hash_value<T: serde::Serialize>(value: &T) -> Result<String, String> {
    let json = serde_json::to_string(value).map_err(|e| format!("hash serialize error: {}", e))?;
    Ok(hash_string(&json))
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

/// The bare hex digest of a content hash, without the `blake3:` prefix.
/// Used for blob file names.
pub fn hex_digest(hash: &str) -> &str {
    hash.strip_prefix("blake3:").unwrap_or(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_string_deterministic() {
        let h1 = hash_string("hello");
        let h2 = hash_string("hello");
        let h3 = hash_string("world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert!(h1.starts_with("blake3:"));
        assert_eq!(h1.len(), 7 + 64); // "blake3:" + 64 hex chars
    }

    #[test]
    fn test_hash_bytes_matches_string() {
        assert_eq!(hash_bytes(b"abc"), hash_string("abc"));
    }

    #[test]
    fn test_hash_value_key_order_independent() {
        let a: serde_json::Value = serde_json::from_str(r#"{"x":1,"y":2}"#).unwrap();
        let b: serde_json::Value = serde_json::from_str(r#"{"y":2,"x":1}"#).unwrap();
        assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn test_hash_value_distinguishes_content() {
        let a = serde_json::json!({"topic": "volcanoes"});
        let b = serde_json::json!({"topic": "glaciers"});
        assert_ne!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn test_composite_hash_order_sensitive() {
        let h = composite_hash(&["blake3:aaa", "blake3:bbb"]);
        assert!(h.starts_with("blake3:"));
        let h2 = composite_hash(&["blake3:bbb", "blake3:aaa"]);
        assert_ne!(h, h2);
    }

    #[test]
    fn test_composite_hash_not_concat_ambiguous() {
        // ["ab", "c"] and ["a", "bc"] must differ
        assert_ne!(composite_hash(&["ab", "c"]), composite_hash(&["a", "bc"]));
    }

    #[test]
    fn test_hex_digest() {
        let h = hash_string("x");
        let hex = hex_digest(&h);
        assert_eq!(hex.len(), 64);
        assert!(!hex.contains(':'));
        assert_eq!(hex_digest("deadbeef"), "deadbeef");
    }
}
