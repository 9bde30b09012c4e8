//! Deterministic cache keys
//!
//! A key has the form `<base_key>:<hex(sha256(canonical_bytes))>`. The payload
//! is canonicalized through `serde_json::Value`: object members are written in
//! sorted order so map iteration order never leaks into the key, while arrays
//! keep their declared order.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::CacheError;

/// A derived cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key: String,
    base_len: usize,
}

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// The namespace the key was derived under.
    pub fn base(&self) -> &str {
        &self.key[..self.base_len]
    }

    /// Hex-encoded SHA-256 digest of the canonical payload.
    pub fn content_hash(&self) -> &str {
        &self.key[self.base_len + 1..]
    }

    pub fn into_string(self) -> String {
        self.key
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.key
    }
}

/// Builds cache keys from a base namespace and the content of a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyDeriver;

impl KeyDeriver {
    pub fn new() -> Self {
        Self
    }

    pub fn derive<P>(&self, base_key: &str, payload: &P) -> Result<CacheKey, CacheError>
    where
        P: Serialize + ?Sized,
    {
        validate_key(base_key)?;

        let digest = Sha256::digest(canonical_bytes(payload)?);
        let mut key = String::with_capacity(base_key.len() + 1 + digest.len() * 2);
        key.push_str(base_key);
        key.push(':');
        key.push_str(&hex::encode(digest));

        Ok(CacheKey {
            key,
            base_len: base_key.len(),
        })
    }
}

/// Reject empty or malformed keys before any store is touched.
pub(crate) fn validate_key(key: &str) -> Result<(), CacheError> {
    if key.trim().is_empty() {
        return Err(CacheError::InvalidKey("key is empty".to_owned()));
    }
    if key.trim() != key {
        return Err(CacheError::InvalidKey(format!(
            "key has surrounding whitespace: {key:?}"
        )));
    }
    if key.chars().any(char::is_control) {
        return Err(CacheError::InvalidKey(format!(
            "key contains control characters: {key:?}"
        )));
    }
    Ok(())
}

fn canonical_bytes<P>(payload: &P) -> Result<Vec<u8>, CacheError>
where
    P: Serialize + ?Sized,
{
    let value = serde_json::to_value(payload)?;
    let mut out = Vec::with_capacity(128);
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &Value, out: &mut Vec<u8>) -> Result<(), CacheError> {
    match value {
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push(b'{');
            for (i, (name, member)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                serde_json::to_writer(&mut *out, name)?;
                out.push(b':');
                write_canonical(member, out)?;
            }
            out.push(b'}');
        }
        scalar => serde_json::to_writer(&mut *out, scalar)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;
    use std::collections::HashMap;

    #[derive(Serialize)]
    struct GetProduct {
        id: String,
        include_stock: bool,
        tags: Vec<String>,
    }

    fn request(id: &str, include_stock: bool) -> GetProduct {
        GetProduct {
            id: id.to_owned(),
            include_stock,
            tags: vec!["a".to_owned(), "b".to_owned()],
        }
    }

    #[test]
    fn test_identical_requests_share_a_key() {
        let deriver = KeyDeriver::new();
        let a = deriver.derive("product", &request("42", true)).unwrap();
        let b = deriver.derive("product", &request("42", true)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.base(), "product");
        assert_eq!(a.content_hash().len(), 64);
        assert!(a.as_str().starts_with("product:"));
    }

    #[test]
    fn test_any_field_change_changes_the_key() {
        let deriver = KeyDeriver::new();
        let base = deriver.derive("product", &request("42", true)).unwrap();
        let other_id = deriver.derive("product", &request("43", true)).unwrap();
        let other_flag = deriver.derive("product", &request("42", false)).unwrap();

        let mut reordered = request("42", true);
        reordered.tags.reverse();
        let other_order = deriver.derive("product", &reordered).unwrap();

        assert_ne!(base, other_id);
        assert_ne!(base, other_flag);
        assert_ne!(base, other_order);
        assert_ne!(other_id, other_flag);
    }

    #[test]
    fn test_map_insertion_order_is_irrelevant() {
        let deriver = KeyDeriver::new();
        let mut first = HashMap::new();
        let mut second = HashMap::new();
        for i in 0..32 {
            first.insert(format!("k{i}"), i);
        }
        for i in (0..32).rev() {
            second.insert(format!("k{i}"), i);
        }
        assert_eq!(
            deriver.derive("filter", &first).unwrap(),
            deriver.derive("filter", &second).unwrap()
        );
    }

    #[test]
    fn test_no_collisions_across_corpus() {
        let deriver = KeyDeriver::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..500 {
            let key = deriver
                .derive("product", &request(&i.to_string(), i % 2 == 0))
                .unwrap();
            assert!(seen.insert(key), "collision at {i}");
        }
    }

    #[test]
    fn test_base_key_is_validated() {
        let deriver = KeyDeriver::new();
        assert!(matches!(
            deriver.derive("", &1),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            deriver.derive("   ", &1),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            deriver.derive(" product", &1),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(matches!(
            deriver.derive("prod\nuct", &1),
            Err(CacheError::InvalidKey(_))
        ));
        assert!(
            deriver
                .derive("product:123e4567-e89b-12d3-a456-426614174000", &1)
                .is_ok()
        );
    }

    #[test]
    fn test_unserializable_payload_is_rejected() {
        let deriver = KeyDeriver::new();
        let mut tuple_keys = HashMap::new();
        tuple_keys.insert((1, 2), "x");
        assert!(matches!(
            deriver.derive("bad", &tuple_keys),
            Err(CacheError::Serialization(_))
        ));
    }
}
