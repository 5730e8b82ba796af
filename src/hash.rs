use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("value is not serializable: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Compute a stable hex digest for any serializable value.
///
/// Object keys are sorted before hashing, so the digest only depends on the
/// content of the value and not on the order its maps were built in.
pub fn hash_value<T: Serialize + ?Sized>(value: &T) -> Result<String, HashError> {
    let value = serde_json::to_value(value)?;
    let mut canonical = String::new();
    write_canonical(&value, &mut canonical);
    Ok(hash_bytes(canonical.as_bytes()))
}

/// Hex encoded SHA-256 of raw bytes
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_equal_values_hash_equal() {
        let a = json!({"pipeline": "SELECT 1", "batch_index": 3, "byte_count": 120});
        let b = json!({"byte_count": 120, "batch_index": 3, "pipeline": "SELECT 1"});
        assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn test_different_values_hash_different() {
        let a = json!({"batch_index": 1});
        let b = json!({"batch_index": 2});
        assert_ne!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn test_nested_key_order_ignored() {
        let a = json!({"outer": {"x": 1, "y": [1, {"b": 2, "a": 1}]}});
        let b = json!({"outer": {"y": [1, {"a": 1, "b": 2}], "x": 1}});
        assert_eq!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn test_array_order_matters() {
        let a = json!(["a", "b"]);
        let b = json!(["b", "a"]);
        assert_ne!(hash_value(&a).unwrap(), hash_value(&b).unwrap());
    }

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = hash_bytes(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
