//! Canonical serialization and fingerprinting.
//!
//! Every fingerprint in the system is a lowercase hex SHA-256 over the
//! canonical form produced here: UTF-8 JSON with lexicographically sorted
//! mapping keys, no insignificant whitespace, shortest round-trip numbers,
//! literal booleans and nulls, and order-preserving sequences. Binary blobs
//! travel as padded base64 strings, so they canonicalize as ordinary strings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CanonError {
    #[error("non-finite float cannot be canonicalized")]
    NonFiniteFloat,
    #[error("unsupported value in canonical form: {0}")]
    UnsupportedValue(String),
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CanonError {
    pub fn code(&self) -> &'static str {
        match self {
            CanonError::NonFiniteFloat => "E_CANON_FLOAT",
            CanonError::UnsupportedValue(_) => "E_CANON_VALUE",
            CanonError::Serialize(_) => "E_CANON_SERIALIZE",
        }
    }
}

/// Lowercase hex SHA-256 over a canonical serialization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 16 hex chars, the short form used in redaction tokens.
    pub fn short(&self) -> &str {
        &self.0[..16]
    }
}

impl Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Fingerprint {
    fn from(hex: String) -> Self {
        Self(hex)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Fingerprint(hex::encode(hasher.finalize()))
}

/// Binary blobs enter the canonical value space as padded base64 strings,
/// so they serialize and fingerprint as ordinary strings.
pub fn encode_blob(bytes: &[u8]) -> String {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

/// Inverse of [`encode_blob`].
pub fn decode_blob(encoded: &str) -> Result<Vec<u8>, CanonError> {
    use base64::Engine as _;
    base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| CanonError::UnsupportedValue(format!("invalid base64 blob: {err}")))
}

/// Canonical UTF-8 JSON bytes for a structured value.
pub fn canonicalize(value: &serde_json::Value) -> Result<Vec<u8>, CanonError> {
    let mut out = Vec::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

/// Fingerprint of the canonical serialization of `value`.
pub fn fingerprint(value: &serde_json::Value) -> Result<Fingerprint, CanonError> {
    Ok(sha256_hex(&canonicalize(value)?))
}

fn write_canonical(value: &serde_json::Value, out: &mut Vec<u8>) -> Result<(), CanonError> {
    match value {
        serde_json::Value::Null => out.extend_from_slice(b"null"),
        serde_json::Value::Bool(true) => out.extend_from_slice(b"true"),
        serde_json::Value::Bool(false) => out.extend_from_slice(b"false"),
        serde_json::Value::Number(n) => {
            if n.as_f64().is_some_and(|f| !f.is_finite()) {
                return Err(CanonError::NonFiniteFloat);
            }
            // serde_json emits the shortest round-trip form for both
            // integers and floats.
            out.extend_from_slice(&serde_json::to_vec(n)?);
        }
        serde_json::Value::String(s) => out.extend_from_slice(&serde_json::to_vec(s)?),
        serde_json::Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out)?;
            }
            out.push(b']');
        }
        serde_json::Value::Object(map) => {
            // Explicit sort: canonical order must not depend on the map
            // implementation serde_json was built with.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(&serde_json::to_vec(key)?);
                out.push(b':');
                write_canonical(&map[key], out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}

/// Bridges a YAML value into the JSON value space canonicalization works on.
///
/// YAML-only constructs have no canonical form: non-string mapping keys and
/// tagged values are rejected, as are floats JSON cannot represent.
pub fn yaml_to_json(value: serde_yaml::Value) -> Result<serde_json::Value, CanonError> {
    match value {
        serde_yaml::Value::Null => Ok(serde_json::Value::Null),
        serde_yaml::Value::Bool(b) => Ok(serde_json::Value::Bool(b)),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(serde_json::Value::from(i))
            } else if let Some(u) = n.as_u64() {
                Ok(serde_json::Value::from(u))
            } else {
                let f = n.as_f64().ok_or(CanonError::NonFiniteFloat)?;
                serde_json::Number::from_f64(f)
                    .map(serde_json::Value::Number)
                    .ok_or(CanonError::NonFiniteFloat)
            }
        }
        serde_yaml::Value::String(s) => Ok(serde_json::Value::String(s)),
        serde_yaml::Value::Sequence(items) => Ok(serde_json::Value::Array(
            items
                .into_iter()
                .map(yaml_to_json)
                .collect::<Result<_, _>>()?,
        )),
        serde_yaml::Value::Mapping(mapping) => {
            let mut map = serde_json::Map::with_capacity(mapping.len());
            for (key, val) in mapping {
                let serde_yaml::Value::String(key) = key else {
                    return Err(CanonError::UnsupportedValue(
                        "mapping keys must be strings".to_string(),
                    ));
                };
                map.insert(key, yaml_to_json(val)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        serde_yaml::Value::Tagged(tagged) => Err(CanonError::UnsupportedValue(format!(
            "tagged value `{}`",
            tagged.tag
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn canonical_form_sorts_keys_and_drops_whitespace() {
        let value = json!({"b": 1, "a": {"z": [1, 2], "y": null}, "c": true});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(
            r#"{"a":{"y":null,"z":[1,2]},"b":1,"c":true}"#,
            String::from_utf8(bytes).unwrap()
        );
    }

    #[test]
    fn fingerprint_is_stable_under_key_insertion_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"x": 1, "y": {"k": "v", "j": 2}}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"y": {"j": 2, "k": "v"}, "x": 1}"#).unwrap();
        assert_eq!(fingerprint(&a).unwrap(), fingerprint(&b).unwrap());
    }

    #[test]
    fn fingerprint_round_trips_through_its_own_canonical_form() {
        let value = json!({
            "name": "extract-users",
            "limit": 100,
            "ratio": 0.25,
            "tags": ["a", "b"],
            "nested": {"deep": [{"k": false}]}
        });
        let bytes = canonicalize(&value).unwrap();
        let reparsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(fingerprint(&value).unwrap(), fingerprint(&reparsed).unwrap());
    }

    #[test]
    fn numbers_keep_shortest_round_trip_form() {
        let value = json!({"f": 0.1, "i": 42, "neg": -7});
        let bytes = canonicalize(&value).unwrap();
        assert_eq!(
            r#"{"f":0.1,"i":42,"neg":-7}"#,
            String::from_utf8(bytes).unwrap()
        );
    }

    #[test]
    fn yaml_bridge_rejects_non_string_keys() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("1: one\n2: two\n").unwrap();
        let err = yaml_to_json(yaml).unwrap_err();
        assert_eq!("E_CANON_VALUE", err.code());
    }

    #[test]
    fn yaml_bridge_rejects_non_finite_floats() {
        let yaml: serde_yaml::Value = serde_yaml::from_str("bad: .nan\n").unwrap();
        let err = yaml_to_json(yaml).unwrap_err();
        assert_eq!("E_CANON_FLOAT", err.code());
    }

    #[test]
    fn yaml_bridge_preserves_scalars_and_order_of_sequences() {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str("steps:\n  - first\n  - second\ncount: 2\n").unwrap();
        let json = yaml_to_json(yaml).unwrap();
        assert_eq!(json!({"steps": ["first", "second"], "count": 2}), json);
    }

    #[test]
    fn blobs_round_trip_through_padded_base64() {
        let blob = vec![0u8, 159, 146, 150];
        let encoded = encode_blob(&blob);
        assert!(encoded.ends_with('='), "{encoded}");
        assert_eq!(blob, decode_blob(&encoded).unwrap());
        assert!(decode_blob("not base64!").is_err());
    }

    #[test]
    fn fingerprints_are_lowercase_hex64() {
        let fp = fingerprint(&json!({"k": "v"})).unwrap();
        assert_eq!(64, fp.as_str().len());
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(16, fp.short().len());
    }
}
