use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_yaml::Value;
use thiserror::Error;

use super::key::ResourceKey;

pub const SECRET_KIND: &str = "Secret";
pub const CONFIG_MAP_KIND: &str = "ConfigMap";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("decoding base64 data entry `{entry}` of {key}: {err}")]
    Base64 {
        key: ResourceKey,
        entry: String,
        err: String,
    },
    #[error("data entry `{entry}` of {key} is not a string")]
    NotAString { key: ResourceKey, entry: String },
}

/// A single ingested YAML object. Immutable after ingestion: `source` keeps the
/// exact substituted text of the document so passthrough kinds can be emitted
/// byte-accurate, while `body` is the decoded value used for lookups.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    key: ResourceKey,
    body: Value,
    source: String,
}

impl Document {
    pub fn new(key: ResourceKey, body: Value, source: String) -> Self {
        Self { key, body, source }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Reads the named entry of the document's `data` map. Secrets may carry
    /// plain strings under `stringData` (checked first) and base64-encoded
    /// content under `data`; ConfigMaps only carry plain `data` strings.
    pub fn data_entry(&self, entry: &str) -> Result<Option<String>, DocumentError> {
        if self.key.kind == SECRET_KIND {
            if let Some(plain) = self.map_string("stringData", entry)? {
                return Ok(Some(plain));
            }
            let Some(encoded) = self.map_string("data", entry)? else {
                return Ok(None);
            };
            let decoded = BASE64
                .decode(encoded.as_bytes())
                .map_err(|err| DocumentError::Base64 {
                    key: self.key.clone(),
                    entry: entry.to_string(),
                    err: err.to_string(),
                })?;
            return Ok(Some(String::from_utf8_lossy(&decoded).into_owned()));
        }
        self.map_string("data", entry)
    }

    fn map_string(&self, map: &str, entry: &str) -> Result<Option<String>, DocumentError> {
        match self.body.get(map).and_then(|m| m.get(entry)) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(_) => Err(DocumentError::NotAString {
                key: self.key.clone(),
                entry: entry.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn doc(kind: &str, yaml: &str) -> Document {
        Document::new(
            ResourceKey::new("", kind, "ns", "doc"),
            serde_yaml::from_str(yaml).unwrap(),
            yaml.to_string(),
        )
    }

    #[test]
    fn test_config_map_data_entry() {
        let cm = doc("ConfigMap", "data:\n  values.yaml: \"image:\\n  tag: v1\\n\"\n");
        let content = cm.data_entry("values.yaml").unwrap().unwrap();
        assert!(content.contains("tag: v1"));
        assert_eq!(cm.data_entry("missing").unwrap(), None);
    }

    #[test]
    fn test_secret_base64_data() {
        // "hunter2" base64-encoded
        let secret = doc("Secret", "data:\n  password: aHVudGVyMg==\n");
        assert_eq!(
            secret.data_entry("password").unwrap().unwrap(),
            "hunter2"
        );
    }

    #[test]
    fn test_secret_string_data_wins() {
        let secret = doc(
            "Secret",
            "stringData:\n  password: plain\ndata:\n  password: aHVudGVyMg==\n",
        );
        assert_eq!(secret.data_entry("password").unwrap().unwrap(), "plain");
    }

    #[test]
    fn test_invalid_base64_is_an_error() {
        let secret = doc("Secret", "data:\n  password: '!!!not-base64'\n");
        assert_matches!(
            secret.data_entry("password"),
            Err(DocumentError::Base64 { .. })
        );
    }
}
