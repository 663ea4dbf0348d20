use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::MetadataError;

static NAME_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

fn is_valid_name(name: &str) -> bool {
    NAME_PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").ok())
        .as_ref()
        .map(|re| re.is_match(name))
        .unwrap_or(false)
}

pub fn validate_namespace(namespace: &str) -> Result<(), MetadataError> {
    if is_valid_name(namespace) {
        Ok(())
    } else {
        Err(MetadataError::InvalidNamespace(namespace.to_string()))
    }
}

pub fn validate_key(key: &str) -> Result<(), MetadataError> {
    if is_valid_name(key) {
        Ok(())
    } else {
        Err(MetadataError::InvalidKey(key.to_string()))
    }
}

/// Destination for per-request metadata the host forwards to later filters.
pub trait MetadataSink {
    /// Attaches every entry under `namespace`, overwriting keys already set.
    /// A malformed namespace or key rejects the whole call.
    fn publish(&mut self, namespace: &str, entries: Map<String, Value>)
    -> Result<(), MetadataError>;
}

/// In-memory metadata attached to one request, shaped like the host's
/// `namespace -> struct` dynamic metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct DynamicMetadata {
    namespaces: BTreeMap<String, Map<String, Value>>,
}

impl DynamicMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    pub fn namespace(&self, namespace: &str) -> Option<&Map<String, Value>> {
        self.namespaces.get(namespace)
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<&Value> {
        self.namespaces.get(namespace).and_then(|m| m.get(key))
    }

    pub fn to_value(&self) -> Value {
        Value::Object(
            self.namespaces
                .iter()
                .map(|(ns, fields)| (ns.clone(), Value::Object(fields.clone())))
                .collect(),
        )
    }
}

impl MetadataSink for DynamicMetadata {
    fn publish(
        &mut self,
        namespace: &str,
        entries: Map<String, Value>,
    ) -> Result<(), MetadataError> {
        validate_namespace(namespace)?;
        for key in entries.keys() {
            validate_key(key)?;
        }
        if entries.is_empty() {
            return Ok(());
        }
        let fields = self.namespaces.entry(namespace.to_string()).or_default();
        for (key, value) in entries {
            fields.insert(key, value);
        }
        Ok(())
    }
}
