//! Post-render pipeline: buffer-to-buffer transformations applied to the
//! rendered manifests before materialization. The namespace transformer is
//! the one mandatory stage.

use serde::Deserialize;
use serde_yaml::{Mapping, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PostRenderError {
    #[error("decoding rendered manifest: {0}")]
    Decode(#[from] serde_yaml::Error),
    #[error("rendered manifest is not valid UTF-8")]
    Encoding,
}

pub trait PostRenderer: Send + Sync {
    fn run(&self, manifests: Vec<u8>) -> Result<Vec<u8>, PostRenderError>;
}

/// Applies the configured stages in order over the same buffer.
pub fn run_pipeline(
    stages: &[&dyn PostRenderer],
    manifests: Vec<u8>,
) -> Result<Vec<u8>, PostRenderError> {
    stages
        .iter()
        .try_fold(manifests, |buffer, stage| stage.run(buffer))
}

/// Kinds that exist outside any namespace; everything else is treated as
/// namespaced. Offline there is no discovery API to ask, so the decision is
/// made against this list.
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "APIService",
    "CSIDriver",
    "CSINode",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "IngressClass",
    "MutatingWebhookConfiguration",
    "Namespace",
    "Node",
    "PersistentVolume",
    "PriorityClass",
    "RuntimeClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
    "VolumeAttachment",
];

/// Rewrites `metadata.namespace` of every namespaced resource to the
/// release's target namespace.
pub struct NamespaceTransformer {
    namespace: String,
}

impl NamespaceTransformer {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

impl PostRenderer for NamespaceTransformer {
    fn run(&self, manifests: Vec<u8>) -> Result<Vec<u8>, PostRenderError> {
        let text = String::from_utf8(manifests).map_err(|_| PostRenderError::Encoding)?;
        let mut documents = Vec::new();
        for document in serde_yaml::Deserializer::from_str(&text) {
            let mut value = Value::deserialize(document)?;
            if let Value::Mapping(_) = value {
                if is_namespaced(&value) {
                    set_namespace(&mut value, &self.namespace);
                }
                documents.push(serde_yaml::to_string(&value)?);
            }
        }
        Ok(documents.join("---\n").into_bytes())
    }
}

fn is_namespaced(value: &Value) -> bool {
    value
        .get("kind")
        .and_then(|k| k.as_str())
        .is_some_and(|kind| !CLUSTER_SCOPED_KINDS.contains(&kind))
}

fn set_namespace(value: &mut Value, namespace: &str) {
    let Value::Mapping(root) = value else { return };
    let metadata = root
        .entry(Value::String("metadata".to_string()))
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if let Value::Mapping(metadata) = metadata {
        metadata.insert(
            Value::String("namespace".to_string()),
            Value::String(namespace.to_string()),
        );
    }
}
