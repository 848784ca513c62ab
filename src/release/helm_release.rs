use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

use super::{ReleaseDecodeError, SOURCE_GROUP};
use crate::resource::document::Document;
use crate::resource::key::ResourceKey;

pub const HELM_RELEASE_KIND: &str = "HelmRelease";

/// A decoded `HelmRelease` document: the rendering target of a build.
#[derive(Debug, Clone)]
pub struct HelmRelease {
    key: ResourceKey,
    generation: i64,
    pub spec: HelmReleaseSpec,
}

impl HelmRelease {
    pub fn from_document(document: &Document) -> Result<Self, ReleaseDecodeError> {
        let key = document.key().clone();
        let spec_value = document
            .body()
            .get("spec")
            .cloned()
            .ok_or_else(|| ReleaseDecodeError::MissingSpec(key.clone()))?;
        let spec: HelmReleaseSpec = serde_yaml::from_value(spec_value)
            .map_err(|err| ReleaseDecodeError::Spec(key.clone(), err.to_string()))?;
        let generation = document
            .body()
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(|g| g.as_i64())
            .unwrap_or(1);
        Ok(Self {
            key,
            generation,
            spec,
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    /// Generation of the declaring document, folded into variant identity when
    /// the release selects a chart subset through `valuesFiles`.
    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// The Helm release name, defaulting to the document name.
    pub fn release_name(&self) -> &str {
        self.spec
            .release_name
            .as_deref()
            .unwrap_or(&self.key.name)
    }

    /// The namespace rendered resources are placed in. Falls back to the
    /// document's namespace; the renderer applies the final `default`.
    pub fn target_namespace(&self) -> &str {
        self.spec
            .target_namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(&self.key.namespace)
    }

    /// Reference key of the chart source this release builds from.
    pub fn source_key(&self) -> ResourceKey {
        let source_ref = &self.spec.chart.spec.source_ref;
        ResourceKey::new(
            SOURCE_GROUP,
            source_ref.kind.clone(),
            source_ref.namespace.clone().unwrap_or_default(),
            source_ref.name.clone(),
        )
        .resolved_in(&self.key.namespace)
    }

    /// Reference key of a values reference, resolved in the release namespace.
    pub fn values_reference_key(&self, reference: &ValuesReference) -> ResourceKey {
        ResourceKey::new("", reference.kind.clone(), "", reference.name.clone())
            .resolved_in(&self.key.namespace)
    }

    /// The requested chart version, `*` when unconstrained.
    pub fn version_requirement(&self) -> &str {
        self.spec
            .chart
            .spec
            .version
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or("*")
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.spec
            .timeout
            .as_deref()
            .and_then(|t| duration_str::parse(t).ok())
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmReleaseSpec {
    pub release_name: Option<String>,
    pub target_namespace: Option<String>,
    pub chart: ChartTemplate,
    pub values_from: Vec<ValuesReference>,
    pub values: Option<serde_yaml::Value>,
    pub install: Option<InstallPolicy>,
    pub timeout: Option<String>,
    pub kube_version: Option<String>,
    pub api_versions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChartTemplate {
    pub spec: ChartSpec,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ChartSpec {
    pub chart: String,
    pub version: Option<String>,
    pub source_ref: SourceRef,
    pub values_files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceRef {
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
}

impl Default for SourceRef {
    fn default() -> Self {
        Self {
            kind: "HelmRepository".to_string(),
            name: String::new(),
            namespace: None,
        }
    }
}

/// One entry of `spec.valuesFrom`, applied in declared order.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValuesReference {
    pub kind: String,
    pub name: String,
    pub values_key: Option<String>,
    pub target_path: Option<String>,
    pub optional: bool,
}

impl Default for ValuesReference {
    fn default() -> Self {
        Self {
            kind: "ConfigMap".to_string(),
            name: String::new(),
            values_key: None,
            target_path: None,
            optional: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct InstallPolicy {
    pub crds: Option<String>,
    pub skip_crds: bool,
    pub disable_hooks: bool,
    #[serde(rename = "disableOpenAPIValidation")]
    pub disable_openapi_validation: bool,
}

/// How custom resource definitions are treated during the dry-run install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrdPolicy {
    Create,
    CreateReplace,
    Skip,
}

impl CrdPolicy {
    pub fn include_crds(&self) -> bool {
        !matches!(self, CrdPolicy::Skip)
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unrecognized CRD policy `{0}`")]
pub struct UnknownCrdPolicy(pub String);

impl InstallPolicy {
    /// The `crds` field takes precedence when set, otherwise the legacy
    /// `skipCRDs` flag decides. Unknown policy strings are fatal.
    pub fn crd_policy(&self) -> Result<CrdPolicy, UnknownCrdPolicy> {
        match self.crds.as_deref() {
            Some("Create") => Ok(CrdPolicy::Create),
            Some("CreateReplace") => Ok(CrdPolicy::CreateReplace),
            Some("Skip") => Ok(CrdPolicy::Skip),
            Some(other) => Err(UnknownCrdPolicy(other.to_string())),
            None if self.skip_crds => Ok(CrdPolicy::Skip),
            None => Ok(CrdPolicy::Create),
        }
    }
}
