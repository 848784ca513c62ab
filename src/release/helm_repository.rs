use serde::Deserialize;
use std::time::Duration;

use super::ReleaseDecodeError;
use crate::resource::document::Document;
use crate::resource::key::ResourceKey;

pub const HELM_REPOSITORY_KIND: &str = "HelmRepository";

const DEFAULT_REPOSITORY_TIMEOUT: Duration = Duration::from_secs(60);

/// A decoded `HelmRepository` document: a pointer to an HTTP index or an OCI
/// registry serving charts.
#[derive(Debug, Clone)]
pub struct HelmRepository {
    key: ResourceKey,
    pub spec: HelmRepositorySpec,
}

impl HelmRepository {
    pub fn from_document(document: &Document) -> Result<Self, ReleaseDecodeError> {
        let key = document.key().clone();
        let spec_value = document
            .body()
            .get("spec")
            .cloned()
            .ok_or_else(|| ReleaseDecodeError::MissingSpec(key.clone()))?;
        let spec: HelmRepositorySpec = serde_yaml::from_value(spec_value)
            .map_err(|err| ReleaseDecodeError::Spec(key.clone(), err.to_string()))?;
        Ok(Self { key, spec })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn secret_key(&self) -> Option<ResourceKey> {
        self.spec
            .secret_ref
            .as_ref()
            .map(|r| ResourceKey::new("", "Secret", "", r.name.clone()).resolved_in(&self.key.namespace))
    }

    pub fn cert_secret_key(&self) -> Option<ResourceKey> {
        self.spec
            .cert_secret_ref
            .as_ref()
            .map(|r| ResourceKey::new("", "Secret", "", r.name.clone()).resolved_in(&self.key.namespace))
    }

    /// Network timeout applied to index and chart downloads.
    pub fn timeout(&self) -> Duration {
        self.spec
            .timeout
            .as_deref()
            .and_then(|t| duration_str::parse(t).ok())
            .unwrap_or(DEFAULT_REPOSITORY_TIMEOUT)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct HelmRepositorySpec {
    pub url: String,
    pub secret_ref: Option<LocalObjectReference>,
    pub cert_secret_ref: Option<LocalObjectReference>,
    #[serde(rename = "type")]
    pub repository_type: RepositoryType,
    pub provider: Provider,
    pub pass_credentials: bool,
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    #[default]
    Default,
    Oci,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    #[default]
    Generic,
    Aws,
    Azure,
    Gcp,
}
