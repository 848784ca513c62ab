//! Chart sources: a uniform handle over HTTP index-based repositories and OCI
//! registries. Both implementations feed the same artifact cache so that any
//! number of releases pointing at one `(url, chart, version)` triple cause a
//! single remote pull.

pub mod auth;
pub mod index;
pub mod oci;
pub mod provider;

use std::path::PathBuf;
use thiserror::Error;

/// One resolve operation: obtain a local chart archive for `(chart, version)`.
/// `version` may be an exact semver or a range; ranges resolve to the highest
/// matching published version.
pub trait ChartSource: Send + Sync {
    fn resolve(&self, chart: &str, version: &str) -> Result<ChartArtifact, SourceError>;
}

/// A fetched chart archive plus its resolved metadata.
#[derive(Debug, Clone)]
pub struct ChartArtifact {
    pub archive: PathBuf,
    pub name: String,
    pub version: String,
    pub digest: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("chart `{0}` not found in repository")]
    NotFound(String),
    #[error("no version of `{chart}` matches `{requirement}`")]
    NoMatchingVersion { chart: String, requirement: String },
    #[error("invalid version requirement `{0}`: {1}")]
    Requirement(String, String),
    #[error("fetching `{url}`: {err}")]
    Transport { url: String, err: String },
    #[error("decoding repository index from `{url}`: {err}")]
    Index { url: String, err: String },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Normalizes a repository URL for use as a cache key: the scheme is
/// lowercased and the trailing slash trimmed; an `oci://` prefix survives.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    match trimmed.split_once("://") {
        Some((scheme, rest)) => format!("{}://{}", scheme.to_ascii_lowercase(), rest),
        None => trimmed.to_string(),
    }
}
