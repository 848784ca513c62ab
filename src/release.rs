pub mod helm_release;
pub mod helm_repository;

pub use helm_release::{HELM_RELEASE_KIND, HelmRelease};
pub use helm_repository::{HELM_REPOSITORY_KIND, HelmRepository};

use thiserror::Error;

use crate::resource::key::ResourceKey;

/// The Flux API group the chart sources live in.
pub const SOURCE_GROUP: &str = "source.toolkit.fluxcd.io";

#[derive(Debug, Error)]
pub enum ReleaseDecodeError {
    #[error("decoding spec of {0}: {1}")]
    Spec(ResourceKey, String),
    #[error("{0} has no spec")]
    MissingSpec(ResourceKey),
}
