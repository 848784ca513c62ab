use std::fmt;
use thiserror::Error;

use crate::resource::key::ResourceKey;

/// Build failure taxonomy. Every variant carries the reference key(s) it
/// concerns and is surfaced to the orchestrator verbatim; recovery is never
/// attempted below the orchestrator.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("duplicate resource key: {0}")]
    DuplicateResource(ResourceKey),
    #[error("unresolved reference {reference} required by {referrer}")]
    UnresolvedReference {
        referrer: ResourceKey,
        reference: ResourceKey,
    },
    #[error("dependency cycle: {}", format_cycle(.0))]
    CyclicDependency(Vec<ResourceKey>),
    #[error("authentication for {0}: {1}")]
    AuthFailure(ResourceKey, String),
    #[error("chart unavailable for {0}: {1}")]
    ChartUnavailable(ResourceKey, String),
    #[error("rendering {0}: {1}")]
    RenderFailure(ResourceKey, String),
    #[error("invalid policy in {0}: {1}")]
    InvalidPolicy(ResourceKey, String),
    #[error("build canceled")]
    Canceled,
    #[error(transparent)]
    Aggregate(AggregateError),
}

fn format_cycle(keys: &[ResourceKey]) -> String {
    keys.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Collected per-release failures returned when `FailFast` is off.
#[derive(Debug)]
pub struct AggregateError(pub Vec<(ResourceKey, BuildError)>);

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} release(s) failed:", self.0.len())?;
        for (key, err) in &self.0 {
            write!(f, " [{key}: {err}]")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}
