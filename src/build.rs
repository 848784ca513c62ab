//! Build orchestration: walks the release declarations, dispatches the
//! per-release pipeline onto a bounded worker pool and assembles the final
//! YAML stream.

pub mod graph;

use crossbeam::channel::{RecvTimeoutError, unbounded};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::chart::builder::ChartBuilder;
use crate::error::{AggregateError, BuildError};
use crate::event::cancellation::{CancellationBroadcast, CancellationConsumer};
use crate::release::helm_repository::HELM_REPOSITORY_KIND as REPOSITORY_KIND;
use crate::release::{HELM_RELEASE_KIND, HelmRelease};
use crate::render::engine::TemplateEngine;
use crate::render::{ReleaseRenderer, kustomize};
use crate::resource::document::{CONFIG_MAP_KIND, SECRET_KIND};
use crate::resource::key::ResourceKey;
use crate::resource::store::ResourceStore;
use crate::utils::threads::spawn_named_thread;

const DEFAULT_WORKERS: usize = 4;

/// Kinds consumed by the build itself; everything else passes through to the
/// output unchanged.
const RECOGNIZED_KINDS: &[&str] = &[
    HELM_RELEASE_KIND,
    REPOSITORY_KIND,
    CONFIG_MAP_KIND,
    SECRET_KIND,
    kustomize::KUSTOMIZATION_KIND,
];

#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Abort on the first error instead of aggregating.
    pub fail_fast: bool,
    /// Additional API versions injected into the templating context.
    pub api_versions: Vec<String>,
    /// Kubernetes version reported to charts.
    pub kube_version: Option<String>,
    /// Keep hook manifests in the output.
    pub include_helm_hooks: bool,
    /// Upper bound on concurrent release builds.
    pub workers: usize,
    /// Directory for extracted chart artifacts; temporary when unset.
    pub cache_dir: Option<PathBuf>,
    /// Overall build deadline.
    pub deadline: Option<Duration>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            api_versions: Vec::new(),
            kube_version: None,
            include_helm_hooks: false,
            workers: DEFAULT_WORKERS,
            cache_dir: None,
            deadline: None,
        }
    }
}

impl BuildConfig {
    fn worker_count(&self, jobs: usize) -> usize {
        self.workers.max(1).min(jobs.max(1))
    }
}

/// The assembled stream plus the build's failure, if any. With `FailFast`
/// off, failing releases are dropped from the stream and enumerated in the
/// aggregate error while the others are kept.
pub struct BuildOutcome {
    pub yaml: String,
    pub error: Option<BuildError>,
}

pub struct Orchestrator {
    store: Arc<ResourceStore>,
    engine: Arc<dyn TemplateEngine>,
    builder: Arc<ChartBuilder>,
    config: BuildConfig,
    cancellation: CancellationBroadcast,
}

impl Orchestrator {
    pub fn new(
        store: Arc<ResourceStore>,
        engine: Arc<dyn TemplateEngine>,
        builder: Arc<ChartBuilder>,
        config: BuildConfig,
    ) -> Self {
        Self {
            store,
            engine,
            builder,
            config,
            cancellation: CancellationBroadcast::default(),
        }
    }

    /// Handle for external cancellation (signal handlers).
    pub fn canceller(&self) -> CancellationBroadcast {
        self.cancellation.clone()
    }

    pub fn run(&self) -> Result<BuildOutcome, BuildError> {
        let mut failures: Vec<(ResourceKey, BuildError)> = Vec::new();
        let mut releases = Vec::new();
        for document in self.store.by_kind(HELM_RELEASE_KIND) {
            match HelmRelease::from_document(document) {
                Ok(release) => releases.push(release),
                Err(err) => {
                    let key = document.key().clone();
                    let error = BuildError::InvalidPolicy(key.clone(), err.to_string());
                    if self.config.fail_fast {
                        return Err(error);
                    }
                    failures.push((key, error));
                }
            }
        }
        graph::verify_acyclic(&self.store, &releases)?;
        info!(releases = releases.len(), "starting build");

        let mut outputs = self.dispatch(releases, &mut failures)?;

        outputs.sort_by(|(a, _), (b, _)| {
            (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name))
        });
        let mut stream = String::new();
        for (_, yaml) in &outputs {
            stream.push_str(yaml);
        }
        for document in self.passthrough_documents() {
            stream.push_str("---\n");
            stream.push_str(document.trim_end());
            stream.push('\n');
        }

        let error = if failures.is_empty() {
            None
        } else {
            failures.sort_by(|(a, _), (b, _)| a.cmp(b));
            Some(BuildError::Aggregate(AggregateError(failures)))
        };
        Ok(BuildOutcome {
            yaml: stream,
            error,
        })
    }

    /// Runs the per-release pipeline on the worker pool and collects results.
    /// On `FailFast` the first failure cancels all in-flight work and is
    /// returned directly; otherwise failures accumulate.
    fn dispatch(
        &self,
        releases: Vec<HelmRelease>,
        failures: &mut Vec<(ResourceKey, BuildError)>,
    ) -> Result<Vec<(ResourceKey, String)>, BuildError> {
        let total = releases.len();
        let (job_sender, job_receiver) = unbounded::<HelmRelease>();
        let (result_sender, result_receiver) =
            unbounded::<(ResourceKey, Result<String, BuildError>)>();
        for release in releases {
            job_sender
                .send(release)
                .expect("job channel should be open");
        }
        drop(job_sender);

        for i in 0..self.config.worker_count(total) {
            let jobs = job_receiver.clone();
            let results = result_sender.clone();
            let cancel = self.cancellation.subscribe();
            let store = self.store.clone();
            let engine = self.engine.clone();
            let builder = self.builder.clone();
            let config = self.config.clone();
            spawn_named_thread(format!("build-worker-{i}"), move || {
                while let Ok(release) = jobs.recv() {
                    let key = release.key().clone();
                    let result =
                        build_release(&store, &engine, &builder, &config, &release, &cancel);
                    if results.send((key, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_sender);

        let deadline = self.config.deadline.map(|d| Instant::now() + d);
        let mut outputs = Vec::new();
        let mut received = 0;
        while received < total {
            let message = match deadline {
                None => result_receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    result_receiver.recv_timeout(remaining)
                }
            };
            let (key, result) = match message {
                Ok(message) => message,
                Err(RecvTimeoutError::Timeout) => {
                    warn!("build deadline exceeded, canceling in-flight work");
                    self.cancellation.cancel();
                    return Err(BuildError::Canceled);
                }
                Err(RecvTimeoutError::Disconnected) => break,
            };
            received += 1;
            match result {
                Ok(yaml) => outputs.push((key, yaml)),
                Err(err) => {
                    if self.config.fail_fast {
                        debug!("canceling in-flight work after failure");
                        self.cancellation.cancel();
                        return Err(err);
                    }
                    failures.push((key, err));
                }
            }
        }
        Ok(outputs)
    }

    /// Documents of unrecognized kinds, emitted unchanged, sorted by key.
    fn passthrough_documents(&self) -> Vec<String> {
        let mut documents: Vec<(&ResourceKey, &str)> = self
            .store
            .documents()
            .filter(|d| !RECOGNIZED_KINDS.contains(&d.key().kind.as_str()))
            .map(|d| (d.key(), d.source()))
            .collect();
        documents.sort_by(|(a, _), (b, _)| a.cmp(b));
        documents
            .into_iter()
            .map(|(_, source)| source.to_string())
            .collect()
    }
}

fn build_release(
    store: &Arc<ResourceStore>,
    engine: &Arc<dyn TemplateEngine>,
    builder: &Arc<ChartBuilder>,
    config: &BuildConfig,
    release: &HelmRelease,
    cancel: &CancellationConsumer,
) -> Result<String, BuildError> {
    if cancel.is_cancelled() {
        return Err(BuildError::Canceled);
    }
    let chart = builder.build(release, Some(cancel))?;
    if cancel.is_cancelled() {
        return Err(BuildError::Canceled);
    }
    let renderer = ReleaseRenderer::new(
        engine.as_ref(),
        store.as_ref(),
        config.kube_version.clone(),
        config.api_versions.clone(),
        config.include_helm_hooks,
    );
    let output = renderer.render(release, &chart)?;
    if cancel.is_cancelled() {
        return Err(BuildError::Canceled);
    }
    kustomize::fuse(store.as_ref(), release, &output)
}
