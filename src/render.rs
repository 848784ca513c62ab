//! Release rendering: values composition, the synthetic dry-run install,
//! post-rendering and materialization of the result.

pub mod engine;
pub mod kustomize;
pub mod postrender;
pub mod values;

use std::path::PathBuf;
use tracing::{debug, instrument};

use crate::chart::ChartBuild;
use crate::error::BuildError;
use crate::release::HelmRelease;
use crate::render::engine::{RenderRequest, TemplateEngine};
use crate::render::postrender::{NamespaceTransformer, PostRenderer, run_pipeline};
use crate::resource::store::ResourceStore;

const DEFAULT_NAMESPACE: &str = "default";
const MANIFEST_FILE: &str = "manifest.yaml";

/// The materialized output of one rendered release: a fresh directory with
/// the main manifest and, when requested, the hook manifests in declared
/// order.
#[derive(Debug, Clone)]
pub struct RenderedOutput {
    pub dir: PathBuf,
    pub manifest_path: PathBuf,
    pub hook_paths: Vec<PathBuf>,
}

impl RenderedOutput {
    /// The output files in emission order.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.manifest_path.clone()];
        files.extend(self.hook_paths.iter().cloned());
        files
    }
}

pub struct ReleaseRenderer<'a> {
    engine: &'a dyn TemplateEngine,
    store: &'a ResourceStore,
    kube_version: Option<String>,
    api_versions: Vec<String>,
    include_hooks: bool,
}

impl<'a> ReleaseRenderer<'a> {
    pub fn new(
        engine: &'a dyn TemplateEngine,
        store: &'a ResourceStore,
        kube_version: Option<String>,
        api_versions: Vec<String>,
        include_hooks: bool,
    ) -> Self {
        Self {
            engine,
            store,
            kube_version,
            api_versions,
            include_hooks,
        }
    }

    /// Runs the dry-run install for a resolved chart build and materializes
    /// the post-rendered manifests.
    #[instrument(skip_all, fields(release = %release.key()))]
    pub fn render(
        &self,
        release: &HelmRelease,
        chart: &ChartBuild,
    ) -> Result<RenderedOutput, BuildError> {
        let values = values::compose(self.store, release)?;

        let policy = release.spec.install.clone().unwrap_or_default();
        let crd_policy = policy
            .crd_policy()
            .map_err(|err| BuildError::InvalidPolicy(release.key().clone(), err.to_string()))?;

        let namespace = match release.target_namespace() {
            "" => DEFAULT_NAMESPACE,
            ns => ns,
        };
        let mut api_versions = self.api_versions.clone();
        api_versions.extend(release.spec.api_versions.iter().cloned());

        let request = RenderRequest {
            release_name: release.release_name().to_string(),
            namespace: namespace.to_string(),
            chart_dir: chart.chart_dir.clone(),
            values,
            kube_version: release
                .spec
                .kube_version
                .clone()
                .or_else(|| self.kube_version.clone()),
            api_versions,
            include_crds: crd_policy.include_crds(),
            disable_hooks: policy.disable_hooks,
            disable_openapi_validation: policy.disable_openapi_validation,
            timeout: release.timeout(),
        };
        let rendered = self
            .engine
            .render(&request)
            .map_err(|err| BuildError::RenderFailure(release.key().clone(), err.to_string()))?;
        debug!(hooks = rendered.hooks.len(), "templating finished");

        // The namespace transformer is the mandatory post-render stage and
        // runs first; it covers hooks as well as the main manifest.
        let transformer = NamespaceTransformer::new(namespace);
        let stages: Vec<&dyn PostRenderer> = vec![&transformer];
        let post_render = |buffer: String| {
            run_pipeline(&stages, buffer.into_bytes())
                .map_err(|err| BuildError::RenderFailure(release.key().clone(), err.to_string()))
        };

        let manifest = post_render(rendered.manifest)?;
        let hooks = rendered
            .hooks
            .into_iter()
            .map(post_render)
            .collect::<Result<Vec<_>, _>>()?;

        self.materialize(release, manifest, hooks)
    }

    fn materialize(
        &self,
        release: &HelmRelease,
        manifest: Vec<u8>,
        hooks: Vec<Vec<u8>>,
    ) -> Result<RenderedOutput, BuildError> {
        let io_failure =
            |err: std::io::Error| BuildError::RenderFailure(release.key().clone(), err.to_string());

        let dir = tempfile::Builder::new()
            .prefix("helmbuild-render-")
            .tempdir()
            .map_err(io_failure)?
            .keep();
        let manifest_path = dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, manifest).map_err(io_failure)?;

        let mut hook_paths = Vec::new();
        if self.include_hooks {
            for (i, hook) in hooks.into_iter().enumerate() {
                let path = dir.join(format!("hook_{i}.yaml"));
                std::fs::write(&path, hook).map_err(io_failure)?;
                hook_paths.push(path);
            }
        }

        Ok(RenderedOutput {
            dir,
            manifest_path,
            hook_paths,
        })
    }
}
