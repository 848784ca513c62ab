//! Chart acquisition: resolves a release's chart reference to an extracted
//! chart directory, de-duplicating repository handles and chart fetches
//! through the single-flight caches.

use oci_client::secrets::RegistryAuth;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, instrument};

use super::extract::extract_chart;
use super::{ChartBuild, ChartKey};
use crate::cache::{CacheError, CacheFailure, Fetched, SyncCache};
use crate::error::BuildError;
use crate::event::cancellation::CancellationConsumer;
use crate::registry::auth::resolve_credentials;
use crate::registry::index::IndexSource;
use crate::registry::oci::OciSource;
use crate::registry::provider::TokenExchanger;
use crate::registry::{ChartSource, normalize_url};
use crate::release::helm_repository::RepositoryType;
use crate::release::{HELM_REPOSITORY_KIND, HelmRelease, HelmRepository};
use crate::resource::document::Document;
use crate::resource::key::ResourceKey;
use crate::resource::store::ResourceStore;

pub struct ChartBuilder {
    store: Arc<ResourceStore>,
    exchanger: Arc<dyn TokenExchanger>,
    runtime: Arc<Runtime>,
    repositories: SyncCache<String, Arc<dyn ChartSource>>,
    artifacts: SyncCache<ChartKey, ChartBuild>,
    workdir: PathBuf,
}

impl ChartBuilder {
    pub fn new(
        store: Arc<ResourceStore>,
        exchanger: Arc<dyn TokenExchanger>,
        cache_dir: Option<PathBuf>,
    ) -> std::io::Result<Self> {
        let workdir = match cache_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir)?;
                dir
            }
            None => tempfile::Builder::new().prefix("helmbuild-").tempdir()?.keep(),
        };
        let runtime = Arc::new(
            tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()?,
        );
        Ok(Self {
            store,
            exchanger,
            runtime,
            repositories: SyncCache::new(),
            artifacts: SyncCache::new(),
            workdir,
        })
    }

    /// Obtains the extracted chart for a release, fetching it at most once per
    /// `(url, chart, version)` across all concurrent callers.
    ///
    /// When a cancellation consumer is given, producers check it before going
    /// to the network; a canceled producer releases its lock so that every
    /// waiter observes `Canceled` instead of blocking.
    #[instrument(skip_all, fields(release = %release.key()))]
    pub fn build(
        &self,
        release: &HelmRelease,
        cancel: Option<&CancellationConsumer>,
    ) -> Result<ChartBuild, BuildError> {
        let source_key = release.source_key();
        if source_key.kind != HELM_REPOSITORY_KIND {
            return Err(BuildError::UnresolvedReference {
                referrer: release.key().clone(),
                reference: source_key,
            });
        }
        let repository_doc =
            self.store
                .get(&source_key)
                .ok_or_else(|| BuildError::UnresolvedReference {
                    referrer: release.key().clone(),
                    reference: source_key.clone(),
                })?;
        let repository = HelmRepository::from_document(repository_doc)
            .map_err(|err| BuildError::InvalidPolicy(source_key.clone(), err.to_string()))?;

        let url = normalize_url(&repository.spec.url);
        let handle = self.repository_handle(&repository, &url, cancel)?;

        let key = ChartKey {
            repository_url: url,
            name: release.spec.chart.spec.chart.clone(),
            version: release.version_requirement().to_string(),
        };
        let mut build = self.chart_build(&key, handle.as_ref(), &source_key, cancel)?;

        // A values-files subset renders differently from the pristine chart,
        // so the variant is marked in the version's build metadata.
        if !release.spec.chart.spec.values_files.is_empty() && !build.version.contains('+') {
            build.version = format!("{}+gen.{}", build.version, release.generation());
        }
        Ok(build)
    }

    fn repository_handle(
        &self,
        repository: &HelmRepository,
        url: &str,
        cancel: Option<&CancellationConsumer>,
    ) -> Result<Arc<dyn ChartSource>, BuildError> {
        match self.repositories.get_or_lock(&url.to_string()) {
            Ok(Fetched::Hit(handle)) => Ok(handle),
            Ok(Fetched::MustProduce) => {
                if is_cancelled(cancel) {
                    self.repositories
                        .unlock_fail(url.to_string(), CacheFailure::Canceled);
                    return Err(BuildError::Canceled);
                }
                match self.connect(repository, url) {
                    Ok(handle) => {
                        self.repositories.set_unlock(url.to_string(), handle.clone());
                        Ok(handle)
                    }
                    Err(err) => {
                        self.repositories
                            .unlock_fail(url.to_string(), CacheFailure::Failed(err.to_string()));
                        Err(err)
                    }
                }
            }
            Err(err) => Err(cache_error(err, repository.key())),
        }
    }

    fn chart_build(
        &self,
        key: &ChartKey,
        handle: &dyn ChartSource,
        source_key: &ResourceKey,
        cancel: Option<&CancellationConsumer>,
    ) -> Result<ChartBuild, BuildError> {
        match self.artifacts.get_or_lock(key) {
            Ok(Fetched::Hit(build)) => {
                debug!(chart = key.name, version = key.version, "chart cache hit");
                Ok(build)
            }
            Ok(Fetched::MustProduce) => {
                if is_cancelled(cancel) {
                    self.artifacts
                        .unlock_fail(key.clone(), CacheFailure::Canceled);
                    return Err(BuildError::Canceled);
                }
                match self.fetch_and_extract(key, handle) {
                    Ok(build) => {
                        self.artifacts.set_unlock(key.clone(), build.clone());
                        Ok(build)
                    }
                    Err(err) => {
                        let failure = CacheFailure::Failed(err.to_string());
                        self.artifacts.unlock_fail(key.clone(), failure);
                        Err(BuildError::ChartUnavailable(source_key.clone(), err.to_string()))
                    }
                }
            }
            Err(err) => Err(cache_error(err, source_key)),
        }
    }

    fn fetch_and_extract(
        &self,
        key: &ChartKey,
        handle: &dyn ChartSource,
    ) -> Result<ChartBuild, Box<dyn std::error::Error>> {
        let artifact = handle.resolve(&key.name, &key.version)?;
        let dest = self
            .workdir
            .join("charts")
            .join(format!("{}-{}", artifact.name, artifact.version));
        let chart_dir = extract_chart(&artifact.archive, &dest, &artifact.name)?;
        Ok(ChartBuild {
            chart_dir,
            name: artifact.name,
            version: artifact.version,
        })
    }

    fn connect(
        &self,
        repository: &HelmRepository,
        url: &str,
    ) -> Result<Arc<dyn ChartSource>, BuildError> {
        let secret = self.referenced_secret(repository, repository.secret_key())?;
        let cert_secret = self.referenced_secret(repository, repository.cert_secret_key())?;
        let credentials = resolve_credentials(repository, secret, cert_secret)
            .map_err(|err| BuildError::AuthFailure(repository.key().clone(), err.to_string()))?;
        let downloads = self.workdir.join("downloads");

        match repository.spec.repository_type {
            RepositoryType::Default => {
                let source =
                    IndexSource::fetch(url, credentials, repository.timeout(), downloads)
                        .map_err(|err| {
                            BuildError::ChartUnavailable(
                                repository.key().clone(),
                                err.to_string(),
                            )
                        })?;
                Ok(Arc::new(source))
            }
            RepositoryType::Oci => {
                let auth = self.registry_auth(repository, &credentials, url)?;
                let source = OciSource::new(
                    url,
                    auth,
                    credentials.tls.as_ref(),
                    repository.timeout(),
                    self.runtime.clone(),
                    downloads,
                )
                .map_err(|err| {
                    BuildError::ChartUnavailable(repository.key().clone(), err.to_string())
                })?;
                Ok(Arc::new(source))
            }
        }
    }

    fn referenced_secret(
        &self,
        repository: &HelmRepository,
        key: Option<ResourceKey>,
    ) -> Result<Option<&Document>, BuildError> {
        let Some(key) = key else { return Ok(None) };
        self.store
            .get(&key)
            .map(Some)
            .ok_or_else(|| BuildError::UnresolvedReference {
                referrer: repository.key().clone(),
                reference: key,
            })
    }

    /// Provider exchange applies only to OCI repositories with a non-generic
    /// provider and no configured secret.
    fn registry_auth(
        &self,
        repository: &HelmRepository,
        credentials: &crate::registry::auth::RepositoryCredentials,
        url: &str,
    ) -> Result<RegistryAuth, BuildError> {
        if credentials.has_basic() {
            return Ok(credentials.registry_auth());
        }
        if repository.spec.secret_ref.is_some() {
            return Ok(RegistryAuth::Anonymous);
        }
        let host = registry_host(url);
        let token = self
            .exchanger
            .login(repository.spec.provider, &host)
            .map_err(|err| BuildError::AuthFailure(repository.key().clone(), err.to_string()))?;
        Ok(match token {
            Some(token) => RegistryAuth::Basic(token.username, token.token),
            None => RegistryAuth::Anonymous,
        })
    }
}

fn is_cancelled(cancel: Option<&CancellationConsumer>) -> bool {
    cancel.is_some_and(CancellationConsumer::is_cancelled)
}

fn registry_host(url: &str) -> String {
    let without_scheme = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

fn cache_error(err: CacheError, key: &ResourceKey) -> BuildError {
    match err {
        CacheError::Producer(CacheFailure::Canceled) => BuildError::Canceled,
        other => BuildError::ChartUnavailable(key.clone(), other.to_string()),
    }
}
