//! OCI registry chart source: charts published as OCI artifacts whose content
//! layer carries the packaged chart tarball.

use oci_client::client::{Certificate, CertificateEncoding, ClientConfig};
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference};
use semver::Version;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::debug;

use super::auth::TlsData;
use super::{ChartArtifact, ChartSource, SourceError};
use crate::utils::retry::retry;

pub const OCI_SCHEME_PREFIX: &str = "oci://";

const HELM_CHART_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";
const LEGACY_TAR_MEDIA_TYPE: &str = "application/tar+gzip";

const TAG_PAGE_SIZE: usize = 1000;
const PULL_ATTEMPTS: usize = 3;
const PULL_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Handle over one OCI registry repository. The chart name is joined onto the
/// repository path, so `oci://ghcr.io/org/charts` + `podinfo` resolves images
/// under `ghcr.io/org/charts/podinfo`.
pub struct OciSource {
    client: Client,
    auth: RegistryAuth,
    runtime: Arc<Runtime>,
    repository: String,
    download_dir: PathBuf,
}

impl OciSource {
    pub fn new(
        url: &str,
        auth: RegistryAuth,
        tls: Option<&TlsData>,
        timeout: Duration,
        runtime: Arc<Runtime>,
        download_dir: PathBuf,
    ) -> Result<Self, SourceError> {
        let repository = url
            .strip_prefix(OCI_SCHEME_PREFIX)
            .unwrap_or(url)
            .trim_end_matches('/')
            .to_string();

        let mut config = ClientConfig {
            read_timeout: Some(timeout),
            connect_timeout: Some(timeout),
            ..ClientConfig::default()
        };
        if let Some(ca) = tls.and_then(|t| t.ca_bundle.as_ref()) {
            config.extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data: ca.clone(),
            });
        }

        std::fs::create_dir_all(&download_dir)?;
        Ok(Self {
            client: Client::new(config),
            auth,
            runtime,
            repository,
            download_dir,
        })
    }

    fn reference(&self, chart: &str, tag: &str) -> Result<Reference, SourceError> {
        format!("{}/{}:{}", self.repository, chart, tag)
            .parse::<Reference>()
            .map_err(|err| SourceError::Transport {
                url: format!("{}/{}", self.repository, chart),
                err: err.to_string(),
            })
    }

    /// An exact version is used as the tag directly; a range is resolved
    /// against the registry's published tags, highest match wins.
    fn resolve_tag(&self, chart: &str, requirement: &str) -> Result<String, SourceError> {
        if Version::parse(requirement).is_ok() {
            return Ok(requirement.to_string());
        }
        let range = semver::VersionReq::parse(requirement).map_err(|err| {
            SourceError::Requirement(requirement.to_string(), err.to_string())
        })?;

        let reference = self.reference(chart, "latest")?;
        let response = self
            .runtime
            .block_on(self.client.list_tags(
                &reference,
                &self.auth,
                Some(TAG_PAGE_SIZE),
                None,
            ))
            .map_err(|err| SourceError::Transport {
                url: reference.to_string(),
                err: err.to_string(),
            })?;

        response
            .tags
            .iter()
            .filter_map(|tag| Version::parse(tag).ok())
            .filter(|v| range.matches(v))
            .max()
            .map(|v| v.to_string())
            .ok_or_else(|| SourceError::NoMatchingVersion {
                chart: chart.to_string(),
                requirement: requirement.to_string(),
            })
    }

    async fn pull_chart_layer(
        &self,
        reference: &Reference,
        archive: &std::path::Path,
    ) -> Result<String, SourceError> {
        let (manifest, _) = self
            .client
            .pull_image_manifest(reference, &self.auth)
            .await
            .map_err(|err| SourceError::Transport {
                url: reference.to_string(),
                err: err.to_string(),
            })?;

        let layer = manifest
            .layers
            .iter()
            .find(|l| {
                l.media_type == HELM_CHART_CONTENT_MEDIA_TYPE
                    || l.media_type == LEGACY_TAR_MEDIA_TYPE
            })
            .ok_or_else(|| SourceError::Transport {
                url: reference.to_string(),
                err: "manifest has no chart content layer".to_string(),
            })?;

        let mut file = tokio::fs::File::create(archive).await.map_err(SourceError::Io)?;
        self.client
            .pull_blob(reference, layer, &mut file)
            .await
            .map_err(|err| SourceError::Transport {
                url: reference.to_string(),
                err: err.to_string(),
            })?;

        Ok(layer.digest.clone())
    }
}

impl ChartSource for OciSource {
    fn resolve(&self, chart: &str, version: &str) -> Result<ChartArtifact, SourceError> {
        let tag = self.resolve_tag(chart, version)?;
        let reference = self.reference(chart, &tag)?;
        debug!(%reference, "pulling chart from OCI registry");

        // A failed attempt truncates the file on the next one, so retrying
        // never publishes a partial archive.
        let archive = self.download_dir.join(format!("{chart}-{tag}.tgz"));
        let digest = retry(PULL_ATTEMPTS, PULL_RETRY_INTERVAL, || {
            self.runtime
                .block_on(self.pull_chart_layer(&reference, &archive))
                .inspect_err(|err| debug!("pull of '{reference}' failed: {err}"))
        })?;

        Ok(ChartArtifact {
            archive,
            name: chart.to_string(),
            version: tag,
            digest: Some(digest),
        })
    }
}
