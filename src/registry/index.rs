//! Index-based chart repository: a static HTTP server publishing an
//! `index.yaml` catalog and chart tarballs.

use reqwest::blocking::{Client, RequestBuilder};
use semver::{Version, VersionReq};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::auth::RepositoryCredentials;
use super::{ChartArtifact, ChartSource, SourceError};

const INDEX_FILE: &str = "index.yaml";

#[derive(Debug, Deserialize, Default)]
struct RepositoryIndex {
    #[serde(default)]
    entries: HashMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct IndexEntry {
    version: String,
    urls: Vec<String>,
    digest: Option<String>,
}

/// Handle over one HTTP repository. The index is downloaded and parsed once
/// at construction; the handle itself is cached by URL, so concurrent
/// releases sharing a repository trigger a single index fetch.
#[derive(Debug)]
pub struct IndexSource {
    base: Url,
    client: Client,
    credentials: RepositoryCredentials,
    index: RepositoryIndex,
    download_dir: PathBuf,
}

impl IndexSource {
    pub fn fetch(
        url: &str,
        credentials: RepositoryCredentials,
        timeout: Duration,
        download_dir: PathBuf,
    ) -> Result<Self, SourceError> {
        let base = Url::parse(&format!("{}/", url.trim_end_matches('/'))).map_err(|err| {
            SourceError::Transport {
                url: url.to_string(),
                err: err.to_string(),
            }
        })?;
        let client = build_client(&credentials, timeout)?;

        let index_url = base
            .join(INDEX_FILE)
            .map_err(|err| SourceError::Transport {
                url: url.to_string(),
                err: err.to_string(),
            })?;
        debug!(url = %index_url, "downloading repository index");
        let body = send(with_basic_auth(client.get(index_url.clone()), &credentials), &index_url)?
            .text()
            .map_err(|err| SourceError::Transport {
                url: index_url.to_string(),
                err: err.to_string(),
            })?;
        let index: RepositoryIndex =
            serde_yaml::from_str(&body).map_err(|err| SourceError::Index {
                url: index_url.to_string(),
                err: err.to_string(),
            })?;

        std::fs::create_dir_all(&download_dir)?;
        Ok(Self {
            base,
            client,
            credentials,
            index,
            download_dir,
        })
    }

    /// Picks the entry matching `requirement`: an exact version when it parses
    /// as one and is published, otherwise the highest version satisfying the
    /// semver range. Entries with unparsable versions are skipped.
    fn select(&self, chart: &str, requirement: &str) -> Result<&IndexEntry, SourceError> {
        let entries = self
            .index
            .entries
            .get(chart)
            .filter(|e| !e.is_empty())
            .ok_or_else(|| SourceError::NotFound(chart.to_string()))?;

        if let Ok(exact) = Version::parse(requirement) {
            return entries
                .iter()
                .find(|e| Version::parse(&e.version).is_ok_and(|v| v == exact))
                .ok_or_else(|| SourceError::NoMatchingVersion {
                    chart: chart.to_string(),
                    requirement: requirement.to_string(),
                });
        }

        let range = VersionReq::parse(requirement).map_err(|err| {
            SourceError::Requirement(requirement.to_string(), err.to_string())
        })?;
        entries
            .iter()
            .filter_map(|e| Version::parse(&e.version).ok().map(|v| (v, e)))
            .filter(|(v, _)| range.matches(v))
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, e)| e)
            .ok_or_else(|| SourceError::NoMatchingVersion {
                chart: chart.to_string(),
                requirement: requirement.to_string(),
            })
    }
}

impl ChartSource for IndexSource {
    fn resolve(&self, chart: &str, version: &str) -> Result<ChartArtifact, SourceError> {
        let entry = self.select(chart, version)?;
        let location = entry
            .urls
            .first()
            .ok_or_else(|| SourceError::NotFound(chart.to_string()))?;
        let chart_url = self
            .base
            .join(location)
            .map_err(|err| SourceError::Transport {
                url: location.clone(),
                err: err.to_string(),
            })?;

        // Credentials are forwarded to a download host other than the index
        // host only when the repository opts in.
        let same_host = chart_url.host_str() == self.base.host_str();
        let mut request = self.client.get(chart_url.clone());
        if same_host || self.credentials.pass_credentials {
            request = with_basic_auth(request, &self.credentials);
        }

        debug!(url = %chart_url, "downloading chart archive");
        let mut response = send(request, &chart_url)?;
        let archive = self
            .download_dir
            .join(format!("{}-{}.tgz", chart, entry.version));
        let mut file = File::create(&archive)?;
        response
            .copy_to(&mut file)
            .map_err(|err| SourceError::Transport {
                url: chart_url.to_string(),
                err: err.to_string(),
            })?;

        Ok(ChartArtifact {
            archive,
            name: chart.to_string(),
            version: entry.version.clone(),
            digest: entry.digest.clone(),
        })
    }
}

fn build_client(
    credentials: &RepositoryCredentials,
    timeout: Duration,
) -> Result<Client, SourceError> {
    let mut builder = Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .connect_timeout(timeout);

    if let Some(tls) = &credentials.tls {
        if let Some(ca) = &tls.ca_bundle {
            let cert = reqwest::Certificate::from_pem(ca).map_err(|err| {
                SourceError::Transport {
                    url: String::new(),
                    err: format!("invalid CA bundle: {err}"),
                }
            })?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert), Some(key)) = (&tls.client_cert, &tls.client_key) {
            let mut pem = cert.clone();
            pem.extend_from_slice(key);
            let identity = reqwest::Identity::from_pem(&pem).map_err(|err| {
                SourceError::Transport {
                    url: String::new(),
                    err: format!("invalid client certificate: {err}"),
                }
            })?;
            builder = builder.identity(identity);
        }
    }

    builder.build().map_err(|err| SourceError::Transport {
        url: String::new(),
        err: err.to_string(),
    })
}

fn with_basic_auth(
    request: RequestBuilder,
    credentials: &RepositoryCredentials,
) -> RequestBuilder {
    match (&credentials.username, &credentials.password) {
        (Some(user), Some(pass)) => request.basic_auth(user, Some(pass)),
        _ => request,
    }
}

fn send(
    request: RequestBuilder,
    url: &Url,
) -> Result<reqwest::blocking::Response, SourceError> {
    let response = request.send().map_err(|err| SourceError::Transport {
        url: url.to_string(),
        err: err.to_string(),
    })?;
    if !response.status().is_success() {
        return Err(SourceError::Transport {
            url: url.to_string(),
            err: format!("unsuccessful response: {}", response.status()),
        });
    }
    Ok(response)
}
