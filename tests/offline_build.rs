//! End-to-end builds against a mock chart repository: ingestion, chart
//! fetching with de-duplication, rendering through a stub engine and output
//! assembly.

use flate2::Compression;
use flate2::write::GzEncoder;
use httpmock::prelude::*;
use serde::Deserialize;
use serde_yaml::Value;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;

use helmbuild::build::{BuildConfig, BuildOutcome, Orchestrator};
use helmbuild::chart::builder::ChartBuilder;
use helmbuild::error::BuildError;
use helmbuild::ingest::ingest_paths;
use helmbuild::registry::provider::{ProviderError, RegistryToken, TokenExchanger};
use helmbuild::release::helm_repository::Provider;
use helmbuild::render::engine::{EngineError, RenderRequest, RenderedRelease, TemplateEngine};
use helmbuild::resource::store::ResourceStore;

/// Emits one document per release carrying the values the engine was given,
/// so merge precedence is observable in the output.
struct StubEngine;

impl TemplateEngine for StubEngine {
    fn render(&self, request: &RenderRequest) -> Result<RenderedRelease, EngineError> {
        let image_tag = lookup(&request.values, "image.tag")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let tls_cert = lookup(&request.values, "tls.cert")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        Ok(RenderedRelease {
            manifest: format!(
                "kind: ConfigMap\nmetadata:\n  name: {}\ndata:\n  imageTag: \"{}\"\n  tlsCert: \"{}\"\n",
                request.release_name, image_tag, tls_cert
            ),
            hooks: Vec::new(),
        })
    }
}

struct NoExchange;

impl TokenExchanger for NoExchange {
    fn login(
        &self,
        _provider: Provider,
        _registry_host: &str,
    ) -> Result<Option<RegistryToken>, ProviderError> {
        Ok(None)
    }
}

fn lookup<'a>(values: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(values, |cursor, segment| cursor.get(segment))
}

fn pack_chart(archive: &Path) {
    let tar_gz = File::create(archive).unwrap();
    let enc = GzEncoder::new(tar_gz, Compression::default());
    let mut tar = tar::Builder::new(enc);
    for (path, content) in [
        ("podinfo/Chart.yaml", "name: podinfo\nversion: 6.5.0\n"),
        ("podinfo/values.yaml", "replicas: 1\n"),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, path, content.as_bytes())
            .unwrap();
    }
    tar.finish().unwrap();
}

/// Starts a mock chart repository serving one chart at 6.5.0 and returns the
/// server with its mounted index and archive mocks.
fn chart_repository(server: &MockServer) -> (httpmock::Mock<'_>, httpmock::Mock<'_>) {
    let index = "apiVersion: v1\nentries:\n  podinfo:\n    - version: 6.5.0\n      urls:\n        - podinfo-6.5.0.tgz\n".to_string();
    let index_mock = server.mock(|when, then| {
        when.method(GET).path("/index.yaml");
        then.status(200).body(index.clone());
    });

    let archive_dir = tempdir().unwrap().keep();
    let archive = archive_dir.join("podinfo-6.5.0.tgz");
    pack_chart(&archive);
    let archive_mock = server.mock(|when, then| {
        when.method(GET).path("/podinfo-6.5.0.tgz");
        then.status(200).body_from_file(archive.to_string_lossy());
    });

    (index_mock, archive_mock)
}

fn write_inputs(dir: &Path, documents: &[String]) {
    std::fs::write(dir.join("input.yaml"), documents.join("---\n")).unwrap();
}

fn repository_doc(url: &str) -> String {
    format!(
        "apiVersion: source.toolkit.fluxcd.io/v1\nkind: HelmRepository\nmetadata:\n  name: charts\n  namespace: team-a\nspec:\n  url: {url}\n"
    )
}

fn release_doc(name: &str, namespace: &str, extra_spec: &str) -> String {
    format!(
        "apiVersion: helm.toolkit.fluxcd.io/v2\nkind: HelmRelease\nmetadata:\n  name: {name}\n  namespace: team-a\nspec:\n  targetNamespace: {namespace}\n  chart:\n    spec:\n      chart: podinfo\n      version: 6.5.0\n      sourceRef:\n        kind: HelmRepository\n        name: charts\n{extra_spec}"
    )
}

fn build(store: ResourceStore, config: BuildConfig) -> Result<BuildOutcome, BuildError> {
    let store = Arc::new(store);
    let builder = ChartBuilder::new(store.clone(), Arc::new(NoExchange), None).unwrap();
    Orchestrator::new(store, Arc::new(StubEngine), Arc::new(builder), config).run()
}

fn output_documents(yaml: &str) -> Vec<Value> {
    serde_yaml::Deserializer::from_str(yaml)
        .map(|d| Value::deserialize(d).unwrap())
        .collect()
}

#[test]
fn test_single_release_renders_into_target_namespace() {
    let server = MockServer::start();
    let (index_mock, archive_mock) = chart_repository(&server);

    let inputs = tempdir().unwrap();
    write_inputs(
        inputs.path(),
        &[
            repository_doc(&server.base_url()),
            release_doc("app", "team-a", ""),
        ],
    );
    let store = ingest_paths(&[inputs.path().to_path_buf()]).unwrap();

    let outcome = build(store, BuildConfig::default()).unwrap();
    assert!(outcome.error.is_none());
    index_mock.assert_hits(1);
    archive_mock.assert_hits(1);

    let documents = output_documents(&outcome.yaml);
    assert_eq!(documents.len(), 1);
    assert_eq!(
        lookup(&documents[0], "metadata.namespace").unwrap().as_str(),
        Some("team-a")
    );
}

#[test]
fn test_two_releases_share_one_chart_fetch() {
    let server = MockServer::start();
    let (index_mock, archive_mock) = chart_repository(&server);

    let inputs = tempdir().unwrap();
    write_inputs(
        inputs.path(),
        &[
            repository_doc(&server.base_url()),
            release_doc("app-a", "a", ""),
            release_doc("app-b", "b", ""),
        ],
    );
    let store = ingest_paths(&[inputs.path().to_path_buf()]).unwrap();

    let outcome = build(store, BuildConfig::default()).unwrap();
    assert!(outcome.error.is_none());
    // The single-flight caches collapse the concurrent fetches.
    index_mock.assert_hits(1);
    archive_mock.assert_hits(1);

    let documents = output_documents(&outcome.yaml);
    assert_eq!(documents.len(), 2);
    let namespaces: Vec<&str> = documents
        .iter()
        .map(|d| lookup(d, "metadata.namespace").unwrap().as_str().unwrap())
        .collect();
    // Deterministic ordering by (namespace, name).
    assert_eq!(namespaces, vec!["a", "b"]);
}

#[test]
fn test_values_merge_precedence() {
    let server = MockServer::start();
    chart_repository(&server);

    let inputs = tempdir().unwrap();
    write_inputs(
        inputs.path(),
        &[
            repository_doc(&server.base_url()),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: first\n  namespace: team-a\ndata:\n  values.yaml: |\n    image:\n      tag: v1\n".to_string(),
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: second\n  namespace: team-a\ndata:\n  values.yaml: |\n    image:\n      tag: v2\n".to_string(),
            release_doc(
                "app",
                "team-a",
                "  valuesFrom:\n    - kind: ConfigMap\n      name: first\n    - kind: ConfigMap\n      name: second\n  values:\n    image:\n      tag: v3\n",
            ),
        ],
    );
    let store = ingest_paths(&[inputs.path().to_path_buf()]).unwrap();

    let outcome = build(store, BuildConfig::default()).unwrap();
    assert!(outcome.error.is_none());
    let documents = output_documents(&outcome.yaml);
    assert_eq!(
        lookup(&documents[0], "data.imageTag").unwrap().as_str(),
        Some("v3")
    );
}

#[test]
fn test_secret_target_path_with_quote_stripping() {
    let server = MockServer::start();
    chart_repository(&server);

    let inputs = tempdir().unwrap();
    write_inputs(
        inputs.path(),
        &[
            repository_doc(&server.base_url()),
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: tls\n  namespace: team-a\nstringData:\n  secret.pem: '\"PEM-CONTENT\"'\n".to_string(),
            release_doc(
                "app",
                "team-a",
                "  valuesFrom:\n    - kind: Secret\n      name: tls\n      valuesKey: secret.pem\n      targetPath: tls.cert\n",
            ),
        ],
    );
    let store = ingest_paths(&[inputs.path().to_path_buf()]).unwrap();

    let outcome = build(store, BuildConfig::default()).unwrap();
    assert!(outcome.error.is_none());
    let documents = output_documents(&outcome.yaml);
    assert_eq!(
        lookup(&documents[0], "data.tlsCert").unwrap().as_str(),
        Some("PEM-CONTENT")
    );
}

#[test]
fn test_aggregated_failure_keeps_other_releases() {
    let server = MockServer::start();
    chart_repository(&server);

    let broken = "apiVersion: helm.toolkit.fluxcd.io/v2\nkind: HelmRelease\nmetadata:\n  name: broken\n  namespace: team-a\nspec:\n  chart:\n    spec:\n      chart: podinfo\n      sourceRef:\n        kind: HelmRepository\n        name: missing\n".to_string();

    let inputs = tempdir().unwrap();
    write_inputs(
        inputs.path(),
        &[
            repository_doc(&server.base_url()),
            release_doc("app", "team-a", ""),
            broken,
        ],
    );
    let store = ingest_paths(&[inputs.path().to_path_buf()]).unwrap();

    let outcome = build(store, BuildConfig::default()).unwrap();

    // The healthy release is present.
    let documents = output_documents(&outcome.yaml);
    assert_eq!(documents.len(), 1);
    assert_eq!(
        lookup(&documents[0], "metadata.name").unwrap().as_str(),
        Some("app")
    );
    // The aggregate names the failed release.
    let error = outcome.error.unwrap();
    assert!(matches!(error, BuildError::Aggregate(_)));
    assert!(error.to_string().contains("broken"));
}

#[test]
fn test_deadline_cancels_the_build() {
    struct SlowEngine;
    impl TemplateEngine for SlowEngine {
        fn render(&self, _request: &RenderRequest) -> Result<RenderedRelease, EngineError> {
            std::thread::sleep(std::time::Duration::from_secs(2));
            Ok(RenderedRelease::default())
        }
    }

    let server = MockServer::start();
    chart_repository(&server);

    let inputs = tempdir().unwrap();
    write_inputs(
        inputs.path(),
        &[
            repository_doc(&server.base_url()),
            release_doc("app", "team-a", ""),
        ],
    );
    let store = Arc::new(ingest_paths(&[inputs.path().to_path_buf()]).unwrap());
    let builder = ChartBuilder::new(store.clone(), Arc::new(NoExchange), None).unwrap();
    let config = BuildConfig {
        deadline: Some(std::time::Duration::from_millis(200)),
        ..Default::default()
    };
    let result = Orchestrator::new(store, Arc::new(SlowEngine), Arc::new(builder), config).run();
    assert!(matches!(result, Err(BuildError::Canceled)));
}

#[test]
fn test_rebuild_with_fresh_cache_is_idempotent() {
    let server = MockServer::start();
    chart_repository(&server);

    let inputs = tempdir().unwrap();
    write_inputs(
        inputs.path(),
        &[
            repository_doc(&server.base_url()),
            release_doc("app-a", "a", ""),
            release_doc("app-b", "b", ""),
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: passthrough\n".to_string(),
        ],
    );

    let first_store = ingest_paths(&[inputs.path().to_path_buf()]).unwrap();
    let second_store = ingest_paths(&[inputs.path().to_path_buf()]).unwrap();
    assert_eq!(first_store, second_store);

    let first = build(first_store, BuildConfig::default()).unwrap();
    let second = build(second_store, BuildConfig::default()).unwrap();
    assert_eq!(first.yaml, second.yaml);
    assert!(first.yaml.contains("name: passthrough"));
}
