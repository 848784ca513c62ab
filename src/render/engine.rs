//! The templating seam: a dry-run, client-only install of a chart against a
//! synthetic context. The production implementation drives the `helm`
//! executable; tests substitute the trait.

use serde_yaml::Value;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

const HOOK_ANNOTATION: &str = "helm.sh/hook";
const PROCESS_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("starting templating process: {0}")]
    Io(#[from] std::io::Error),
    #[error("templating failed: {0}")]
    Template(String),
    #[error("templating timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything the engine needs for one synthetic install.
#[derive(Debug, Clone, Default)]
pub struct RenderRequest {
    pub release_name: String,
    pub namespace: String,
    pub chart_dir: PathBuf,
    pub values: Value,
    pub kube_version: Option<String>,
    pub api_versions: Vec<String>,
    pub include_crds: bool,
    pub disable_hooks: bool,
    pub disable_openapi_validation: bool,
    pub timeout: Option<Duration>,
}

/// Rendered manifests, with hook documents split out of the main stream in
/// their declared order.
#[derive(Debug, Clone, Default)]
pub struct RenderedRelease {
    pub manifest: String,
    pub hooks: Vec<String>,
}

pub trait TemplateEngine: Send + Sync {
    fn render(&self, request: &RenderRequest) -> Result<RenderedRelease, EngineError>;
}

/// Drives `helm template`, the client-only dry-run equivalent of an install.
pub struct HelmTemplateEngine {
    binary: PathBuf,
}

impl Default for HelmTemplateEngine {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("helm"),
        }
    }
}

impl HelmTemplateEngine {
    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn command(&self, request: &RenderRequest, values_file: &std::path::Path) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("template")
            .arg(&request.release_name)
            .arg(&request.chart_dir)
            .arg("--namespace")
            .arg(&request.namespace)
            .arg("--values")
            .arg(values_file)
            // Pre-release chart versions are allowed and templates may
            // resolve names through DNS, matching a real install context.
            .arg("--devel")
            .arg("--enable-dns");
        if let Some(kube_version) = &request.kube_version {
            command.arg("--kube-version").arg(kube_version);
        }
        if !request.api_versions.is_empty() {
            command
                .arg("--api-versions")
                .arg(request.api_versions.join(","));
        }
        if request.include_crds {
            command.arg("--include-crds");
        }
        if request.disable_hooks {
            command.arg("--no-hooks");
        }
        if request.disable_openapi_validation {
            command.arg("--disable-openapi-validation");
        }
        command
    }
}

impl TemplateEngine for HelmTemplateEngine {
    fn render(&self, request: &RenderRequest) -> Result<RenderedRelease, EngineError> {
        let mut values_file = tempfile::NamedTempFile::new()?;
        let values = serde_yaml::to_string(&request.values)
            .map_err(|err| EngineError::Template(format!("encoding values: {err}")))?;
        values_file.write_all(values.as_bytes())?;

        let mut command = self.command(request, values_file.path());
        debug!(release = request.release_name, "running helm template");
        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let output = match request.timeout {
            None => child.wait_with_output()?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if child.try_wait()?.is_some() {
                        break child.wait_with_output()?;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        return Err(EngineError::Timeout(timeout));
                    }
                    std::thread::sleep(PROCESS_POLL_INTERVAL);
                }
            }
        };

        if !output.status.success() {
            return Err(EngineError::Template(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        Ok(split_hooks(&stdout))
    }
}

/// Splits a rendered multi-document stream into the main manifest and hook
/// documents (those annotated with `helm.sh/hook`), preserving order.
pub fn split_hooks(stream: &str) -> RenderedRelease {
    let mut manifest_docs = Vec::new();
    let mut hooks = Vec::new();
    for chunk in split_stream(stream) {
        match serde_yaml::from_str::<Value>(&chunk) {
            Ok(value) if is_hook(&value) => hooks.push(chunk),
            _ => manifest_docs.push(chunk),
        }
    }
    RenderedRelease {
        manifest: manifest_docs.join("---\n"),
        hooks,
    }
}

fn is_hook(value: &Value) -> bool {
    value
        .get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(HOOK_ANNOTATION))
        .is_some()
}

fn split_stream(stream: &str) -> Vec<String> {
    let mut documents = Vec::new();
    let mut current = String::new();
    for line in stream.lines() {
        if line.trim_end() == "---" {
            if !current.trim().is_empty() {
                documents.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        documents.push(current);
    }
    documents
}

#[cfg(test)]
mod tests {
    use super::*;

    const STREAM: &str = r#"---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: app
---
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  annotations:
    helm.sh/hook: pre-install
---
apiVersion: v1
kind: Service
metadata:
  name: app
---
apiVersion: batch/v1
kind: Job
metadata:
  name: cleanup
  annotations:
    helm.sh/hook: post-delete
"#;

    #[test]
    fn test_split_hooks() {
        let rendered = split_hooks(STREAM);
        assert_eq!(rendered.hooks.len(), 2);
        assert!(rendered.hooks[0].contains("migrate"));
        assert!(rendered.hooks[1].contains("cleanup"));
        assert!(rendered.manifest.contains("kind: Deployment"));
        assert!(rendered.manifest.contains("kind: Service"));
        assert!(!rendered.manifest.contains("helm.sh/hook"));
    }

    #[test]
    fn test_split_hooks_without_hooks_keeps_stream() {
        let rendered = split_hooks("kind: ConfigMap\nmetadata:\n  name: a\n");
        assert!(rendered.hooks.is_empty());
        assert!(rendered.manifest.contains("kind: ConfigMap"));
    }

    #[test]
    fn test_command_arguments() {
        let engine = HelmTemplateEngine::default();
        let request = RenderRequest {
            release_name: "app".to_string(),
            namespace: "team-a".to_string(),
            chart_dir: PathBuf::from("/tmp/podinfo"),
            kube_version: Some("1.31.0".to_string()),
            api_versions: vec!["monitoring.coreos.com/v1".to_string()],
            include_crds: true,
            disable_hooks: true,
            disable_openapi_validation: true,
            ..Default::default()
        };

        let command = engine.command(&request, std::path::Path::new("/tmp/values.yaml"));
        let args: Vec<String> = command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(args.contains(&"template".to_string()));
        assert!(args.contains(&"--devel".to_string()));
        assert!(args.contains(&"--kube-version".to_string()));
        assert!(args.contains(&"--include-crds".to_string()));
        assert!(args.contains(&"--no-hooks".to_string()));
        assert!(args.contains(&"--disable-openapi-validation".to_string()));
    }
}
