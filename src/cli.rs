use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::build::BuildConfig;
use crate::logging::{LogLevel, LoggingConfig};

// helper needed because the arguments from the duration_str's parse function and the one expected
// by the clap `value_parser` argument have incompatible lifetimes.
fn parse_duration_arg(arg: &str) -> Result<Duration, String> {
    duration_str::parse(arg)
}

/// Renders HelmRelease declarations into a fully materialized YAML stream
/// without contacting a cluster.
#[derive(Debug, Clone, Parser)]
#[command(name = "helmbuild", version)]
pub struct Cli {
    /// Directories or files containing the YAML declarations to build
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Abort on the first error instead of aggregating all failures
    #[arg(long)]
    pub fail_fast: bool,

    /// Additional API version made available to chart templates
    ///
    /// **Format**: group/version, e.g. monitoring.coreos.com/v1. May be
    /// repeated.
    #[arg(long = "api-versions", value_name = "GROUP/VERSION")]
    pub api_versions: Vec<String>,

    /// Kubernetes version reported to chart templates
    #[arg(long)]
    pub kube_version: Option<String>,

    /// Keep Helm hook manifests in the output
    #[arg(long)]
    pub include_helm_hooks: bool,

    /// Upper bound on concurrently built releases
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Directory for downloaded and extracted chart artifacts
    ///
    /// A temporary directory is used when unset.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Write the output stream to a file instead of standard output
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Overall build deadline
    #[arg(long, value_parser = parse_duration_arg)]
    pub timeout: Option<Duration>,

    /// Log verbosity
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,
}

impl Cli {
    pub fn build_config(&self) -> BuildConfig {
        BuildConfig {
            fail_fast: self.fail_fast,
            api_versions: self.api_versions.clone(),
            kube_version: self.kube_version.clone(),
            include_helm_hooks: self.include_helm_hooks,
            workers: self.workers,
            cache_dir: self.cache_dir.clone(),
            deadline: self.timeout,
        }
    }

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig {
            level: self.log_level,
        }
    }
}
