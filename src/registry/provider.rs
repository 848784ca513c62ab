//! Cloud-provider registry login for OCI repositories without a configured
//! secret. The exchange shells out to the provider's credential helper, the
//! same source a `docker login` against the registry would use.

use std::io::ErrorKind;
use std::process::Command;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::release::helm_repository::Provider;
use crate::utils::threads::spawn_named_thread;

/// Ceiling for one credential exchange, per repository.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("credential helper `{0}` failed: {1}")]
    Exchange(String, String),
    #[error("credential helper `{0}` timed out after {1:?}")]
    Timeout(String, Duration),
}

/// A username/token pair accepted by the registry as basic credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryToken {
    pub username: String,
    pub token: String,
}

/// Exchanges a cloud-provider identity for a registry login token.
///
/// Returning `Ok(None)` means the provider is not configured on this host and
/// the pull proceeds anonymously; any other failure is fatal to the release.
pub trait TokenExchanger: Send + Sync {
    fn login(&self, provider: Provider, registry_host: &str) -> Result<Option<RegistryToken>, ProviderError>;
}

/// Default exchanger backed by the provider CLIs.
pub struct CliTokenExchanger {
    timeout: Duration,
}

impl Default for CliTokenExchanger {
    fn default() -> Self {
        Self {
            timeout: EXCHANGE_TIMEOUT,
        }
    }
}

impl TokenExchanger for CliTokenExchanger {
    fn login(
        &self,
        provider: Provider,
        registry_host: &str,
    ) -> Result<Option<RegistryToken>, ProviderError> {
        let (program, args, username): (&str, &[&str], &str) = match provider {
            Provider::Generic => return Ok(None),
            Provider::Aws => ("aws", &["ecr", "get-login-password"], "AWS"),
            Provider::Gcp => ("gcloud", &["auth", "print-access-token"], "oauth2accesstoken"),
            Provider::Azure => (
                "az",
                &["account", "get-access-token", "--query", "accessToken", "--output", "tsv"],
                "00000000-0000-0000-0000-000000000000",
            ),
        };
        debug!(%registry_host, helper = program, "exchanging provider credentials");

        match self.run_helper(program, args)? {
            Some(token) => Ok(Some(RegistryToken {
                username: username.to_string(),
                token,
            })),
            None => Ok(None),
        }
    }
}

impl CliTokenExchanger {
    #[cfg(test)]
    fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Runs the helper on a worker thread so the 60-second ceiling holds even
    /// when the helper hangs. A missing binary means the provider is simply
    /// unconfigured.
    fn run_helper(&self, program: &str, args: &[&str]) -> Result<Option<String>, ProviderError> {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        let owned_program = program.to_string();
        let owned_args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        spawn_named_thread(format!("credential-helper-{program}"), move || {
            let result = Command::new(&owned_program).args(&owned_args).output();
            let _ = sender.send(result);
        });

        let output = match receiver.recv_timeout(self.timeout) {
            Ok(Ok(output)) => output,
            Ok(Err(err)) if err.kind() == ErrorKind::NotFound => {
                debug!(helper = program, "credential helper not installed, provider ignored");
                return Ok(None);
            }
            Ok(Err(err)) => {
                return Err(ProviderError::Exchange(program.to_string(), err.to_string()));
            }
            Err(_) => return Err(ProviderError::Timeout(program.to_string(), self.timeout)),
        };

        if !output.status.success() {
            return Err(ProviderError::Exchange(
                program.to_string(),
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(Some(
            String::from_utf8_lossy(&output.stdout).trim().to_string(),
        ))
    }
}
