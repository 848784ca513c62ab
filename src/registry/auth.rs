//! Derives transport credentials and TLS material from a repository
//! declaration and its referenced secrets.

use oci_client::secrets::RegistryAuth;
use thiserror::Error;

use crate::release::HelmRepository;
use crate::resource::document::{Document, DocumentError};
use crate::resource::key::ResourceKey;

// Entry names used by chart repository secrets.
const USERNAME_ENTRY: &str = "username";
const PASSWORD_ENTRY: &str = "password";
const CERT_FILE_ENTRY: &str = "certFile";
const KEY_FILE_ENTRY: &str = "keyFile";
const CA_FILE_ENTRY: &str = "caFile";
// Entry names used by TLS certificate secrets.
const TLS_CERT_ENTRY: &str = "tls.crt";
const TLS_KEY_ENTRY: &str = "tls.key";
const TLS_CA_ENTRY: &str = "ca.crt";

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("reading secret entry: {0}")]
    Secret(#[from] DocumentError),
    #[error("secret {key} carries `{present}` without `{missing}`")]
    IncompleteKeyPair {
        key: ResourceKey,
        present: &'static str,
        missing: &'static str,
    },
}

/// Client TLS material, PEM-encoded.
#[derive(Debug, Clone, Default)]
pub struct TlsData {
    pub client_cert: Option<Vec<u8>>,
    pub client_key: Option<Vec<u8>>,
    pub ca_bundle: Option<Vec<u8>>,
}

impl TlsData {
    pub fn is_empty(&self) -> bool {
        self.client_cert.is_none() && self.client_key.is_none() && self.ca_bundle.is_none()
    }
}

/// Everything a repository adapter needs to talk to its remote.
#[derive(Debug, Clone, Default)]
pub struct RepositoryCredentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: Option<TlsData>,
    pub pass_credentials: bool,
}

impl RepositoryCredentials {
    pub fn registry_auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => RegistryAuth::Basic(user.clone(), pass.clone()),
            _ => RegistryAuth::Anonymous,
        }
    }

    pub fn has_basic(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Resolves the credential set for a repository from its referenced secret
/// documents. `secret` corresponds to `secretRef` (basic auth plus optional
/// in-secret TLS entries), `cert_secret` to `certSecretRef` (TLS only, takes
/// precedence).
pub fn resolve_credentials(
    repository: &HelmRepository,
    secret: Option<&Document>,
    cert_secret: Option<&Document>,
) -> Result<RepositoryCredentials, AuthError> {
    let mut credentials = RepositoryCredentials {
        pass_credentials: repository.spec.pass_credentials,
        ..Default::default()
    };

    if let Some(secret) = secret {
        credentials.username = secret.data_entry(USERNAME_ENTRY)?;
        credentials.password = secret.data_entry(PASSWORD_ENTRY)?;
        if credentials.username.is_some() && credentials.password.is_none() {
            return Err(AuthError::IncompleteKeyPair {
                key: secret.key().clone(),
                present: USERNAME_ENTRY,
                missing: PASSWORD_ENTRY,
            });
        }
        let tls = TlsData {
            client_cert: secret.data_entry(CERT_FILE_ENTRY)?.map(String::into_bytes),
            client_key: secret.data_entry(KEY_FILE_ENTRY)?.map(String::into_bytes),
            ca_bundle: secret.data_entry(CA_FILE_ENTRY)?.map(String::into_bytes),
        };
        if !tls.is_empty() {
            credentials.tls = Some(tls);
        }
    }

    if let Some(cert_secret) = cert_secret {
        let tls = TlsData {
            client_cert: cert_secret.data_entry(TLS_CERT_ENTRY)?.map(String::into_bytes),
            client_key: cert_secret.data_entry(TLS_KEY_ENTRY)?.map(String::into_bytes),
            ca_bundle: cert_secret.data_entry(TLS_CA_ENTRY)?.map(String::into_bytes),
        };
        if let (Some(_), None) = (&tls.client_cert, &tls.client_key) {
            return Err(AuthError::IncompleteKeyPair {
                key: cert_secret.key().clone(),
                present: TLS_CERT_ENTRY,
                missing: TLS_KEY_ENTRY,
            });
        }
        if !tls.is_empty() {
            credentials.tls = Some(tls);
        }
    }

    Ok(credentials)
}
