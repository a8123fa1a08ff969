//! Service account credentials from the in-cluster mount.
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub(crate) const SERVICE_HOSTENV: &str = "KUBERNETES_SERVICE_HOST";
pub(crate) const SERVICE_PORTENV: &str = "KUBERNETES_SERVICE_PORT";
const SERVICE_DNS: &str = "https://kubernetes.default.svc";
const DEFAULT_MOUNT: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// The well-known service account mount, relocatable for tests.
pub(crate) struct ServiceAccountMount {
    root: PathBuf,
}

impl ServiceAccountMount {
    pub(crate) fn new(root: Option<&Path>) -> Self {
        Self {
            root: root.map(Path::to_path_buf).unwrap_or_else(|| DEFAULT_MOUNT.into()),
        }
    }

    /// Apiserver address from the service env, falling back to cluster DNS
    pub(crate) fn server(&self) -> Result<http::Uri, ConfigError> {
        let url = match (
            std::env::var(SERVICE_HOSTENV).ok().filter(|v| !v.is_empty()),
            std::env::var(SERVICE_PORTENV).ok().filter(|v| !v.is_empty()),
        ) {
            (Some(host), Some(port)) => format!("https://{host}:{port}"),
            _ => SERVICE_DNS.to_string(),
        };
        url.parse::<http::Uri>()
            .map_err(|_| ConfigError::InvalidServerUrl(url))
    }

    pub(crate) fn token(&self) -> Result<String, ConfigError> {
        super::utils::read_file_to_string(self.root.join("token"))
    }

    pub(crate) fn ca_bundle(&self) -> Result<Vec<Vec<u8>>, ConfigError> {
        let pem = super::utils::read_file(self.root.join("ca.crt"))?;
        super::utils::certs(&pem)
    }

    pub(crate) fn namespace(&self) -> Result<String, ConfigError> {
        super::utils::read_file_to_string(self.root.join("namespace"))
            .map(|ns| ns.trim().to_string())
    }
}
