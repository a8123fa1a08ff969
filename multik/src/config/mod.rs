//! Per-cluster connection configuration.
//!
//! A [`Connection`] holds the endpoint, trust anchors, and identity needed
//! to talk to one cluster. Construct one from a kubeconfig file with
//! [`Connection::from_kubeconfig`], from the in-cluster service account
//! mount with [`Connection::from_service_account`], or anonymously with
//! [`Connection::new`].
mod file_config;
mod file_loader;
mod incluster;
pub(crate) mod utils;

use std::{path::Path, sync::Arc, time::Duration};

use crate::{auth::ExecState, error::ConfigError};

pub use file_config::{AuthInfo, AuthProviderConfig, Cluster, Context, ExecConfig, Kubeconfig};
pub use file_loader::ConnectOptions;
use file_loader::ConfigLoader;

// https://github.com/kubernetes/kubernetes/issues/6513
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(295);

/// Connection details for one cluster. Immutable after construction.
#[derive(Clone, Debug)]
pub struct Connection {
    /// The apiserver url (scheme, host, port, optional path prefix)
    pub cluster_url: http::Uri,
    /// Namespace applied when operations name none
    pub default_namespace: String,
    /// Trusted root certificates, DER encoded
    pub root_cert: Option<Vec<Vec<u8>>>,
    /// Accept any server certificate
    pub accept_invalid_certs: bool,
    /// Proxy for requests to this cluster
    pub proxy_url: Option<http::Uri>,
    /// `User-Agent` header override
    pub user_agent: Option<String>,
    /// Timeout applied to connection setup and reads
    pub timeout: Option<Duration>,
    /// Credential material for the auth provider chain
    pub(crate) auth_info: AuthInfo,
    /// Client certificate + key PEM from the kubeconfig
    pub(crate) identity_pem: Option<Vec<u8>>,
    /// Explicitly credential-less
    pub(crate) anonymous: bool,
    /// Exec plugin cache, shared by clones of this connection
    pub(crate) exec_state: Arc<ExecState>,
}

impl Connection {
    /// An anonymous connection to an endpoint
    pub fn new(cluster_url: http::Uri) -> Self {
        Self {
            cluster_url,
            default_namespace: String::from("default"),
            root_cert: None,
            accept_invalid_certs: false,
            proxy_url: None,
            user_agent: None,
            timeout: Some(DEFAULT_TIMEOUT),
            auth_info: AuthInfo::default(),
            identity_pem: None,
            anonymous: true,
            exec_state: Arc::new(ExecState::default()),
        }
    }

    /// Build a connection from a kubeconfig file
    pub fn from_kubeconfig(
        path: impl AsRef<Path>,
        options: &ConnectOptions,
    ) -> Result<Self, ConfigError> {
        Self::from_custom_kubeconfig(Kubeconfig::read_from(path)?, options)
    }

    /// Build a connection from `$KUBECONFIG` or `~/.kube/config`
    pub fn from_default_kubeconfig(options: &ConnectOptions) -> Result<Self, ConfigError> {
        let path = utils::default_kubeconfig_path()
            .ok_or(ConfigError::NoFileOrData("kubeconfig"))?;
        Self::from_kubeconfig(path, options)
    }

    /// Build a connection from an already-parsed [`Kubeconfig`]
    pub fn from_custom_kubeconfig(
        config: Kubeconfig,
        options: &ConnectOptions,
    ) -> Result<Self, ConfigError> {
        let loader = ConfigLoader::load(config, options)?;

        let server = loader
            .cluster
            .server
            .clone()
            .ok_or_else(|| ConfigError::InvalidServerUrl("<unset>".into()))?;
        let cluster_url = server
            .parse::<http::Uri>()
            .map_err(|_| ConfigError::InvalidServerUrl(server))?;

        let default_namespace = loader
            .current_context
            .namespace
            .clone()
            .unwrap_or_else(|| String::from("default"));

        let root_cert = match loader.cluster.load_certificate_authority()? {
            Some(bundle) => Some(utils::certs(&bundle)?),
            None => None,
        };

        let mut accept_invalid_certs = false;
        let identity_pem = match loader.user.identity_pem() {
            Ok(id) => id,
            Err(e) => {
                tracing::debug!("failed to load client identity from kubeconfig: {e}");
                None
            }
        };
        if identity_pem.is_none() && loader.cluster.insecure_skip_tls_verify == Some(true) {
            accept_invalid_certs = true;
        }

        let proxy_url = loader
            .cluster
            .proxy_url
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| {
                s.parse::<http::Uri>()
                    .map_err(|_| ConfigError::InvalidServerUrl(s.to_string()))
            })
            .transpose()?;

        let anonymous = loader.user.is_empty();
        if anonymous {
            tracing::debug!("kubeconfig user has no credentials, connecting anonymously");
        }

        Ok(Self {
            cluster_url,
            default_namespace,
            root_cert,
            accept_invalid_certs,
            proxy_url,
            user_agent: None,
            timeout: Some(DEFAULT_TIMEOUT),
            auth_info: loader.user,
            identity_pem,
            anonymous,
            exec_state: Arc::new(ExecState::default()),
        })
    }

    /// Build a connection from the in-cluster service account mount
    ///
    /// Reads `token`, `ca.crt`, and `namespace` from the well-known mount
    /// (or `root` when given) and addresses the apiserver through the
    /// service environment, falling back to `kubernetes.default.svc`.
    pub fn from_service_account(root: Option<&Path>) -> Result<Self, ConfigError> {
        let mount = incluster::ServiceAccountMount::new(root);
        let cluster_url = mount.server()?;
        let token = mount.token()?;
        let root_cert = mount.ca_bundle()?;
        let default_namespace = mount.namespace().unwrap_or_else(|_| String::from("default"));

        Ok(Self {
            cluster_url,
            default_namespace,
            root_cert: Some(root_cert),
            accept_invalid_certs: false,
            proxy_url: None,
            user_agent: None,
            timeout: Some(DEFAULT_TIMEOUT),
            auth_info: AuthInfo {
                token: Some(secrecy::SecretString::new(token.trim().to_string())),
                ..AuthInfo::default()
            },
            identity_pem: None,
            anonymous: false,
            exec_state: Arc::new(ExecState::default()),
        })
    }

    /// Override the default namespace
    #[must_use]
    pub fn default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    /// Set the `User-Agent` sent with every request
    #[must_use]
    pub fn user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }

    /// Whether this connection is explicitly credential-less
    pub fn is_anonymous(&self) -> bool {
        self.anonymous
    }

    /// The authority (`host[:port]`) requests to this cluster resolve to
    pub(crate) fn authority(&self) -> String {
        self.cluster_url
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    /// The client identity, preferring one minted by an exec plugin
    pub(crate) fn current_identity_pem(&self) -> Option<Vec<u8>> {
        self.exec_state
            .identity_pem()
            .or_else(|| self.identity_pem.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::io::Write;

    #[test]
    fn loads_kubeconfig_from_disk() {
        let raw = r#"
        apiVersion: v1
        kind: Config
        clusters:
        - name: k3d-test
          cluster:
            certificate-authority-data: ""
            server: https://0.0.0.0:6443
        contexts:
        - name: k3d-test
          context:
            cluster: k3d-test
            user: admin@k3d-test
            namespace: prod
        current-context: k3d-test
        users:
        - name: admin@k3d-test
          user:
            token: t0ps3cret
        "#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(raw.as_bytes()).unwrap();

        let conn = Connection::from_kubeconfig(file.path(), &ConnectOptions::default()).unwrap();
        assert_eq!(conn.cluster_url.to_string(), "https://0.0.0.0:6443/");
        assert_eq!(conn.default_namespace, "prod");
        assert_eq!(conn.authority(), "0.0.0.0:6443");
        assert!(!conn.is_anonymous());
        assert_eq!(conn.auth_info.token.as_ref().unwrap().expose_secret(), "t0ps3cret");
    }

    #[test]
    fn service_account_mount() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("token"), "sa-token\n").unwrap();
        std::fs::write(dir.path().join("namespace"), "team-b").unwrap();
        std::fs::write(
            dir.path().join("ca.crt"),
            "-----BEGIN CERTIFICATE-----\naGVsbG8=\n-----END CERTIFICATE-----\n",
        )
        .unwrap();

        let conn = Connection::from_service_account(Some(dir.path())).unwrap();
        assert_eq!(conn.default_namespace, "team-b");
        assert_eq!(conn.root_cert.as_ref().unwrap().len(), 1);
        // token whitespace is trimmed before use as a bearer credential
        assert_eq!(conn.auth_info.token.as_ref().unwrap().expose_secret(), "sa-token");
    }

    #[test]
    fn empty_user_is_anonymous() {
        let raw = r#"
        clusters:
        - name: c
          cluster: { server: "https://c:6443" }
        contexts:
        - name: c
          context: { cluster: c, user: nobody }
        users:
        - name: nobody
          user: {}
        current-context: c
        "#;
        let conn =
            Connection::from_custom_kubeconfig(Kubeconfig::from_yaml(raw).unwrap(), &Default::default())
                .unwrap();
        assert!(conn.is_anonymous());
    }
}
