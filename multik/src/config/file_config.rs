//! Raw kubeconfig document types.
//!
//! These mirror the on-disk format of `~/.kube/config` closely enough for
//! credential extraction; unknown fields are ignored.
use std::collections::HashMap;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::utils;
use crate::error::ConfigError;

/// A kubeconfig document: named clusters, users, and contexts.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Kubeconfig {
    /// Referencable names to cluster configs
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    pub clusters: Vec<NamedCluster>,
    /// Referencable names to user configs
    #[serde(rename = "users")]
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    pub auth_infos: Vec<NamedAuthInfo>,
    /// Referencable names to context configs
    #[serde(default, deserialize_with = "deserialize_null_as_default")]
    pub contexts: Vec<NamedContext>,
    /// The context to use when none is requested
    #[serde(rename = "current-context")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_context: Option<String>,
}

impl Kubeconfig {
    /// Read a kubeconfig from a file
    pub fn read_from(path: impl AsRef<std::path::Path>) -> Result<Kubeconfig, ConfigError> {
        let data = utils::read_file_to_string(path)?;
        Self::from_yaml(&data)
    }

    /// Parse a kubeconfig from a YAML string
    pub fn from_yaml(text: &str) -> Result<Kubeconfig, ConfigError> {
        serde_yaml::from_str(text).map_err(ConfigError::ParseYaml)
    }
}

/// Associates a name with a cluster
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NamedCluster {
    /// Name of the cluster
    pub name: String,
    /// How to reach it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<Cluster>,
}

/// Connection information for one cluster
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Cluster {
    /// The address of the apiserver (`https://hostname:port`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Skip validation of the server certificate
    #[serde(rename = "insecure-skip-tls-verify")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub insecure_skip_tls_verify: Option<bool>,
    /// Path to a CA bundle
    #[serde(rename = "certificate-authority")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority: Option<String>,
    /// Inline base64 PEM CA bundle, overrides `certificate_authority`
    #[serde(rename = "certificate-authority-data")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
    /// Proxy to use for requests to this cluster
    #[serde(rename = "proxy-url")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_url: Option<String>,
}

impl Cluster {
    pub(crate) fn load_certificate_authority(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        if self.certificate_authority_data.is_none() && self.certificate_authority.is_none() {
            return Ok(None);
        }
        utils::data_or_file(
            &self.certificate_authority_data,
            &self.certificate_authority,
            "certificate-authority",
        )
        .map(Some)
    }
}

/// Associates a name with a user identity
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NamedAuthInfo {
    /// Name of the user
    pub name: String,
    /// Identity of the user
    #[serde(rename = "user")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_info: Option<AuthInfo>,
}

fn serialize_secretstring<S>(pw: &Option<SecretString>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match pw {
        Some(secret) => serializer.serialize_str(secret.expose_secret()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_secretstring<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::new))
}

fn deserialize_null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    T: Default + Deserialize<'de>,
    D: Deserializer<'de>,
{
    let opt = Option::deserialize(deserializer)?;
    Ok(opt.unwrap_or_default())
}

/// Credential material for one user
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct AuthInfo {
    /// Basic auth username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Basic auth password
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[serde(
        serialize_with = "serialize_secretstring",
        deserialize_with = "deserialize_secretstring"
    )]
    pub password: Option<SecretString>,

    /// Static bearer token
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[serde(
        serialize_with = "serialize_secretstring",
        deserialize_with = "deserialize_secretstring"
    )]
    pub token: Option<SecretString>,
    /// File containing a bearer token, re-read on use; `token` wins over it
    #[serde(rename = "tokenFile")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,

    /// Path to a client certificate for TLS
    #[serde(rename = "client-certificate")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
    /// Inline base64 PEM client certificate, overrides `client_certificate`
    #[serde(rename = "client-certificate-data")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_certificate_data: Option<String>,

    /// Path to a client key for TLS
    #[serde(rename = "client-key")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_key: Option<String>,
    /// Inline base64 PEM client key, overrides `client_key`
    #[serde(rename = "client-key-data")]
    #[serde(skip_serializing_if = "Option::is_none", default)]
    #[serde(
        serialize_with = "serialize_secretstring",
        deserialize_with = "deserialize_secretstring"
    )]
    pub client_key_data: Option<SecretString>,

    /// A named credential plugin with free-form configuration
    #[serde(rename = "auth-provider")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_provider: Option<AuthProviderConfig>,

    /// An exec-based credential plugin
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exec: Option<ExecConfig>,
}

impl AuthInfo {
    /// Whether this user block carries no credential material at all
    pub fn is_empty(&self) -> bool {
        self.username.is_none()
            && self.password.is_none()
            && self.token.is_none()
            && self.token_file.is_none()
            && self.client_certificate.is_none()
            && self.client_certificate_data.is_none()
            && self.client_key.is_none()
            && self.client_key_data.is_none()
            && self.auth_provider.is_none()
            && self.exec.is_none()
    }

    /// Client identity as a PEM blob of certificate followed by key
    pub(crate) fn identity_pem(&self) -> Result<Option<Vec<u8>>, ConfigError> {
        let has_cert = self.client_certificate.is_some() || self.client_certificate_data.is_some();
        let has_key = self.client_key.is_some() || self.client_key_data.is_some();
        if !has_cert || !has_key {
            return Ok(None);
        }
        let mut buf = utils::data_or_file(
            &self.client_certificate_data,
            &self.client_certificate,
            "client-certificate",
        )?;
        let key_data = self
            .client_key_data
            .as_ref()
            .map(|s| s.expose_secret().clone());
        let mut key = utils::data_or_file(&key_data, &self.client_key, "client-key")?;
        if buf.last() != Some(&b'\n') {
            buf.push(b'\n');
        }
        buf.append(&mut key);
        Ok(Some(buf))
    }
}

/// Auth for a named credential plugin
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthProviderConfig {
    /// Name of the provider
    pub name: String,
    /// Provider configuration
    #[serde(default)]
    pub config: HashMap<String, String>,
}

/// Exec credential plugin configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Preferred input version of the ExecCredential
    #[serde(rename = "apiVersion")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Command to execute
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Arguments to pass to the command
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    /// Additional environment variables to expose to the process
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<HashMap<String, String>>>,
    /// Interactivity requirement of the plugin
    #[serde(rename = "interactiveMode")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interactive_mode: Option<String>,
}

/// Associates a name with a context
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct NamedContext {
    /// Name of the context
    pub name: String,
    /// The association
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Context>,
}

/// A (cluster, user, namespace) triple
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Context {
    /// Name of the cluster
    pub cluster: String,
    /// Name of the user
    #[serde(default)]
    pub user: String,
    /// Default namespace for unspecified requests
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_kubeconfig() {
        let raw = r#"
        apiVersion: v1
        kind: Config
        clusters:
        - name: dev
          cluster:
            server: https://10.0.0.1:6443
            certificate-authority-data: aGVsbG8K
        users:
        - name: admin
          user:
            token: secret-token
        contexts:
        - name: dev
          context:
            cluster: dev
            user: admin
            namespace: team-a
        current-context: dev
        "#;
        let cfg = Kubeconfig::from_yaml(raw).unwrap();
        assert_eq!(cfg.current_context.as_deref(), Some("dev"));
        assert_eq!(cfg.clusters[0].name, "dev");
        let user = cfg.auth_infos[0].auth_info.as_ref().unwrap();
        assert!(!user.is_empty());
        assert_eq!(
            user.token.as_ref().map(|t| t.expose_secret().as_str()),
            Some("secret-token")
        );
    }

    #[test]
    fn null_sections_default() {
        let cfg = Kubeconfig::from_yaml("clusters: null\ncurrent-context: x\n").unwrap();
        assert!(cfg.clusters.is_empty());
        assert!(cfg.contexts.is_empty());
    }
}
