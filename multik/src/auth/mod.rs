//! Pluggable credential strategies.
//!
//! Authentication is a capability: given a [`Connection`], produce the
//! header material for one request. Providers are consulted in order,
//! user-registered ones first, then the built-ins; the first provider that
//! accepts the connection's user block wins and the rest are not consulted.
use std::{process::Command, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use http::{header::AUTHORIZATION, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{
    config::{AuthInfo, AuthProviderConfig, Connection, ExecConfig},
    error::AuthError,
};

/// Wiggle room so tokens are refreshed before they lapse mid-request
const EXPIRY_SKEW: i64 = 60;

/// Header material for one request
#[derive(Clone, Debug, Default)]
pub struct Credential {
    /// Headers to merge into the request
    pub headers: HeaderMap,
}

impl Credential {
    fn bearer(token: &str) -> Result<Self, AuthError> {
        let mut value = HeaderValue::try_from(format!("Bearer {token}"))
            .map_err(AuthError::InvalidBearerToken)?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(Self { headers })
    }
}

/// A credential strategy.
///
/// Register extra providers through the registry builder; they are
/// consulted before the built-in ones.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Name used in middleware listings and error messages
    fn name(&self) -> &'static str;

    /// Whether this provider can handle the connection's user block
    fn accepts(&self, auth: &AuthInfo) -> bool;

    /// Produce header material; may suspend (exec plugins, file reads)
    async fn authenticate(&self, conn: &Connection) -> Result<Credential, AuthError>;
}

/// The ordered provider chain for a registry.
#[derive(Clone)]
pub struct AuthChain {
    providers: Vec<Arc<dyn AuthProvider>>,
}

impl std::fmt::Debug for AuthChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.providers.iter().map(|p| p.name()))
            .finish()
    }
}

impl AuthChain {
    /// The built-in chain with `extra` providers prepended
    pub fn standard(extra: Vec<Arc<dyn AuthProvider>>) -> Self {
        let mut providers = extra;
        providers.push(Arc::new(ClientCertProvider));
        providers.push(Arc::new(BasicAuthProvider));
        providers.push(Arc::new(TokenProvider));
        providers.push(Arc::new(TokenFileProvider));
        providers.push(Arc::new(ExecPluginProvider));
        providers.push(Arc::new(NamedPluginProvider));
        Self { providers }
    }

    /// Resolve credentials for one request against `conn`
    pub async fn credentials(&self, conn: &Connection) -> Result<Credential, AuthError> {
        for provider in &self.providers {
            if provider.accepts(&conn.auth_info) {
                return provider.authenticate(conn).await;
            }
        }
        if conn.is_anonymous() {
            Ok(Credential::default())
        } else {
            Err(AuthError::Unconfigured)
        }
    }
}

/// Client certificates authenticate at the TLS layer; no header is set.
struct ClientCertProvider;

#[async_trait]
impl AuthProvider for ClientCertProvider {
    fn name(&self) -> &'static str {
        "client-cert"
    }

    fn accepts(&self, auth: &AuthInfo) -> bool {
        (auth.client_certificate.is_some() || auth.client_certificate_data.is_some())
            && (auth.client_key.is_some() || auth.client_key_data.is_some())
            && auth.token.is_none()
            && auth.token_file.is_none()
            && auth.exec.is_none()
            && auth.auth_provider.is_none()
    }

    async fn authenticate(&self, _conn: &Connection) -> Result<Credential, AuthError> {
        Ok(Credential::default())
    }
}

struct BasicAuthProvider;

#[async_trait]
impl AuthProvider for BasicAuthProvider {
    fn name(&self) -> &'static str {
        "basic"
    }

    fn accepts(&self, auth: &AuthInfo) -> bool {
        auth.username.is_some() && auth.password.is_some()
    }

    async fn authenticate(&self, conn: &Connection) -> Result<Credential, AuthError> {
        use base64::Engine;
        let auth = &conn.auth_info;
        let user = auth.username.as_deref().unwrap_or_default();
        let pass = auth
            .password
            .as_ref()
            .map(|p| p.expose_secret().clone())
            .unwrap_or_default();
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"));
        let mut value = HeaderValue::try_from(format!("Basic {encoded}"))
            .map_err(AuthError::InvalidBasicAuth)?;
        value.set_sensitive(true);
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, value);
        Ok(Credential { headers })
    }
}

struct TokenProvider;

#[async_trait]
impl AuthProvider for TokenProvider {
    fn name(&self) -> &'static str {
        "token"
    }

    fn accepts(&self, auth: &AuthInfo) -> bool {
        auth.token.is_some()
    }

    async fn authenticate(&self, conn: &Connection) -> Result<Credential, AuthError> {
        let token = conn.auth_info.token.as_ref().expect("accepts checked token");
        Credential::bearer(token.expose_secret().trim())
    }
}

/// Re-reads the referenced file on every request so rotated tokens are
/// picked up without restarting.
struct TokenFileProvider;

#[async_trait]
impl AuthProvider for TokenFileProvider {
    fn name(&self) -> &'static str {
        "token-file"
    }

    fn accepts(&self, auth: &AuthInfo) -> bool {
        auth.token_file.is_some()
    }

    async fn authenticate(&self, conn: &Connection) -> Result<Credential, AuthError> {
        let path = conn.auth_info.token_file.as_ref().expect("accepts checked file");
        let token = std::fs::read_to_string(path)
            .map_err(|e| AuthError::ReadTokenFile(e, path.into()))?;
        Credential::bearer(token.trim())
    }
}

/// Credential and per-connection plugin state shared by clones of a
/// [`Connection`].
#[derive(Debug, Default)]
pub struct ExecState {
    /// at-most-one concurrent exec per identity
    cache: tokio::sync::Mutex<Option<CachedCredential>>,
    /// client identity minted by the plugin, consumed by the connector
    identity: parking_lot::Mutex<Option<Vec<u8>>>,
}

impl ExecState {
    pub(crate) fn identity_pem(&self) -> Option<Vec<u8>> {
        self.identity.lock().clone()
    }
}

#[derive(Debug, Clone)]
struct CachedCredential {
    token: Option<SecretString>,
    expires_at: Option<DateTime<Utc>>,
}

impl CachedCredential {
    fn is_fresh(&self) -> bool {
        match self.expires_at {
            Some(at) => Utc::now() + Duration::seconds(EXPIRY_SKEW) < at,
            None => true,
        }
    }
}

/// ExecCredential output of a credential plugin
#[derive(Debug, Deserialize)]
struct ExecCredential {
    status: Option<ExecCredentialStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecCredentialStatus {
    token: Option<String>,
    client_certificate_data: Option<String>,
    client_key_data: Option<String>,
    expiration_timestamp: Option<String>,
}

struct ExecPluginProvider;

#[async_trait]
impl AuthProvider for ExecPluginProvider {
    fn name(&self) -> &'static str {
        "exec"
    }

    fn accepts(&self, auth: &AuthInfo) -> bool {
        auth.exec.is_some()
    }

    async fn authenticate(&self, conn: &Connection) -> Result<Credential, AuthError> {
        let exec = conn.auth_info.exec.as_ref().expect("accepts checked exec");
        let mut cache = conn.exec_state.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if cached.is_fresh() {
                return match &cached.token {
                    Some(token) => Credential::bearer(token.expose_secret()),
                    None => Ok(Credential::default()),
                };
            }
        }

        let status = run_exec_plugin(exec)?;
        let expires_at = status
            .expiration_timestamp
            .as_deref()
            .map(|ts| {
                DateTime::parse_from_rfc3339(ts)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(AuthError::MalformedExpiration)
            })
            .transpose()?;

        if let (Some(cert), Some(key)) = (&status.client_certificate_data, &status.client_key_data) {
            let mut pem = cert.as_bytes().to_vec();
            if pem.last() != Some(&b'\n') {
                pem.push(b'\n');
            }
            pem.extend_from_slice(key.as_bytes());
            *conn.exec_state.identity.lock() = Some(pem);
        }

        let token = status.token.map(SecretString::new);
        let credential = match &token {
            Some(t) => Credential::bearer(t.expose_secret())?,
            None => Credential::default(),
        };
        *cache = Some(CachedCredential { token, expires_at });
        Ok(credential)
    }
}

fn run_exec_plugin(exec: &ExecConfig) -> Result<ExecCredentialStatus, AuthError> {
    if exec.interactive_mode.as_deref() == Some("Always") {
        return Err(AuthError::ExecFailed {
            code: None,
            stderr: "plugin requires an interactive terminal".into(),
        });
    }
    let command = exec.command.as_ref().ok_or(AuthError::MissingCommand)?;
    let mut cmd = Command::new(command);
    if let Some(args) = &exec.args {
        cmd.args(args);
    }
    if let Some(env) = &exec.env {
        let vars = env
            .iter()
            .filter_map(|m| Some((m.get("name")?.clone(), m.get("value")?.clone())));
        cmd.envs(vars);
    }
    let api_version = exec.api_version.as_deref().unwrap_or("client.authentication.k8s.io/v1");
    cmd.env(
        "KUBERNETES_EXEC_INFO",
        format!(
            r#"{{"apiVersion":"{api_version}","kind":"ExecCredential","spec":{{"interactive":false}}}}"#
        ),
    );

    let out = cmd.output().map_err(|e| AuthError::ExecFailed {
        code: None,
        stderr: e.to_string(),
    })?;
    if !out.status.success() {
        let stderr = String::from_utf8_lossy(&out.stderr);
        let tail = stderr
            .lines()
            .rev()
            .take(4)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        return Err(AuthError::ExecFailed {
            code: out.status.code(),
            stderr: tail,
        });
    }
    let credential: ExecCredential =
        serde_json::from_slice(&out.stdout).map_err(AuthError::ExecParse)?;
    credential.status.ok_or(AuthError::ExecFailed {
        code: out.status.code(),
        stderr: "plugin output did not contain a status".into(),
    })
}

/// Generic handler for kubeconfig `auth-provider` blocks.
///
/// Understands the command-based convention (`cmd-path`, `cmd-args`,
/// `token-key`, `expiry-key`) plus a pre-populated `access-token` with an
/// optional `expiry`.
struct NamedPluginProvider;

#[async_trait]
impl AuthProvider for NamedPluginProvider {
    fn name(&self) -> &'static str {
        "auth-provider"
    }

    fn accepts(&self, auth: &AuthInfo) -> bool {
        auth.auth_provider.is_some()
    }

    async fn authenticate(&self, conn: &Connection) -> Result<Credential, AuthError> {
        let provider = conn
            .auth_info
            .auth_provider
            .as_ref()
            .expect("accepts checked provider");

        if let Some(token) = provider.config.get("access-token") {
            match parse_expiry(provider)? {
                Some(expiry) if Utc::now() + Duration::seconds(EXPIRY_SKEW) >= expiry => {}
                _ => return Credential::bearer(token),
            }
        }
        if let Some(path) = provider.config.get("cmd-path") {
            let token = run_provider_command(path, provider)?;
            return Credential::bearer(&token);
        }
        if provider.config.contains_key("access-token") {
            // expired, and nothing configured to refresh it with
            return Err(AuthError::Expired);
        }
        Err(AuthError::UnsupportedProvider(provider.name.clone()))
    }
}

fn parse_expiry(provider: &AuthProviderConfig) -> Result<Option<DateTime<Utc>>, AuthError> {
    provider
        .config
        .get("expiry")
        .map(|raw| {
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(AuthError::MalformedExpiration)
        })
        .transpose()
}

fn run_provider_command(path: &str, provider: &AuthProviderConfig) -> Result<String, AuthError> {
    let mut cmd = Command::new(path);
    if let Some(args) = provider.config.get("cmd-args") {
        cmd.args(args.split_whitespace());
    }
    let out = cmd.output().map_err(|e| AuthError::ExecFailed {
        code: None,
        stderr: e.to_string(),
    })?;
    if !out.status.success() {
        return Err(AuthError::ExecFailed {
            code: out.status.code(),
            stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
        });
    }
    let output: serde_json::Value =
        serde_json::from_slice(&out.stdout).map_err(AuthError::ExecParse)?;
    let token_key = provider
        .config
        .get("token-key")
        .map(|k| k.trim_start_matches("{.").trim_end_matches('}').to_string())
        .unwrap_or_else(|| "token".to_string());
    multik_core::object::lookup(&output, &token_key)
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| AuthError::ExecFailed {
            code: None,
            stderr: format!("no token at {token_key} in plugin output"),
        })
}
