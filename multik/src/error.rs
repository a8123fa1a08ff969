//! Error handling in [`multik`][crate]
use std::path::PathBuf;

use multik_core::response::Status;
use serde_json::Value;
use thiserror::Error;

/// Possible errors from running operations
#[derive(Error, Debug)]
pub enum Error {
    /// Credential or transport-security problem
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Routing problem; never retried
    #[error("{0}")]
    NotFound(#[from] NotFoundError),

    /// The server produced a non-2xx response or an undecodable body
    #[error("http error: {0}")]
    Http(#[from] HttpError),

    /// Pre-response transport failure
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A caller-set or waiter-set deadline elapsed
    #[error("timed out: {0}")]
    Timeout(#[from] TimeoutError),

    /// The caller revoked the operation
    #[error("operation cancelled")]
    Cancelled,

    /// The operation could not be turned into a request
    #[error("failed to build request: {0}")]
    BuildRequest(#[source] multik_core::request::Error),

    /// A middleware rejected the request or response
    #[error("middleware {name} failed: {message}")]
    Middleware {
        /// Name of the failing middleware
        name: String,
        /// What it had to say
        message: String,
    },

    /// Transparent list pagination aborted part way through
    #[error("list follow aborted after {} items: {source}", .items.len())]
    PartialList {
        /// Items gathered before the failure
        items: Vec<Value>,
        /// The error that stopped the follow
        #[source]
        source: Box<Error>,
    },

    /// Problems loading connection configuration
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Problems during api discovery
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Failures upgrading a connect operation to a WebSocket
    #[error("upgrade error: {0}")]
    Upgrade(#[from] UpgradeError),
}

impl From<multik_core::request::Error> for Error {
    fn from(err: multik_core::request::Error) -> Self {
        match err {
            multik_core::request::Error::UnsupportedVerb(verb, resource) => {
                Error::NotFound(NotFoundError::UnsupportedVerb { verb, resource })
            }
            other => Error::BuildRequest(other),
        }
    }
}

/// Credential and transport-security problems
#[derive(Error, Debug)]
pub enum AuthError {
    /// No credential material is configured and the connection is not
    /// explicitly anonymous
    #[error("no usable credentials configured")]
    Unconfigured,

    /// The exec credential plugin failed
    #[error("exec credential plugin exited with {code:?}: {stderr}")]
    ExecFailed {
        /// The plugin's exit code, if it exited at all
        code: Option<i32>,
        /// Tail of the plugin's stderr
        stderr: String,
    },

    /// A credential expired and cannot be refreshed
    #[error("credential expired and is not refreshable")]
    Expired,

    /// TLS material could not be loaded or used
    #[error("tls error: {0}")]
    Tls(String),

    /// The token did not form a valid header value
    #[error("invalid bearer token: {0}")]
    InvalidBearerToken(#[source] http::header::InvalidHeaderValue),

    /// Basic credentials did not form a valid header value
    #[error("invalid basic auth: {0}")]
    InvalidBasicAuth(#[source] http::header::InvalidHeaderValue),

    /// The token file could not be read
    #[error("failed to read token file {1:?}: {0}")]
    ReadTokenFile(#[source] std::io::Error, PathBuf),

    /// The exec plugin's output was not a credential
    #[error("failed to parse exec plugin output: {0}")]
    ExecParse(#[source] serde_json::Error),

    /// The exec plugin's expiry was not a timestamp
    #[error("malformed credential expiration date: {0}")]
    MalformedExpiration(#[source] chrono::ParseError),

    /// exec was configured without a command
    #[error("exec credential plugin has no command")]
    MissingCommand,

    /// No provider in the chain accepted the auth-provider block
    #[error("auth provider {0:?} is not supported")]
    UnsupportedProvider(String),
}

/// Routing problems
#[derive(Error, Debug)]
pub enum NotFoundError {
    /// No cluster with this name is registered
    #[error("cluster {0:?} is not registered")]
    UnknownCluster(String),

    /// The identifier resolved to nothing in the discovery cache
    #[error("resource {id:?} is not served under {group_version}")]
    UnknownResource {
        /// The caller's identifier
        id: String,
        /// The group version it was resolved against
        group_version: String,
    },

    /// The resolved descriptor does not advertise this verb
    #[error("verb {verb} is not supported by resource {resource}")]
    UnsupportedVerb {
        /// The refused verb
        verb: String,
        /// The descriptor's name
        resource: String,
    },
}

/// Errors produced once the server has responded
#[derive(Error, Debug)]
pub enum HttpError {
    /// A non-2xx response, with the parsed `Status` when the body was one
    #[error("request failed with status {code}")]
    Status {
        /// The HTTP status code
        code: u16,
        /// The decoded Kubernetes status object, when present
        status: Option<Status>,
    },

    /// The response body was not valid UTF-8
    #[error("invalid response body: {0}")]
    InvalidBody(#[from] std::string::FromUtf8Error),

    /// The response body did not decode into the expected shape
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures before the server produced a response
#[derive(Error, Debug)]
pub enum TransportError {
    /// The connection or request timed out below the operation deadline
    #[error("request timed out: {0}")]
    Timeout(#[source] tower::BoxError),

    /// The endpoint refused the connection
    #[error("connection refused: {0}")]
    Refused(#[source] tower::BoxError),

    /// The connection was reset mid-flight
    #[error("connection reset: {0}")]
    Reset(#[source] tower::BoxError),

    /// The TLS handshake failed
    #[error("tls handshake failed: {0}")]
    TlsHandshake(#[source] tower::BoxError),
}

impl TransportError {
    /// Classify a boxed transport-layer error into the closed kind set.
    pub(crate) fn classify(err: tower::BoxError) -> Self {
        enum Kind {
            Timeout,
            Refused,
            Reset,
            Tls,
        }
        let kind = {
            let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(err.as_ref());
            let mut found = Kind::Reset;
            while let Some(e) = cause {
                if let Some(hyper) = e.downcast_ref::<hyper::Error>() {
                    if hyper.is_timeout() {
                        found = Kind::Timeout;
                        break;
                    }
                    if hyper.is_connect() {
                        found = Kind::Refused;
                        break;
                    }
                }
                if let Some(io) = e.downcast_ref::<std::io::Error>() {
                    found = match io.kind() {
                        std::io::ErrorKind::TimedOut => Kind::Timeout,
                        std::io::ErrorKind::ConnectionRefused => Kind::Refused,
                        _ => Kind::Reset,
                    };
                    break;
                }
                if e.downcast_ref::<rustls::Error>().is_some() {
                    found = Kind::Tls;
                    break;
                }
                cause = e.source();
            }
            found
        };
        match kind {
            Kind::Timeout => TransportError::Timeout(err),
            Kind::Refused => TransportError::Refused(err),
            Kind::Reset => TransportError::Reset(err),
            Kind::Tls => TransportError::TlsHandshake(err),
        }
    }
}

/// Deadlines
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TimeoutError {
    /// The operation's own deadline elapsed
    #[error("operation deadline elapsed")]
    Deadline,

    /// The waiter's deadline elapsed before the predicate held
    #[error("wait deadline elapsed")]
    Wait,
}

/// Possible errors when loading connection configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Could not read a file referenced from configuration
    #[error("failed to read {path:?}: {source}")]
    ReadFile {
        /// The offending path
        path: PathBuf,
        /// The io error
        #[source]
        source: std::io::Error,
    },

    /// The kubeconfig was not valid YAML
    #[error("failed to parse kubeconfig YAML: {0}")]
    ParseYaml(#[source] serde_yaml::Error),

    /// No current context and none was requested
    #[error("failed to determine current context")]
    CurrentContextNotSet,

    /// The requested context does not exist
    #[error("failed to load context {context_name:?}")]
    LoadContext {
        /// The missing context
        context_name: String,
    },

    /// The context references an unknown cluster
    #[error("failed to load cluster of context: {cluster_name}")]
    LoadClusterOfContext {
        /// The missing cluster
        cluster_name: String,
    },

    /// The context references an unknown user
    #[error("failed to find named user: {user_name}")]
    FindUser {
        /// The missing user
        user_name: String,
    },

    /// Base64 data in the kubeconfig did not decode
    #[error("failed to decode base64: {0}")]
    Base64Decode(#[source] base64::DecodeError),

    /// Neither inline data nor a file path was provided
    #[error("failed to get data or file for {0}")]
    NoFileOrData(&'static str),

    /// The cluster's server url was missing or unparseable
    #[error("invalid cluster server url: {0}")]
    InvalidServerUrl(String),

    /// Required in-cluster environment variables were not set
    #[error("missing environment variables {hostenv} and/or {portenv}")]
    MissingInClusterVariables {
        /// Host variable name
        hostenv: &'static str,
        /// Port variable name
        portenv: &'static str,
    },

    /// PEM material in the config could not be parsed
    #[error("failed to parse PEM: {0}")]
    ParseCertificates(#[source] pem::PemError),
}

/// Possible errors when using API discovery
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// The group version string could not be parsed
    #[error("invalid group version: {0}")]
    InvalidGroupVersion(String),

    /// The version list endpoint produced an unexpected shape
    #[error("malformed version list from {0}")]
    MalformedVersionList(String),

    /// The resource list endpoint produced an unexpected shape
    #[error("malformed resource list for {0}")]
    MalformedResourceList(String),
}

/// Possible errors when upgrading a connect operation to a WebSocket
#[derive(Error, Debug)]
pub enum UpgradeError {
    /// The server did not reply `101 Switching Protocols`
    #[error("failed to switch protocols, status {0}")]
    ProtocolSwitch(http::StatusCode),

    /// `Upgrade` header was not `websocket` (case insensitive)
    #[error("upgrade header was not set to websocket")]
    MissingUpgradeWebSocketHeader,

    /// `Connection` header was not `Upgrade` (case insensitive)
    #[error("connection header was not set to Upgrade")]
    MissingConnectionUpgradeHeader,

    /// `Sec-WebSocket-Accept` key mismatched
    #[error("Sec-WebSocket-Accept key mismatched")]
    SecWebSocketAcceptKeyMismatch,

    /// The server selected a subprotocol we did not offer
    #[error("Sec-WebSocket-Protocol mismatched")]
    SecWebSocketProtocolMismatch,

    /// The pending HTTP upgrade failed
    #[error("failed to get pending HTTP upgrade: {0}")]
    GetPendingUpgrade(#[source] hyper::Error),
}

impl Error {
    /// Whether the watch reconnect loop may retry after this error
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }
}
