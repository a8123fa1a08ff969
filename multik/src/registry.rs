//! The cluster registry: a process-wide lookup from cluster name to
//! connection, discovery cache, pool, and middleware.
//!
//! There is no hidden global; the "global" registry is whatever instance
//! the application constructs at startup and passes around (or stores in
//! its own static if it wants one).
use std::{collections::HashMap, path::PathBuf, sync::Arc};

use futures::Stream;
use multik_core::{operation::Operation, watch::WatchEvent};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::{
    auth::{AuthChain, AuthProvider},
    batch::{run_many, BatchOptions},
    client::{ApiResponse, Cluster, Inbound, OpContext, RemoteSession, WatchMessage},
    config::{ConnectOptions, Connection},
    discovery::{DiscoveryDriver, FileDriver, HttpDriver},
    error::{Error, NotFoundError},
    pool::{Connect, HyperConnector, PoolSettings},
    wait::{wait, WaitParams},
};

/// Which discovery driver a registry binds.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverSettings {
    /// Query the live apiserver
    #[default]
    Http,
    /// Read fixtures from a directory
    File {
        /// The fixture directory
        dir: PathBuf,
    },
}

/// Per-cluster entry in [`Settings`].
#[derive(Clone, Debug, Deserialize)]
pub struct ClusterSettings {
    /// Path to the kubeconfig file
    pub conf: PathBuf,
    /// Context/cluster/user selection within it
    #[serde(default)]
    pub conf_opts: ConnectOptions,
}

/// Registry configuration, loadable from YAML.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Clusters to register at startup
    pub clusters: HashMap<String, ClusterSettings>,
    /// Discovery driver selection
    pub discovery_driver: DriverSettings,
    /// Transports per (cluster, host) pool
    pub pool_size: usize,
    /// Idle transport lifetime in milliseconds
    pub idle_timeout_ms: u64,
    /// Default namespace override applied to registered connections
    pub default_namespace: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            clusters: HashMap::new(),
            discovery_driver: DriverSettings::Http,
            pool_size: 10,
            idle_timeout_ms: 90_000,
            default_namespace: None,
        }
    }
}

impl Settings {
    /// Parse settings from a YAML string
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        serde_yaml::from_str(text)
            .map_err(|e| crate::error::ConfigError::ParseYaml(e).into())
    }
}

/// Builder for a [`Registry`] with injected capabilities.
pub struct RegistryBuilder {
    settings: Settings,
    providers: Vec<Arc<dyn AuthProvider>>,
    connector: Option<Arc<dyn Connect>>,
    driver: Option<Arc<dyn DiscoveryDriver>>,
}

impl RegistryBuilder {
    /// Use these settings
    #[must_use]
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Prepend an auth provider to the chain
    #[must_use]
    pub fn auth_provider(mut self, provider: Arc<dyn AuthProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Substitute the transport factory
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connect>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Substitute the discovery driver
    #[must_use]
    pub fn discovery_driver(mut self, driver: Arc<dyn DiscoveryDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Construct the registry and register the configured clusters.
    pub fn build(self) -> Result<Registry, Error> {
        let driver = match (self.driver, &self.settings.discovery_driver) {
            (Some(driver), _) => driver,
            (None, DriverSettings::Http) => Arc::new(HttpDriver) as Arc<dyn DiscoveryDriver>,
            (None, DriverSettings::File { dir }) => Arc::new(FileDriver::new(dir.clone())),
        };
        let registry = Registry {
            clusters: RwLock::new(HashMap::new()),
            auth: AuthChain::standard(self.providers),
            connector: self.connector.unwrap_or_else(|| Arc::new(HyperConnector)),
            driver,
            pool_settings: PoolSettings {
                size: self.settings.pool_size,
                idle_timeout: std::time::Duration::from_millis(self.settings.idle_timeout_ms),
                ..PoolSettings::default()
            },
            default_namespace: self.settings.default_namespace.clone(),
        };
        for (name, cluster) in &self.settings.clusters {
            let conn = Connection::from_kubeconfig(&cluster.conf, &cluster.conf_opts)?;
            registry.register(name, conn);
        }
        Ok(registry)
    }
}

/// Lookup from cluster name to a live [`Cluster`] handle.
pub struct Registry {
    clusters: RwLock<HashMap<String, Arc<Cluster>>>,
    auth: AuthChain,
    connector: Arc<dyn Connect>,
    driver: Arc<dyn DiscoveryDriver>,
    pool_settings: PoolSettings,
    default_namespace: Option<String>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// A registry with default settings and no clusters
    pub fn new() -> Self {
        Self::builder().build().expect("default registry has no clusters to load")
    }

    /// Start building a registry
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            settings: Settings::default(),
            providers: Vec::new(),
            connector: None,
            driver: None,
        }
    }

    /// A registry from parsed [`Settings`]
    pub fn from_settings(settings: Settings) -> Result<Self, Error> {
        Self::builder().settings(settings).build()
    }

    /// Register a connection under `name`, replacing any previous entry.
    pub fn register(&self, name: &str, mut conn: Connection) -> Arc<Cluster> {
        if let Some(ns) = &self.default_namespace {
            conn.default_namespace = ns.clone();
        }
        let cluster = Cluster::new(
            name,
            conn,
            self.auth.clone(),
            self.driver.clone(),
            self.connector.clone(),
            self.pool_settings.clone(),
        );
        let previous = self.clusters.write().insert(name.to_string(), cluster.clone());
        if let Some(previous) = previous {
            tracing::warn!(cluster = name, "replacing registered cluster");
            previous.close();
        }
        cluster
    }

    /// Remove a cluster, closing its pool and cancelling its watches.
    pub fn deregister(&self, name: &str) -> bool {
        match self.clusters.write().remove(name) {
            Some(cluster) => {
                cluster.close();
                true
            }
            None => false,
        }
    }

    /// Look up a registered cluster
    pub fn get(&self, name: &str) -> Result<Arc<Cluster>, Error> {
        self.clusters
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| NotFoundError::UnknownCluster(name.to_string()).into())
    }

    /// Names of all registered clusters
    pub fn names(&self) -> Vec<String> {
        self.clusters.read().keys().cloned().collect()
    }

    /// Run one operation against a named cluster
    pub async fn run(&self, op: &Operation, cluster: &str) -> Result<ApiResponse, Error> {
        self.get(cluster)?.run(op).await
    }

    /// Run one operation under a deadline/cancellation
    pub async fn run_with(
        &self,
        op: &Operation,
        cluster: &str,
        ctx: &OpContext,
    ) -> Result<ApiResponse, Error> {
        self.get(cluster)?.run_with(op, ctx).await
    }

    /// Run many operations in parallel, preserving input order
    pub async fn run_many(
        &self,
        ops: Vec<Operation>,
        cluster: &str,
        opts: &BatchOptions,
    ) -> Result<Vec<Result<ApiResponse, Error>>, Error> {
        let cluster = self.get(cluster)?;
        Ok(run_many(&cluster, ops, opts).await)
    }

    /// A lazy stream of watch events
    pub fn stream(
        &self,
        op: &Operation,
        cluster: &str,
    ) -> Result<impl Stream<Item = Result<WatchEvent, Error>> + Send + 'static, Error> {
        Ok(self.get(cluster)?.events(op))
    }

    /// Pump watch events into a sink
    pub fn watch(
        &self,
        op: &Operation,
        cluster: &str,
        sink: mpsc::Sender<WatchMessage>,
    ) -> Result<tokio::task::JoinHandle<()>, Error> {
        Ok(self.get(cluster)?.watch_with_sink(op, sink))
    }

    /// Open a channeled streaming session
    pub async fn connect(
        &self,
        op: &Operation,
        cluster: &str,
        sink: mpsc::Sender<Inbound>,
    ) -> Result<RemoteSession, Error> {
        self.get(cluster)?.connect(op, sink).await
    }

    /// Poll a get-shaped operation until a predicate holds
    pub async fn wait(
        &self,
        op: &Operation,
        cluster: &str,
        params: &WaitParams,
    ) -> Result<serde_json::Value, Error> {
        let cluster = self.get(cluster)?;
        wait(&cluster, op, params).await
    }

    /// Rebuild a cluster's discovery cache
    pub async fn run_discovery(&self, cluster: &str) -> Result<(), Error> {
        self.get(cluster)?.run_discovery().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_from_yaml() {
        let raw = r#"
        clusters:
          prod:
            conf: /etc/kube/prod.yaml
            conf_opts:
              context: prod-admin
        discovery_driver: http
        pool_size: 4
        idle_timeout_ms: 1000
        default_namespace: ops
        "#;
        let settings = Settings::from_yaml(raw).unwrap();
        assert_eq!(settings.pool_size, 4);
        assert_eq!(settings.idle_timeout_ms, 1000);
        assert_eq!(settings.default_namespace.as_deref(), Some("ops"));
        assert_eq!(settings.clusters["prod"].conf_opts.context.as_deref(), Some("prod-admin"));
        assert!(matches!(settings.discovery_driver, DriverSettings::Http));
    }

    #[test]
    fn file_driver_settings() {
        let raw = "discovery_driver:\n  file:\n    dir: fixtures/discovery\n";
        let settings = Settings::from_yaml(raw).unwrap();
        assert!(matches!(settings.discovery_driver, DriverSettings::File { .. }));
    }

    #[test]
    fn register_lookup_deregister() {
        let registry = Registry::new();
        assert!(matches!(
            registry.get("missing"),
            Err(Error::NotFound(NotFoundError::UnknownCluster(_)))
        ));

        let conn = Connection::new("https://a:6443".parse().unwrap());
        registry.register("a", conn);
        assert!(registry.get("a").is_ok());
        assert_eq!(registry.names(), vec!["a"]);

        assert!(registry.deregister("a"));
        assert!(!registry.deregister("a"));
        assert!(registry.get("a").is_err());
    }

    #[test]
    fn default_namespace_override() {
        let settings = Settings {
            default_namespace: Some("ops".into()),
            ..Settings::default()
        };
        let registry = Registry::from_settings(settings).unwrap();
        let cluster = registry.register("a", Connection::new("https://a:6443".parse().unwrap()));
        assert_eq!(cluster.connection().default_namespace, "ops");
    }

    #[tokio::test]
    async fn deregistered_clusters_cancel_outstanding_work() {
        let registry = Registry::new();
        let cluster = registry.register("a", Connection::new("https://a:6443".parse().unwrap()));
        registry.deregister("a");

        // retained handles fail fast instead of dialing a dead cluster
        let op = Operation::get("v1", "pod").named("p");
        assert!(matches!(cluster.run(&op).await, Err(Error::Cancelled)));
    }
}
