//! Per-cluster discovery caching.
//!
//! The cache is a read-mostly snapshot replaced atomically by discovery
//! passes; readers never observe a half-updated group version. Overlapping
//! passes for the same cluster are coalesced so at most one is in flight.
mod driver;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use multik_core::resource::ResourceDescriptor;
use parking_lot::RwLock;

use crate::error::Error;

pub use driver::{DiscoveryApi, DiscoveryDriver, FileDriver, HttpDriver};

/// One consistent view of a cluster's served surface.
#[derive(Clone, Debug, Default)]
pub struct Snapshot {
    /// Group versions in the order the server reported them
    pub versions: Vec<String>,
    /// Resource tables keyed by group version
    pub resources: HashMap<String, Vec<ResourceDescriptor>>,
}

/// The discovery cache for one cluster.
pub struct DiscoveryCache {
    snapshot: RwLock<Arc<Snapshot>>,
    gate: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl Default for DiscoveryCache {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            gate: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }
}

impl DiscoveryCache {
    /// The current snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Whether no discovery pass has completed yet
    pub fn is_empty(&self) -> bool {
        self.generation.load(Ordering::SeqCst) == 0
    }

    /// Rebuild the cache from the driver.
    ///
    /// Concurrent calls coalesce: callers that waited behind an in-flight
    /// pass return as soon as it lands, without issuing any requests of
    /// their own. A group version whose fetch fails keeps its previous
    /// table; partial discovery is logged, not raised, so unrelated
    /// lookups keep working.
    pub async fn run(
        &self,
        driver: &dyn DiscoveryDriver,
        api: &dyn DiscoveryApi,
    ) -> Result<(), Error> {
        let entered_at = self.generation.load(Ordering::SeqCst);
        let _gate = self.gate.lock().await;
        if self.generation.load(Ordering::SeqCst) != entered_at {
            // a pass completed while we waited; its snapshot is fresh enough
            return Ok(());
        }

        let versions = driver.versions(api).await?;
        let prior = self.snapshot();
        let mut resources = HashMap::new();
        for gv in &versions {
            match driver.resources(gv, api).await {
                Ok(table) => {
                    resources.insert(gv.clone(), table);
                }
                Err(error) => {
                    tracing::warn!(%gv, %error, "discovery failed for group version, keeping previous entry");
                    if let Some(prev) = prior.resources.get(gv) {
                        resources.insert(gv.clone(), prev.clone());
                    }
                }
            }
        }

        *self.snapshot.write() = Arc::new(Snapshot { versions, resources });
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;

    struct NullApi;

    #[async_trait]
    impl DiscoveryApi for NullApi {
        async fn get_json(&self, _path: &str) -> Result<Value, Error> {
            unreachable!("counting driver never touches the api")
        }
    }

    struct CountingDriver {
        version_calls: AtomicUsize,
        fail_gv: Option<String>,
    }

    impl CountingDriver {
        fn new(fail_gv: Option<&str>) -> Self {
            Self {
                version_calls: AtomicUsize::new(0),
                fail_gv: fail_gv.map(str::to_string),
            }
        }
    }

    #[async_trait]
    impl DiscoveryDriver for CountingDriver {
        async fn versions(&self, _api: &dyn DiscoveryApi) -> Result<Vec<String>, Error> {
            self.version_calls.fetch_add(1, Ordering::SeqCst);
            // let concurrent callers pile up on the gate
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(vec!["v1".into(), "apps/v1".into()])
        }

        async fn resources(
            &self,
            gv: &str,
            _api: &dyn DiscoveryApi,
        ) -> Result<Vec<ResourceDescriptor>, Error> {
            if self.fail_gv.as_deref() == Some(gv) {
                return Err(crate::error::DiscoveryError::MalformedResourceList(gv.into()).into());
            }
            Ok(vec![ResourceDescriptor {
                kind: "Pod".into(),
                name: "pods".into(),
                namespaced: true,
                verbs: vec!["get".into(), "list".into()],
                short_names: vec![],
            }])
        }
    }

    #[tokio::test]
    async fn concurrent_runs_coalesce() {
        let cache = Arc::new(DiscoveryCache::default());
        let driver = Arc::new(CountingDriver::new(None));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let driver = driver.clone();
            tasks.push(tokio::spawn(async move {
                cache.run(driver.as_ref(), &NullApi).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(driver.version_calls.load(Ordering::SeqCst), 1);
        assert!(!cache.is_empty());
        assert!(cache.snapshot().resources.contains_key("apps/v1"));
    }

    #[tokio::test]
    async fn failed_group_version_keeps_previous_entry() {
        let cache = DiscoveryCache::default();

        let healthy = CountingDriver::new(None);
        cache.run(&healthy, &NullApi).await.unwrap();
        assert!(cache.snapshot().resources.contains_key("apps/v1"));

        let flaky = CountingDriver::new(Some("apps/v1"));
        cache.run(&flaky, &NullApi).await.unwrap();

        let snapshot = cache.snapshot();
        // the broken gv kept its old table, the healthy one refreshed
        assert!(snapshot.resources.contains_key("apps/v1"));
        assert!(snapshot.resources.contains_key("v1"));
    }

    #[tokio::test]
    async fn file_driver_reads_fixtures() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("versions.json"),
            json!(["v1", "apps/v1"]).to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("apps_v1.json"),
            json!({"resources": [
                {"name": "deployments", "kind": "Deployment", "namespaced": true,
                 "verbs": ["get", "list"], "shortNames": ["deploy"]},
                {"name": "deployments/status", "kind": "Deployment", "namespaced": true,
                 "verbs": ["get", "patch"]}
            ]})
            .to_string(),
        )
        .unwrap();

        let driver = FileDriver::new(dir.path());
        let versions = driver.versions(&NullApi).await.unwrap();
        assert_eq!(versions, vec!["v1", "apps/v1"]);

        let table = driver.resources("apps/v1", &NullApi).await.unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(multik_core::resolve(&table, "deploy").unwrap().name, "deployments");
    }
}
