//! Discovery drivers: where the resource tables come from.
use async_trait::async_trait;
use multik_core::resource::ResourceDescriptor;
use serde_json::Value;

use crate::error::{DiscoveryError, Error};

/// The slice of the request runtime discovery needs: authenticated GETs
/// returning decoded JSON.
#[async_trait]
pub trait DiscoveryApi: Send + Sync {
    /// Perform a GET against a raw apiserver path
    async fn get_json(&self, path: &str) -> Result<Value, Error>;
}

/// A source of group versions and their resource tables.
///
/// Both drivers implement the same contract; configuration selects which
/// one a registry binds.
#[async_trait]
pub trait DiscoveryDriver: Send + Sync {
    /// Every group version the cluster serves
    async fn versions(&self, api: &dyn DiscoveryApi) -> Result<Vec<String>, Error>;

    /// The resource table for one group version
    async fn resources(
        &self,
        gv: &str,
        api: &dyn DiscoveryApi,
    ) -> Result<Vec<ResourceDescriptor>, Error>;
}

/// Queries `/api` and `/apis` on the live apiserver.
pub struct HttpDriver;

#[async_trait]
impl DiscoveryDriver for HttpDriver {
    async fn versions(&self, api: &dyn DiscoveryApi) -> Result<Vec<String>, Error> {
        let mut versions = Vec::new();

        let core = api.get_json("/api").await?;
        for v in core
            .get("versions")
            .and_then(Value::as_array)
            .ok_or_else(|| DiscoveryError::MalformedVersionList("/api".into()))?
        {
            if let Some(v) = v.as_str() {
                versions.push(v.to_string());
            }
        }

        let groups = api.get_json("/apis").await?;
        for group in groups
            .get("groups")
            .and_then(Value::as_array)
            .ok_or_else(|| DiscoveryError::MalformedVersionList("/apis".into()))?
        {
            for version in group.get("versions").and_then(Value::as_array).into_iter().flatten() {
                if let Some(gv) = version.get("groupVersion").and_then(Value::as_str) {
                    versions.push(gv.to_string());
                }
            }
        }
        Ok(versions)
    }

    async fn resources(
        &self,
        gv: &str,
        api: &dyn DiscoveryApi,
    ) -> Result<Vec<ResourceDescriptor>, Error> {
        let path = if gv.contains('/') {
            format!("/apis/{gv}")
        } else {
            format!("/api/{gv}")
        };
        let list = api.get_json(&path).await?;
        parse_resource_list(&list, gv)
    }
}

pub(crate) fn parse_resource_list(
    list: &Value,
    gv: &str,
) -> Result<Vec<ResourceDescriptor>, Error> {
    let raw = list
        .get("resources")
        .ok_or_else(|| DiscoveryError::MalformedResourceList(gv.into()))?;
    serde_json::from_value(raw.clone())
        .map_err(|_| DiscoveryError::MalformedResourceList(gv.into()).into())
}

/// Reads discovery fixtures from a directory; used by tests and offline
/// tooling.
///
/// Layout: `versions.json` holds an array of group version strings, and
/// each group version has a `{gv with '/' replaced by '_'}.json` file with
/// a `resources` array.
pub struct FileDriver {
    dir: std::path::PathBuf,
}

impl FileDriver {
    /// A driver reading from `dir`
    pub fn new(dir: impl Into<std::path::PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_json(&self, file: &str) -> Result<Value, Error> {
        let raw = crate::config::utils::read_file(self.dir.join(file)).map_err(Error::Config)?;
        serde_json::from_slice(&raw).map_err(|e| crate::error::HttpError::Decode(e).into())
    }
}

#[async_trait]
impl DiscoveryDriver for FileDriver {
    async fn versions(&self, _api: &dyn DiscoveryApi) -> Result<Vec<String>, Error> {
        let raw = self.read_json("versions.json")?;
        serde_json::from_value(raw)
            .map_err(|_| DiscoveryError::MalformedVersionList("versions.json".into()).into())
    }

    async fn resources(
        &self,
        gv: &str,
        _api: &dyn DiscoveryApi,
    ) -> Result<Vec<ResourceDescriptor>, Error> {
        let list = self.read_json(&format!("{}.json", gv.replace('/', "_")))?;
        parse_resource_list(&list, gv)
    }
}
