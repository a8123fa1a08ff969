//! Group/version identifiers for dynamic resources.
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failed to parse a group version string
#[derive(Debug, Error)]
#[error("failed to parse group version: {0}")]
pub struct ParseGroupVersionError(pub String);

/// An API surface identifier such as `apps/v1`, or `v1` for the core group.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    /// API group, empty for the core group
    pub group: String,
    /// Version
    pub version: String,
}

impl GroupVersion {
    /// Construct from explicit group and version
    pub fn gv(group: &str, version: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
        }
    }

    /// Whether this is the legacy core (`""`) group
    pub fn is_core(&self) -> bool {
        self.group.is_empty()
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> String {
        if self.is_core() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// The url prefix resources under this group version hang off
    ///
    /// Core group versions live under `/api`, everything else under `/apis`.
    pub fn url_prefix(&self) -> String {
        if self.is_core() {
            format!("/api/{}", self.version)
        } else {
            format!("/apis/{}/{}", self.group, self.version)
        }
    }
}

impl FromStr for GroupVersion {
    type Err = ParseGroupVersionError;

    fn from_str(gv: &str) -> Result<Self, Self::Err> {
        let gvsplit = gv.splitn(2, '/').collect::<Vec<_>>();
        let (group, version) = match *gvsplit.as_slice() {
            [g, v] if !g.is_empty() && !v.is_empty() => (g.to_string(), v.to_string()),
            [v] if !v.is_empty() => ("".to_string(), v.to_string()),
            _ => return Err(ParseGroupVersionError(gv.into())),
        };
        Ok(Self { group, version })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_and_grouped() {
        let core: GroupVersion = "v1".parse().unwrap();
        assert!(core.is_core());
        assert_eq!(core.api_version(), "v1");
        assert_eq!(core.url_prefix(), "/api/v1");

        let apps: GroupVersion = "apps/v1".parse().unwrap();
        assert_eq!(apps.group, "apps");
        assert_eq!(apps.api_version(), "apps/v1");
        assert_eq!(apps.url_prefix(), "/apis/apps/v1");
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<GroupVersion>().is_err());
        assert!("/v1".parse::<GroupVersion>().is_err());
        assert!("apps/".parse::<GroupVersion>().is_err());
    }
}
