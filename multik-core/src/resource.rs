//! Descriptors for discovered API resources.
use serde::{Deserialize, Serialize};

/// One entry of a discovered resource list for a group version.
///
/// Subresources appear as separate descriptors whose `name` contains a `/`
/// (e.g. `deployments/status`), mirroring how the apiserver reports them.
/// Within a group version, `name` is unique.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    /// Singular PascalCase kind (e.g. `Deployment`)
    pub kind: String,
    /// Resource name, i.e. the plural path segment (e.g. `deployments`),
    /// or `{plural}/{subresource}` for subresources
    pub name: String,
    /// Whether instances live inside a namespace
    #[serde(default)]
    pub namespaced: bool,
    /// Verbs the apiserver supports on this resource
    #[serde(default)]
    pub verbs: Vec<String>,
    /// Short names such as `deploy`
    #[serde(default, rename = "shortNames")]
    pub short_names: Vec<String>,
}

impl ResourceDescriptor {
    /// Whether this descriptor addresses a subresource
    pub fn is_subresource(&self) -> bool {
        self.name.contains('/')
    }

    /// The plural path segment, without any subresource suffix
    pub fn base_name(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }

    /// The portion after the `/` for subresource descriptors
    pub fn subresource_suffix(&self) -> Option<&str> {
        self.name.split_once('/').map(|(_, suffix)| suffix)
    }

    /// Checks that the given discovery verb is supported on this resource
    pub fn supports_verb(&self, verb: &str) -> bool {
        self.verbs.iter().any(|v| v == verb)
    }
}

/// Discovery verb names as the apiserver reports them
pub mod verbs {
    /// Create a resource
    pub const CREATE: &str = "create";
    /// Get a single resource
    pub const GET: &str = "get";
    /// List objects
    pub const LIST: &str = "list";
    /// Watch for object changes
    pub const WATCH: &str = "watch";
    /// Delete a single object
    pub const DELETE: &str = "delete";
    /// Delete multiple objects at once
    pub const DELETE_COLLECTION: &str = "deletecollection";
    /// Update an object
    pub const UPDATE: &str = "update";
    /// Patch an object
    pub const PATCH: &str = "patch";
}
