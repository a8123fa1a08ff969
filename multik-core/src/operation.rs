//! The declarative operation value callers build and run.
use serde_json::Value;

use crate::{
    params::{Options, PatchKind, PropagationPolicy},
    request::Error,
};

/// The API verb an operation performs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Fetch a single object
    Get,
    /// List a collection
    List,
    /// Create an object
    Create,
    /// Replace an object
    Update,
    /// Patch an object
    Patch,
    /// Delete a single object
    Delete,
    /// Delete a collection
    DeleteCollection,
    /// Stream changes to a collection
    Watch,
    /// Open a streaming session (`exec`, `attach`, `portforward`)
    Connect,
}

impl Verb {
    /// The verb name as the apiserver's discovery data spells it
    ///
    /// `watch` has no own discovery verb distinct from `list` semantics, and
    /// `connect` subresources advertise `get`.
    pub fn discovery_name(&self) -> &'static str {
        match self {
            Self::Get | Self::Connect => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::DeleteCollection => "deletecollection",
            Self::Watch => "watch",
        }
    }

    /// Whether the verb submits a caller-provided body
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::Create | Self::Update | Self::Patch | Self::Delete | Self::DeleteCollection
        )
    }

    /// Whether the verb requires an object name
    pub fn requires_name(&self) -> bool {
        matches!(
            self,
            Self::Get | Self::Update | Self::Patch | Self::Delete | Self::Connect
        )
    }

    /// Whether the verb addresses a whole collection and forbids a name
    pub fn forbids_name(&self) -> bool {
        matches!(self, Self::List | Self::DeleteCollection | Self::Watch)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Get => "get",
            Self::List => "list",
            Self::Create => "create",
            Self::Update => "update",
            Self::Patch => "patch",
            Self::Delete => "delete",
            Self::DeleteCollection => "deleteCollection",
            Self::Watch => "watch",
            Self::Connect => "connect",
        };
        f.write_str(name)
    }
}

/// Namespace selection for namespaced resources
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Namespace {
    /// Address the resource across all namespaces
    All,
    /// Address the resource within one namespace
    Name(String),
}

impl From<&str> for Namespace {
    fn from(name: &str) -> Self {
        Namespace::Name(name.to_string())
    }
}

impl From<String> for Namespace {
    fn from(name: String) -> Self {
        Namespace::Name(name)
    }
}

/// A declarative description of one API call.
///
/// Operations carry everything needed to route and execute a request except
/// the cluster: the verb, the group version, a loose resource identifier
/// (kind, plural, or `plural/subresource`), the target object, selectors,
/// an optional body, and [`Options`].
///
/// ```
/// use multik_core::Operation;
/// let op = Operation::list("apps/v1", "deployment")
///     .within("prod")
///     .labels("app=web");
/// ```
#[derive(Clone, Debug)]
pub struct Operation {
    /// The verb to perform
    pub verb: Verb,
    /// Group version string, e.g. `apps/v1` or `v1`
    pub group_version: String,
    /// Loose resource identifier resolved against discovery data
    pub resource: String,
    /// Subresource suffix, if not already part of `resource`
    pub subresource: Option<String>,
    /// Namespace selection
    pub namespace: Option<Namespace>,
    /// Object name
    pub name: Option<String>,
    /// Request body for modifying verbs, or session parameters for connect
    pub body: Option<Value>,
    /// Label selector in `k=v,k2!=v2` form
    pub label_selector: Option<String>,
    /// Field selector in `k=v` form
    pub field_selector: Option<String>,
    /// Remaining options
    pub options: Options,
}

impl Operation {
    fn new(verb: Verb, group_version: &str, resource: impl Into<String>) -> Self {
        Self {
            verb,
            group_version: group_version.to_string(),
            resource: resource.into(),
            subresource: None,
            namespace: None,
            name: None,
            body: None,
            label_selector: None,
            field_selector: None,
            options: Options::default(),
        }
    }

    /// Fetch a single object
    pub fn get(group_version: &str, resource: impl Into<String>) -> Self {
        Self::new(Verb::Get, group_version, resource)
    }

    /// List a collection
    pub fn list(group_version: &str, resource: impl Into<String>) -> Self {
        Self::new(Verb::List, group_version, resource)
    }

    /// Create the object in `body`
    pub fn create(group_version: &str, resource: impl Into<String>, body: Value) -> Self {
        let mut op = Self::new(Verb::Create, group_version, resource);
        op.body = Some(body);
        op
    }

    /// Replace the named object with `body`
    pub fn update(group_version: &str, resource: impl Into<String>, body: Value) -> Self {
        let mut op = Self::new(Verb::Update, group_version, resource);
        op.body = Some(body);
        op
    }

    /// Patch the named object with `body`, using [`Options::patch_kind`]
    pub fn patch(group_version: &str, resource: impl Into<String>, body: Value) -> Self {
        let mut op = Self::new(Verb::Patch, group_version, resource);
        op.body = Some(body);
        op
    }

    /// Server-side apply of the manifest in `body`
    pub fn apply(
        group_version: &str,
        resource: impl Into<String>,
        body: Value,
        field_manager: &str,
    ) -> Self {
        let mut op = Self::patch(group_version, resource, body);
        op.options.patch_kind = PatchKind::Apply;
        op.options.field_manager = Some(field_manager.to_string());
        op
    }

    /// Delete the named object
    pub fn delete(group_version: &str, resource: impl Into<String>) -> Self {
        Self::new(Verb::Delete, group_version, resource)
    }

    /// Delete every object matching the selectors
    pub fn delete_collection(group_version: &str, resource: impl Into<String>) -> Self {
        Self::new(Verb::DeleteCollection, group_version, resource)
    }

    /// Stream changes to a collection
    pub fn watch(group_version: &str, resource: impl Into<String>) -> Self {
        Self::new(Verb::Watch, group_version, resource)
    }

    /// Open a streaming session against a connect subresource
    pub fn connect(group_version: &str, resource: impl Into<String>, subresource: &str) -> Self {
        let mut op = Self::new(Verb::Connect, group_version, resource);
        op.subresource = Some(subresource.to_string());
        op
    }
}

/// Builder methods
impl Operation {
    /// Target a namespace
    #[must_use]
    pub fn within(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(Namespace::Name(namespace.into()));
        self
    }

    /// Target all namespaces
    #[must_use]
    pub fn in_all_namespaces(mut self) -> Self {
        self.namespace = Some(Namespace::All);
        self
    }

    /// Target a named object
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Address a subresource of the resolved resource
    #[must_use]
    pub fn subresource(mut self, subresource: impl Into<String>) -> Self {
        self.subresource = Some(subresource.into());
        self
    }

    /// Restrict by label selector
    #[must_use]
    pub fn labels(mut self, selector: &str) -> Self {
        self.label_selector = Some(selector.to_string());
        self
    }

    /// Restrict by field selector
    #[must_use]
    pub fn fields(mut self, selector: &str) -> Self {
        self.field_selector = Some(selector.to_string());
        self
    }

    /// Attach a body (modifying verbs) or session parameters (connect)
    #[must_use]
    pub fn data(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Limit list results to a single page of `limit` items
    #[must_use]
    pub fn limit(mut self, limit: u32) -> Self {
        self.options.limit = Some(limit);
        self
    }

    /// Resume a list from a continue token
    #[must_use]
    pub fn continue_token(mut self, token: &str) -> Self {
        self.options.continue_token = Some(token.to_string());
        self
    }

    /// Pin the read or watch to a resource version
    #[must_use]
    pub fn at(mut self, resource_version: &str) -> Self {
        self.options.resource_version = Some(resource_version.to_string());
        self
    }

    /// Set the dependent deletion policy
    #[must_use]
    pub fn propagation_policy(mut self, policy: PropagationPolicy) -> Self {
        self.options.propagation_policy = Some(policy);
        self
    }

    /// Replace the full option set
    #[must_use]
    pub fn options(mut self, options: Options) -> Self {
        self.options = options;
        self
    }

    /// Check the operation's internal invariants.
    ///
    /// Namespace requirements depend on the resolved descriptor and are
    /// checked by the path builder instead.
    pub fn validate(&self) -> Result<(), Error> {
        if self.verb.requires_name() && self.name.is_none() {
            return Err(Error::Validation(format!("{} requires a name", self.verb)));
        }
        if self.verb.forbids_name() && self.name.is_some() {
            return Err(Error::Validation(format!(
                "{} operates on a collection and forbids a name",
                self.verb
            )));
        }
        if self.verb.is_mutating() && !matches!(self.verb, Verb::Delete | Verb::DeleteCollection) {
            if self.body.is_none() {
                return Err(Error::Validation(format!("{} requires a body", self.verb)));
            }
        }
        self.options.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn name_invariants() {
        assert!(Operation::get("v1", "pod").validate().is_err());
        assert!(Operation::get("v1", "pod").named("p1").validate().is_ok());
        assert!(Operation::list("v1", "pod").named("p1").validate().is_err());
        assert!(Operation::delete_collection("v1", "pod")
            .named("p1")
            .validate()
            .is_err());
        assert!(Operation::delete("v1", "pod").named("p1").validate().is_ok());
    }

    #[test]
    fn bodies_required_for_writes() {
        let mut missing = Operation::create("v1", "configmap", json!({}));
        missing.body = None;
        assert!(missing.validate().is_err());

        let ok = Operation::create("v1", "configmap", json!({"data": {}})).within("default");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn apply_sets_patch_options() {
        let op = Operation::apply("apps/v1", "deployment", json!({}), "multik").named("nginx");
        assert_eq!(op.options.patch_kind, PatchKind::Apply);
        assert_eq!(op.options.field_manager.as_deref(), Some("multik"));
        assert!(op.validate().is_ok());
    }
}
