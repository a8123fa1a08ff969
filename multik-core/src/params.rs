//! The closed option set accepted by operations.
use crate::request::Error;

/// Content type selection for patch operations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchKind {
    /// `application/strategic-merge-patch+json` (native resources only)
    StrategicMerge,
    /// `application/merge-patch+json` (RFC 7386)
    Merge,
    /// `application/json-patch+json` (RFC 6902)
    Json,
    /// `application/apply-patch+yaml` (server-side apply)
    Apply,
}

impl PatchKind {
    /// The `Content-Type` header value for this patch flavour
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::StrategicMerge => "application/strategic-merge-patch+json",
            Self::Merge => "application/merge-patch+json",
            Self::Json => "application/json-patch+json",
            Self::Apply => "application/apply-patch+yaml",
        }
    }
}

impl Default for PatchKind {
    fn default() -> Self {
        Self::StrategicMerge
    }
}

/// Whether and how the garbage collector deletes dependents
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagationPolicy {
    /// Orphan the dependents
    Orphan,
    /// Let the garbage collector delete dependents in the background
    Background,
    /// The object remains until its dependents are deleted
    Foreground,
}

impl PropagationPolicy {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Orphan => "Orphan",
            Self::Background => "Background",
            Self::Foreground => "Foreground",
        }
    }
}

/// Options applied to an [`Operation`](crate::operation::Operation).
///
/// This is a closed set; each field only affects the verbs it is meaningful
/// for and is ignored otherwise.
#[derive(Clone, Debug)]
pub struct Options {
    /// Limit the number of list results, disabling transparent pagination
    pub limit: Option<u32>,
    /// Continue token for fetching a subsequent list page
    pub continue_token: Option<String>,
    /// Resource version to read or watch from
    pub resource_version: Option<String>,
    /// Server-side timeout for list/watch calls, capped below 295s
    pub timeout: Option<u32>,
    /// Enables watch events with type `BOOKMARK`
    pub bookmarks: bool,
    /// Dependent deletion policy for delete verbs
    pub propagation_policy: Option<PropagationPolicy>,
    /// Submit the request without persisting it
    pub dry_run: bool,
    /// Name of the field manager for modifying verbs
    pub field_manager: Option<String>,
    /// Force ownership transfer on apply conflicts
    pub force: bool,
    /// Ask the server to stream the initial state as synthetic events
    pub send_initial_events: bool,
    /// Pretty-print the response body
    pub pretty: bool,
    /// Patch flavour used by the patch verb
    pub patch_kind: PatchKind,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            limit: None,
            continue_token: None,
            resource_version: None,
            timeout: None,
            // stable since 1.17 and backwards compatible
            bookmarks: true,
            propagation_policy: None,
            dry_run: false,
            field_manager: None,
            force: false,
            send_initial_events: false,
            pretty: false,
            patch_kind: PatchKind::default(),
        }
    }
}

impl Options {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if let Some(to) = &self.timeout {
            // https://github.com/kubernetes/kubernetes/issues/6513
            if *to >= 295 {
                return Err(Error::Validation("timeout must be < 295s".into()));
            }
        }
        if let Some(fm) = &self.field_manager {
            if fm.len() > 128 {
                return Err(Error::Validation("field_manager must be <= 128 chars".into()));
            }
        }
        if self.force && self.patch_kind != PatchKind::Apply {
            return Err(Error::Validation(
                "force is incompatible with non-apply patches".into(),
            ));
        }
        if self.patch_kind == PatchKind::Apply && self.field_manager.is_none() {
            return Err(Error::Validation(
                "apply patches require a field_manager".into(),
            ));
        }
        Ok(())
    }
}
