//! Types for the watch api
//!
//! See <https://kubernetes.io/docs/reference/using-api/api-concepts/#efficient-detection-of-changes>
use std::{fmt::Debug, time::SystemTime};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{object, response::Status};

/// A raw event returned from a watch query
///
/// A watch response delivers many of these as newline separated JSON.
#[derive(Deserialize, Serialize, Clone)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent {
    /// Resource was added
    Added(Value),
    /// Resource was modified
    Modified(Value),
    /// Resource was deleted
    Deleted(Value),
    /// A progress marker carrying only a resource version
    Bookmark(Bookmark),
    /// The server reported a problem with the stream
    Error(Status),
}

impl WatchEvent {
    /// The resource version this event advances the stream to
    pub fn resource_version(&self) -> Option<&str> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                object::resource_version(obj)
            }
            WatchEvent::Bookmark(bm) => Some(&bm.metadata.resource_version),
            WatchEvent::Error(_) => None,
        }
    }
}

impl Debug for WatchEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WatchEvent::Added(_) => write!(f, "Added event"),
            WatchEvent::Modified(_) => write!(f, "Modified event"),
            WatchEvent::Deleted(_) => write!(f, "Deleted event"),
            WatchEvent::Bookmark(_) => write!(f, "Bookmark event"),
            WatchEvent::Error(e) => write!(f, "Error event: {e:?}"),
        }
    }
}

/// Slimmed down object for [`WatchEvent::Bookmark`]
///
/// Bookmarks carry apiVersion + kind + essentially empty metadata.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Bookmark {
    /// Metadata with only a resource version in it
    pub metadata: BookmarkMeta,
}

/// Metadata of a [`Bookmark`]
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkMeta {
    /// The resource version to resume from
    pub resource_version: String,
}

/// Resume state for a watch stream, mutated only by the request runtime.
#[derive(Clone, Debug, Default)]
pub struct WatchCursor {
    resource_version: Option<String>,
    bookmark_support: bool,
    last_event: Option<SystemTime>,
}

impl WatchCursor {
    /// Start a cursor at a known resource version
    pub fn at(resource_version: &str) -> Self {
        Self {
            resource_version: Some(resource_version.to_string()),
            ..Self::default()
        }
    }

    /// The token to resume the stream from
    pub fn resource_version(&self) -> Option<&str> {
        self.resource_version.as_deref()
    }

    /// Whether the server has demonstrated bookmark support on this stream
    pub fn bookmark_support(&self) -> bool {
        self.bookmark_support
    }

    /// When the last frame arrived
    pub fn last_event(&self) -> Option<SystemTime> {
        self.last_event
    }

    /// Advance the cursor from a delivered event
    pub fn advance(&mut self, event: &WatchEvent) {
        if matches!(event, WatchEvent::Bookmark(_)) {
            self.bookmark_support = true;
        }
        if let Some(rv) = event.resource_version() {
            self.resource_version = Some(rv.to_string());
        }
        self.last_event = Some(SystemTime::now());
    }
}
