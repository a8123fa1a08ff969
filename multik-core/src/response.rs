//! Generic api response types
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Kubernetes status object, returned for errors and some delete calls
#[derive(Deserialize, Serialize, Debug, Clone, Error)]
#[error("{message}: {reason}")]
pub struct Status {
    /// Suggested HTTP return code (0 if unset)
    #[serde(default)]
    pub code: u16,

    /// `Success` or `Failure`
    #[serde(default)]
    pub status: String,

    /// A human-readable description of the status of this operation
    #[serde(default)]
    pub message: String,

    /// A machine-readable description of why this operation is in the
    /// `Failure` status
    #[serde(default)]
    pub reason: String,

    /// Extended data associated with the reason
    #[serde(default)]
    pub details: Option<StatusDetails>,
}

impl Status {
    /// Whether the status indicates an expired or gone resource version
    ///
    /// The apiserver reports both as code 410 with reason `Expired` or `Gone`.
    pub fn is_expired(&self) -> bool {
        self.code == 410 || self.reason == "Expired" || self.reason == "Gone"
    }
}

/// Status details object on the [`Status`] object
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StatusDetails {
    /// The name of the resource associated with the status, when there is one
    #[serde(default)]
    pub name: String,

    /// The group of the resource associated with the status
    #[serde(default)]
    pub group: String,

    /// The kind of the resource associated with the status
    #[serde(default)]
    pub kind: String,

    /// Seconds before the operation should be retried, when the server says so
    #[serde(default)]
    pub retry_after_seconds: u32,
}
