//! Core types and client-less behavior for [`multik`](https://crates.io/crates/multik).
//!
//! This crate holds everything that can be computed without touching the
//! network: group/version parsing, resource descriptors and identifier
//! resolution, the declarative [`Operation`] value, the path builder that
//! turns an operation into a wire request, watch event types, and helpers
//! for working with untyped resource maps.
#![deny(unsafe_code)]

pub mod gvk;
pub mod object;
pub mod operation;
pub mod params;
pub mod request;
pub mod resolve;
pub mod resource;
pub mod response;
pub mod watch;

#[doc(inline)] pub use gvk::GroupVersion;
#[doc(inline)] pub use operation::{Namespace, Operation, Verb};
#[doc(inline)] pub use params::{Options, PatchKind, PropagationPolicy};
#[doc(inline)] pub use request::{Payload, StreamMode, WireRequest};
#[doc(inline)] pub use resolve::{resolve, resolve_operation};
#[doc(inline)] pub use resource::ResourceDescriptor;
#[doc(inline)] pub use response::Status;
#[doc(inline)] pub use watch::{WatchCursor, WatchEvent};
