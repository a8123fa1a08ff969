//! multik — a discovery-driven, multi-cluster Kubernetes client.
//!
//! multik keeps resources as untyped [`serde_json::Value`] maps and routes
//! operations dynamically: a declarative [`Operation`] names a verb, a
//! group version, and a loose resource identifier; per-cluster discovery
//! data resolves it to a concrete request at run time. Any resource the
//! cluster serves — built-in or custom — works without generated bindings.
//!
//! # Example
//!
//! ```no_run
//! use multik::{Operation, Registry, Connection, ConnectOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), multik::Error> {
//!     let registry = Registry::new();
//!     let conn = Connection::from_kubeconfig("~/.kube/config", &ConnectOptions::default())?;
//!     registry.register("dev", conn);
//!
//!     // list deployments in prod, transparently following pagination
//!     let op = Operation::list("apps/v1", "deployment").within("prod");
//!     let res = registry.run(&op, "dev").await?;
//!     for item in multik_core::object::items(res.json().unwrap()).into_iter().flatten() {
//!         println!("{}", multik_core::object::name(item).unwrap_or("?"));
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Streaming surfaces: [`Registry::stream`] returns a lazy event stream,
//! [`Registry::watch`] pumps events into a channel, and
//! [`Registry::connect`] opens channeled `exec`/`attach` sessions.
#![deny(unsafe_code)]

pub mod auth;
pub mod batch;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod middleware;
pub mod pool;
pub mod registry;
mod tls;
pub mod wait;

pub use multik_core as core;

#[doc(inline)] pub use crate::client::{ApiResponse, Cluster, OpContext, RemoteSession, ResponseBody, WatchMessage};
#[doc(inline)] pub use crate::config::{ConnectOptions, Connection, Kubeconfig};
#[doc(inline)] pub use crate::error::Error;
#[doc(inline)] pub use crate::registry::{Registry, RegistryBuilder, Settings};
#[doc(inline)] pub use crate::wait::WaitParams;
#[doc(inline)] pub use multik_core::{Namespace, Operation, Verb, WatchEvent};

/// Convenient alias for `Result<T, multik::Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
