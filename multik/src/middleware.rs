//! Per-cluster request/response transform stacks.
//!
//! Middlewares are pure, synchronous functions of their input. Anything
//! that may block (credential refresh) is resolved by the runtime before
//! the pipeline runs and handed in as prepared header material. The stacks
//! are copy-on-write: readers clone an `Arc` snapshot and never block
//! writers.
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, StatusCode};
use multik_core::request::{Payload, WireRequest};
use parking_lot::RwLock;

use crate::{config::Connection, error::Error};

const DEFAULT_USER_AGENT: &str = concat!("multik/", env!("CARGO_PKG_VERSION"));

/// A routed request travelling through the request stack.
#[derive(Clone, Debug)]
pub struct PendingRequest {
    /// The request being assembled
    pub wire: WireRequest,
    /// Credential headers prepared by the auth chain, consumed by
    /// [`Initialize`]
    pub auth: HeaderMap,
}

/// A unary response travelling through the response stack.
#[derive(Clone, Debug)]
pub struct WireResponse {
    /// Response status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// The full response body
    pub body: Bytes,
}

/// A request transform
pub trait RequestMiddleware: Send + Sync {
    /// Name shown in stack listings
    fn name(&self) -> &str;
    /// Transform the request or short-circuit the operation
    fn call(&self, req: PendingRequest) -> Result<PendingRequest, Error>;
}

/// A response transform
pub trait ResponseMiddleware: Send + Sync {
    /// Name shown in stack listings
    fn name(&self) -> &str;
    /// Transform the response or short-circuit the operation
    fn call(&self, res: WireResponse) -> Result<WireResponse, Error>;
}

/// Which of the two stacks an operation addresses
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    /// The request stack
    Request,
    /// The response stack
    Response,
}

/// The ordered middleware stacks for one cluster.
pub struct MiddlewareStack {
    request: RwLock<Arc<Vec<Arc<dyn RequestMiddleware>>>>,
    response: RwLock<Arc<Vec<Arc<dyn ResponseMiddleware>>>>,
}

impl MiddlewareStack {
    /// The default stack: [`Initialize`] then [`EncodeBody`]
    pub fn standard(conn: Arc<Connection>) -> Self {
        Self {
            request: RwLock::new(Arc::new(vec![
                Arc::new(Initialize { conn }) as Arc<dyn RequestMiddleware>,
                Arc::new(EncodeBody),
            ])),
            response: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Names of the middlewares in a stage, in application order
    pub fn list(&self, stage: Stage) -> Vec<String> {
        match stage {
            Stage::Request => self.request.read().iter().map(|m| m.name().to_string()).collect(),
            Stage::Response => self.response.read().iter().map(|m| m.name().to_string()).collect(),
        }
    }

    /// Append a request middleware
    pub fn add_request(&self, mw: Arc<dyn RequestMiddleware>) {
        let mut guard = self.request.write();
        let mut next = guard.as_ref().clone();
        next.push(mw);
        *guard = Arc::new(next);
    }

    /// Replace the request stack wholesale
    pub fn set_request(&self, mws: Vec<Arc<dyn RequestMiddleware>>) {
        *self.request.write() = Arc::new(mws);
    }

    /// Append a response middleware
    pub fn add_response(&self, mw: Arc<dyn ResponseMiddleware>) {
        let mut guard = self.response.write();
        let mut next = guard.as_ref().clone();
        next.push(mw);
        *guard = Arc::new(next);
    }

    /// Replace the response stack wholesale
    pub fn set_response(&self, mws: Vec<Arc<dyn ResponseMiddleware>>) {
        *self.response.write() = Arc::new(mws);
    }

    /// Run the request stack; errors short-circuit with the middleware's kind
    pub(crate) fn apply_request(&self, mut req: PendingRequest) -> Result<WireRequest, Error> {
        let snapshot = self.request.read().clone();
        for mw in snapshot.iter() {
            req = mw.call(req)?;
        }
        Ok(req.wire)
    }

    /// Run the response stack
    pub(crate) fn apply_response(&self, mut res: WireResponse) -> Result<WireResponse, Error> {
        let snapshot = self.response.read().clone();
        for mw in snapshot.iter() {
            res = mw.call(res)?;
        }
        Ok(res)
    }
}

/// Injects prepared auth headers, the JSON accept header, and a user agent.
pub struct Initialize {
    conn: Arc<Connection>,
}

impl RequestMiddleware for Initialize {
    fn name(&self) -> &str {
        "initialize"
    }

    fn call(&self, mut req: PendingRequest) -> Result<PendingRequest, Error> {
        let auth = std::mem::take(&mut req.auth);
        for (name, value) in auth {
            if let Some(name) = name {
                req.wire.headers.insert(name, value);
            }
        }
        if !req.wire.headers.contains_key(header::ACCEPT) {
            req.wire
                .headers
                .insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        }
        if !req.wire.headers.contains_key(header::USER_AGENT) {
            let agent = self
                .conn
                .user_agent
                .as_deref()
                .unwrap_or(DEFAULT_USER_AGENT);
            let value = HeaderValue::try_from(agent).map_err(|e| Error::Middleware {
                name: self.name().into(),
                message: format!("invalid user agent: {e}"),
            })?;
            req.wire.headers.insert(header::USER_AGENT, value);
        }
        Ok(req)
    }
}

/// Serializes JSON bodies for modifying verbs and clears everything else.
pub struct EncodeBody;

impl RequestMiddleware for EncodeBody {
    fn name(&self) -> &str {
        "encode-body"
    }

    fn call(&self, mut req: PendingRequest) -> Result<PendingRequest, Error> {
        req.wire.payload = match (req.wire.mutating, std::mem::replace(&mut req.wire.payload, Payload::Empty)) {
            (true, Payload::Json(value)) => {
                let bytes = serde_json::to_vec(&value).map_err(|e| Error::Middleware {
                    name: self.name().into(),
                    message: format!("failed to serialize body: {e}"),
                })?;
                Payload::Bytes(bytes)
            }
            (true, other) => other,
            // non-modifying verbs never submit a body
            (false, _) => Payload::Empty,
        };
        Ok(req)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use multik_core::request::StreamMode;
    use serde_json::json;

    fn wire(method: Method, mutating: bool, payload: Payload) -> WireRequest {
        WireRequest {
            method,
            uri: "/api/v1/namespaces/ns/configmaps?".into(),
            headers: HeaderMap::new(),
            payload,
            mutating,
            mode: StreamMode::Unary,
        }
    }

    fn stack() -> MiddlewareStack {
        let conn = Arc::new(Connection::new("https://example:6443".parse().unwrap()));
        MiddlewareStack::standard(conn)
    }

    #[test]
    fn default_stack_order() {
        let stack = stack();
        assert_eq!(stack.list(Stage::Request), vec!["initialize", "encode-body"]);
        assert!(stack.list(Stage::Response).is_empty());
    }

    #[test]
    fn encode_body_serializes_for_modifying_verbs() {
        let stack = stack();
        let body = json!({"hello": "world"});
        let req = PendingRequest {
            wire: wire(Method::PUT, true, Payload::Json(body)),
            auth: HeaderMap::new(),
        };
        let wire = stack.apply_request(req).unwrap();
        assert_eq!(wire.payload.bytes(), br#"{"hello":"world"}"#);
    }

    #[test]
    fn encode_body_clears_for_non_modifying_verbs() {
        let stack = stack();
        let req = PendingRequest {
            wire: wire(Method::GET, false, Payload::Json(json!({"hello": "world"}))),
            auth: HeaderMap::new(),
        };
        let wire = stack.apply_request(req).unwrap();
        assert_eq!(wire.payload, Payload::Empty);
        assert!(wire.payload.bytes().is_empty());
    }

    #[test]
    fn initialize_injects_headers() {
        let stack = stack();
        let mut auth = HeaderMap::new();
        auth.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        let req = PendingRequest {
            wire: wire(Method::GET, false, Payload::Empty),
            auth,
        };
        let wire = stack.apply_request(req).unwrap();
        assert_eq!(wire.headers[header::AUTHORIZATION], "Bearer t");
        assert_eq!(wire.headers[header::ACCEPT], "application/json");
        assert!(wire.headers.contains_key(header::USER_AGENT));
    }

    #[test]
    fn stacks_are_runtime_mutable() {
        struct Tag;
        impl RequestMiddleware for Tag {
            fn name(&self) -> &str {
                "tag"
            }
            fn call(&self, mut req: PendingRequest) -> Result<PendingRequest, Error> {
                req.wire
                    .headers
                    .insert("x-tag", HeaderValue::from_static("yes"));
                Ok(req)
            }
        }

        let stack = stack();
        stack.add_request(Arc::new(Tag));
        assert_eq!(
            stack.list(Stage::Request),
            vec!["initialize", "encode-body", "tag"]
        );

        let req = PendingRequest {
            wire: wire(Method::GET, false, Payload::Empty),
            auth: HeaderMap::new(),
        };
        let wire = stack.apply_request(req).unwrap();
        assert_eq!(wire.headers["x-tag"], "yes");

        stack.set_request(vec![]);
        assert!(stack.list(Stage::Request).is_empty());
    }

    #[test]
    fn middleware_errors_short_circuit() {
        struct Reject;
        impl ResponseMiddleware for Reject {
            fn name(&self) -> &str {
                "reject"
            }
            fn call(&self, _res: WireResponse) -> Result<WireResponse, Error> {
                Err(Error::Middleware {
                    name: "reject".into(),
                    message: "nope".into(),
                })
            }
        }

        let stack = stack();
        stack.add_response(Arc::new(Reject));
        let res = WireResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        assert!(matches!(
            stack.apply_response(res),
            Err(Error::Middleware { .. })
        ));
    }
}
