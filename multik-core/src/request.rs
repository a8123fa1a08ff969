//! The path builder: turns an operation plus a resolved descriptor into a
//! wire request.
use http::{header, HeaderMap, HeaderValue, Method};
use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    gvk::GroupVersion,
    operation::{Namespace, Operation, Verb},
    resource::ResourceDescriptor,
};

pub(crate) const JSON_MIME: &str = "application/json";

/// Possible errors when building a request
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to build the underlying http request
    #[error("failed to build request: {0}")]
    BuildRequest(#[source] http::Error),
    /// Failed to serialize a body
    #[error("failed to serialize body: {0}")]
    SerializeBody(#[source] serde_json::Error),
    /// The operation violates one of its invariants
    #[error("request validation failed: {0}")]
    Validation(String),
    /// The group version string could not be parsed
    #[error("invalid group version: {0}")]
    InvalidGroupVersion(String),
    /// The descriptor is namespaced but the operation names no namespace
    #[error("resource {0} is namespaced and requires a namespace")]
    MissingNamespace(String),
    /// The descriptor does not advertise the operation's verb
    #[error("verb {0} is not supported by resource {1}")]
    UnsupportedVerb(String, String),
}

/// How the runtime must treat the response
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    /// One request, one response body
    Unary,
    /// A list whose `continue` tokens are followed transparently
    PagedList,
    /// A long-poll stream of newline-delimited watch events
    Watch,
    /// A channeled WebSocket upgrade
    WebSocket,
}

/// The request body before and after encoding
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// No body
    Empty,
    /// A JSON value awaiting serialization by the encode stage
    Json(Value),
    /// Serialized bytes, ready to send
    Bytes(Vec<u8>),
}

impl Payload {
    /// The serialized bytes, empty unless encoding has produced some
    pub fn bytes(&self) -> &[u8] {
        match self {
            Payload::Bytes(b) => b,
            _ => &[],
        }
    }
}

/// A fully routed request, ready for the middleware pipeline.
#[derive(Clone, Debug)]
pub struct WireRequest {
    /// HTTP method
    pub method: Method,
    /// Path and query relative to the cluster base url
    pub uri: String,
    /// Headers determined by routing (content type)
    pub headers: HeaderMap,
    /// The body
    pub payload: Payload,
    /// Whether the verb submits a body
    pub mutating: bool,
    /// Response handling mode
    pub mode: StreamMode,
}

/// Build the wire request for `op` against the descriptor it resolved to.
///
/// This is a pure function: identical inputs produce an identical method,
/// uri, and header set.
pub fn build(op: &Operation, desc: &ResourceDescriptor) -> Result<WireRequest, Error> {
    op.validate()?;
    let gv: GroupVersion = op
        .group_version
        .parse()
        .map_err(|e: crate::gvk::ParseGroupVersionError| Error::InvalidGroupVersion(e.0))?;

    if !desc.supports_verb(op.verb.discovery_name()) {
        return Err(Error::UnsupportedVerb(op.verb.to_string(), desc.name.clone()));
    }

    let path = object_path(op, desc, &gv)?;
    let uri = append_query(op, path)?;

    let mut headers = HeaderMap::new();
    let mutating = op.verb.is_mutating();
    match op.verb {
        Verb::Patch => {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(op.options.patch_kind.content_type()),
            );
        }
        Verb::Create | Verb::Update | Verb::Delete | Verb::DeleteCollection => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_MIME));
        }
        _ => {}
    }

    let payload = match op.verb {
        Verb::Create | Verb::Update | Verb::Patch => {
            Payload::Json(op.body.clone().unwrap_or(Value::Null))
        }
        Verb::Delete | Verb::DeleteCollection => delete_options(op),
        _ => Payload::Empty,
    };

    let mode = match op.verb {
        Verb::Watch => StreamMode::Watch,
        Verb::Connect => StreamMode::WebSocket,
        Verb::List if op.options.limit.is_none() => StreamMode::PagedList,
        _ => StreamMode::Unary,
    };

    let method = match op.verb {
        Verb::Get | Verb::List | Verb::Watch | Verb::Connect => Method::GET,
        Verb::Create => Method::POST,
        Verb::Update => Method::PUT,
        Verb::Patch => Method::PATCH,
        Verb::Delete | Verb::DeleteCollection => Method::DELETE,
    };

    Ok(WireRequest {
        method,
        uri,
        headers,
        payload,
        mutating,
        mode,
    })
}

/// `/apis/{gv}[/namespaces/{ns}]/{plural}[/{name}][/{subresource}]`
fn object_path(op: &Operation, desc: &ResourceDescriptor, gv: &GroupVersion) -> Result<String, Error> {
    let mut path = gv.url_prefix();
    if desc.namespaced {
        match &op.namespace {
            Some(Namespace::Name(ns)) => {
                path.push_str("/namespaces/");
                path.push_str(ns);
            }
            Some(Namespace::All) => {}
            None => return Err(Error::MissingNamespace(desc.name.clone())),
        }
    }
    path.push('/');
    path.push_str(desc.base_name());
    if let Some(name) = &op.name {
        path.push('/');
        path.push_str(name);
    }
    if let Some(suffix) = desc.subresource_suffix() {
        path.push('/');
        path.push_str(suffix);
    }
    Ok(path)
}

fn append_query(op: &Operation, path: String) -> Result<String, Error> {
    let target = format!("{path}?");
    let mut qp = form_urlencoded::Serializer::new(target);
    let opts = &op.options;

    match op.verb {
        Verb::List => {
            populate_selectors(op, &mut qp);
            if let Some(limit) = opts.limit {
                qp.append_pair("limit", &limit.to_string());
            }
            if let Some(token) = &opts.continue_token {
                qp.append_pair("continue", token);
            }
            if let Some(rv) = &opts.resource_version {
                qp.append_pair("resourceVersion", rv);
            }
            if let Some(to) = opts.timeout {
                qp.append_pair("timeoutSeconds", &to.to_string());
            }
        }
        Verb::Watch => {
            qp.append_pair("watch", "true");
            // stay below the 295s apiserver ceiling
            qp.append_pair("timeoutSeconds", &opts.timeout.unwrap_or(290).to_string());
            if opts.bookmarks {
                qp.append_pair("allowWatchBookmarks", "true");
            }
            if opts.send_initial_events {
                qp.append_pair("sendInitialEvents", "true");
            }
            populate_selectors(op, &mut qp);
            if let Some(rv) = &opts.resource_version {
                qp.append_pair("resourceVersion", rv);
            }
        }
        Verb::Get => {
            if let Some(rv) = &opts.resource_version {
                qp.append_pair("resourceVersion", rv);
            }
        }
        Verb::Create | Verb::Update | Verb::Patch => {
            if opts.dry_run {
                qp.append_pair("dryRun", "All");
            }
            if let Some(fm) = &opts.field_manager {
                qp.append_pair("fieldManager", fm);
            }
            if opts.force {
                qp.append_pair("force", "true");
            }
        }
        Verb::Delete => {}
        Verb::DeleteCollection => {
            populate_selectors(op, &mut qp);
        }
        Verb::Connect => {
            // session parameters (command, container, stdin, ...) travel in
            // the query string; arrays repeat the key per element
            if let Some(Value::Object(map)) = &op.body {
                for (k, v) in map {
                    match v {
                        Value::Array(items) => {
                            for item in items {
                                qp.append_pair(k, &scalar_to_string(item));
                            }
                        }
                        other => {
                            qp.append_pair(k, &scalar_to_string(other));
                        }
                    }
                }
            }
        }
    }
    if opts.pretty {
        qp.append_pair("pretty", "true");
    }
    Ok(qp.finish())
}

fn populate_selectors(op: &Operation, qp: &mut form_urlencoded::Serializer<String>) {
    if let Some(labels) = &op.label_selector {
        qp.append_pair("labelSelector", labels);
    }
    if let Some(fields) = &op.field_selector {
        qp.append_pair("fieldSelector", fields);
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// DeleteOptions assembled from the operation's options
fn delete_options(op: &Operation) -> Payload {
    let opts = &op.options;
    if opts.propagation_policy.is_none() && !opts.dry_run {
        // default options serialize to an empty body
        return Payload::Empty;
    }
    let mut body = json!({});
    if let Some(policy) = opts.propagation_policy {
        body["propagationPolicy"] = json!(policy.as_str());
    }
    if opts.dry_run {
        body["dryRun"] = json!(["All"]);
    }
    Payload::Json(body)
}
