//! Polls a get-shaped operation until a field predicate holds.
use std::{sync::Arc, time::Duration};

use multik_core::{object, operation::Operation, Verb};
use serde_json::Value;

use crate::{
    client::Cluster,
    error::{Error, HttpError, TimeoutError},
};

/// How to extract the value under scrutiny from the fetched object.
#[derive(Clone)]
pub enum Find {
    /// A dot- or slash-separated path, e.g. `status.phase`
    Path(String),
    /// A caller function over the whole object
    Fn(Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>),
}

impl Find {
    fn extract(&self, obj: &Value) -> Option<Value> {
        match self {
            Find::Path(path) => object::lookup(obj, path).cloned(),
            Find::Fn(f) => f(obj),
        }
    }
}

impl std::fmt::Debug for Find {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Find::Path(p) => f.debug_tuple("Path").field(p).finish(),
            Find::Fn(_) => f.write_str("Fn"),
        }
    }
}

/// When the extracted value counts as success.
#[derive(Clone)]
pub enum Eval {
    /// Literal equality
    Value(Value),
    /// A caller predicate
    Fn(Arc<dyn Fn(&Value) -> bool + Send + Sync>),
}

impl Eval {
    fn matches(&self, found: &Value) -> bool {
        match self {
            Eval::Value(expected) => found == expected,
            Eval::Fn(f) => f(found),
        }
    }
}

impl std::fmt::Debug for Eval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eval::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Eval::Fn(_) => f.write_str("Fn"),
        }
    }
}

/// Parameters for [`wait`].
#[derive(Clone, Debug)]
pub struct WaitParams {
    /// Where to look in the fetched object
    pub find: Find,
    /// What counts as done
    pub eval: Eval,
    /// Polling interval
    pub interval: Duration,
    /// Overall deadline
    pub timeout: Duration,
}

impl WaitParams {
    /// Wait for the value at `path` to equal `expected`
    pub fn equals(path: &str, expected: Value) -> Self {
        Self {
            find: Find::Path(path.to_string()),
            eval: Eval::Value(expected),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }

    /// Override the polling interval
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Override the deadline
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Poll `op` until the predicate holds, returning the matched value.
///
/// Objects that do not exist yet (404) keep the poll going; other errors
/// surface immediately. The deadline elapsing yields `Timeout.Wait`.
pub async fn wait(cluster: &Arc<Cluster>, op: &Operation, params: &WaitParams) -> Result<Value, Error> {
    if op.verb != Verb::Get {
        return Err(Error::BuildRequest(multik_core::request::Error::Validation(
            "wait requires a get-shaped operation".into(),
        )));
    }

    let poll = async {
        let mut ticker = tokio::time::interval(params.interval);
        loop {
            ticker.tick().await;
            match cluster.run(op).await {
                Ok(res) => {
                    let obj = res.into_json()?;
                    if let Some(found) = params.find.extract(&obj) {
                        if params.eval.matches(&found) {
                            return Ok(found);
                        }
                    }
                }
                Err(Error::Http(HttpError::Status { code: 404, .. })) => {
                    // not created yet; keep polling
                }
                Err(e) => return Err(e),
            }
        }
    };

    match tokio::time::timeout(params.timeout, poll).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(TimeoutError::Wait)),
    }
}
