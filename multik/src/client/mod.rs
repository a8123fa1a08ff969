//! The request runtime: dispatches resolved operations over pooled
//! transports and manages unary, paged-list, watch, and websocket state.
pub(crate) mod remote;
pub(crate) mod upgrade;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use futures::{stream::BoxStream, Stream, StreamExt, TryStreamExt};
use http::{header, HeaderMap, StatusCode};
use multik_core::{
    operation::{Namespace, Operation},
    request::{self, Payload, StreamMode, WireRequest},
    resource::ResourceDescriptor,
    resolve::resolve_operation,
    response::Status,
    watch::{WatchCursor, WatchEvent},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::protocol::Role, WebSocketStream};
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    io::StreamReader,
    sync::CancellationToken,
};

use crate::{
    auth::AuthChain,
    config::Connection,
    discovery::{DiscoveryApi, DiscoveryCache, DiscoveryDriver},
    error::{Error, HttpError, NotFoundError, TimeoutError, TransportError, UpgradeError},
    middleware::{MiddlewareStack, PendingRequest, WireResponse},
    pool::{Connect, Loan, Pool, PoolSettings},
};

pub use remote::{Inbound, Outbound, RemoteSession};

/// Deadline and cancellation for one operation.
#[derive(Clone, Debug, Default)]
pub struct OpContext {
    /// Abort with `Timeout.Deadline` once elapsed
    pub deadline: Option<Duration>,
    /// Abort with `Cancelled` when triggered
    pub cancel: Option<CancellationToken>,
}

/// A decoded unary response.
#[derive(Debug)]
pub struct ApiResponse {
    /// HTTP status
    pub status: StatusCode,
    /// Response headers
    pub headers: HeaderMap,
    /// Decoded JSON, or raw bytes for non-JSON content
    pub body: ResponseBody,
}

/// The decoded body of an [`ApiResponse`]
#[derive(Debug)]
pub enum ResponseBody {
    /// The body parsed as JSON
    Json(Value),
    /// The body as delivered
    Raw(Bytes),
}

impl ApiResponse {
    /// The body as JSON, when it decoded as such
    pub fn json(&self) -> Option<&Value> {
        match &self.body {
            ResponseBody::Json(v) => Some(v),
            ResponseBody::Raw(_) => None,
        }
    }

    /// Consume into JSON, decoding raw bodies on demand
    pub fn into_json(self) -> Result<Value, Error> {
        match self.body {
            ResponseBody::Json(v) => Ok(v),
            ResponseBody::Raw(b) => serde_json::from_slice(&b).map_err(|e| HttpError::Decode(e).into()),
        }
    }
}

/// Messages a watch pump delivers to its sink.
#[derive(Debug)]
pub enum WatchMessage {
    /// A decoded watch event
    Event(WatchEvent),
    /// A stream error; fatal ones are followed by `Done`
    Error(Error),
    /// The stream is over
    Done,
}

/// One registered cluster: connection, discovery, pool, and middleware.
///
/// Handles are cheap to share; every operation entry point lives here.
pub struct Cluster {
    name: String,
    conn: Arc<Connection>,
    auth: AuthChain,
    discovery: DiscoveryCache,
    driver: Arc<dyn DiscoveryDriver>,
    pool: Pool,
    pool_size: usize,
    middleware: MiddlewareStack,
    shutdown: CancellationToken,
}

impl Cluster {
    pub(crate) fn new(
        name: impl Into<String>,
        conn: Connection,
        auth: AuthChain,
        driver: Arc<dyn DiscoveryDriver>,
        connector: Arc<dyn Connect>,
        pool_settings: PoolSettings,
    ) -> Arc<Self> {
        let conn = Arc::new(conn);
        Arc::new(Self {
            name: name.into(),
            conn: conn.clone(),
            auth,
            discovery: DiscoveryCache::default(),
            driver,
            pool_size: pool_settings.size,
            pool: Pool::new(pool_settings, connector),
            middleware: MiddlewareStack::standard(conn),
            shutdown: CancellationToken::new(),
        })
    }

    /// The cluster's registered name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The cluster's connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// The cluster's middleware stacks
    pub fn middleware(&self) -> &MiddlewareStack {
        &self.middleware
    }

    /// The cluster's discovery cache
    pub fn discovery(&self) -> &DiscoveryCache {
        &self.discovery
    }

    pub(crate) fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Cancel outstanding streams and drop pooled transports.
    pub(crate) fn close(&self) {
        self.shutdown.cancel();
        self.pool.close();
    }

    /// Rebuild the discovery cache; concurrent calls coalesce.
    pub async fn run_discovery(&self) -> Result<(), Error> {
        self.discovery.run(self.driver.as_ref(), self).await
    }

    /// Execute a non-streaming operation.
    pub async fn run(&self, op: &Operation) -> Result<ApiResponse, Error> {
        self.run_with(op, &OpContext::default()).await
    }

    /// Execute a non-streaming operation under a deadline/cancellation.
    pub async fn run_with(&self, op: &Operation, ctx: &OpContext) -> Result<ApiResponse, Error> {
        self.with_context(ctx, async {
            let wire = self.prepare(op).await?;
            match wire.mode {
                StreamMode::Unary => self.unary(wire).await,
                StreamMode::PagedList => self.paged_list(op, wire).await,
                StreamMode::Watch | StreamMode::WebSocket => Err(Error::BuildRequest(
                    request::Error::Validation(
                        "streaming verbs must use stream, watch, or connect".into(),
                    ),
                )),
            }
        })
        .await
    }

    /// The apiserver's version information.
    pub async fn apiserver_version(&self) -> Result<Value, Error> {
        self.raw_get_json("/version").await
    }

    async fn with_context<T>(
        &self,
        ctx: &OpContext,
        fut: impl std::future::Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        let work = async {
            match ctx.deadline {
                Some(deadline) => tokio::time::timeout(deadline, fut)
                    .await
                    .map_err(|_| Error::Timeout(TimeoutError::Deadline))?,
                None => fut.await,
            }
        };
        match &ctx.cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Err(Error::Cancelled),
                    _ = self.shutdown.cancelled() => Err(Error::Cancelled),
                    res = work => res,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => Err(Error::Cancelled),
                    res = work => res,
                }
            }
        }
    }

    /// Resolve the operation's descriptor, running discovery lazily.
    async fn resolve_descriptor(&self, op: &Operation) -> Result<ResourceDescriptor, Error> {
        let snapshot = self.discovery.snapshot();
        if let Some(table) = snapshot.resources.get(&op.group_version) {
            if let Some(desc) = resolve_operation(table, op) {
                return Ok(desc.clone());
            }
        }
        if self.discovery.is_empty() || !snapshot.resources.contains_key(&op.group_version) {
            self.run_discovery().await?;
            let snapshot = self.discovery.snapshot();
            if let Some(table) = snapshot.resources.get(&op.group_version) {
                if let Some(desc) = resolve_operation(table, op) {
                    return Ok(desc.clone());
                }
            }
        }
        Err(NotFoundError::UnknownResource {
            id: op.resource.clone(),
            group_version: op.group_version.clone(),
        }
        .into())
    }

    /// Resolve, route, authenticate, and run the request middleware stack.
    async fn prepare(&self, op: &Operation) -> Result<WireRequest, Error> {
        let desc = self.resolve_descriptor(op).await?;
        let mut op = op.clone();
        if desc.namespaced && op.namespace.is_none() {
            op.namespace = Some(Namespace::Name(self.conn.default_namespace.clone()));
        }
        let wire = request::build(&op, &desc)?;
        let credential = self.auth.credentials(&self.conn).await?;
        self.middleware.apply_request(PendingRequest {
            wire,
            auth: credential.headers,
        })
    }

    fn finalize(&self, wire: &WireRequest) -> Result<http::Request<hyper::Body>, Error> {
        let uri = join_uri(&self.conn.cluster_url, &wire.uri)?;
        let mut builder = http::Request::builder().method(wire.method.clone()).uri(uri);
        if let Some(headers) = builder.headers_mut() {
            *headers = wire.headers.clone();
        }
        builder
            .body(hyper::Body::from(wire.payload.bytes().to_vec()))
            .map_err(|e| Error::BuildRequest(request::Error::BuildRequest(e)))
    }

    /// Dispatch one request and return the streaming response plus the loan
    /// keeping its transport exclusive.
    async fn send(&self, wire: &WireRequest) -> Result<(http::Response<hyper::Body>, Loan), Error> {
        let req = self.finalize(wire)?;
        let mut loan = self.pool.checkout(&self.conn).await?;
        let res = loan.call(req).await?;
        Ok((res, loan))
    }

    async fn unary(&self, wire: WireRequest) -> Result<ApiResponse, Error> {
        let (res, mut loan) = self.send(&wire).await?;
        let status = res.status();
        let headers = res.headers().clone();
        let body = match hyper::body::to_bytes(res.into_body()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.pool.checkin(loan);
                return Err(Error::Transport(TransportError::classify(e.into())));
            }
        };
        loan.mark_healthy();
        self.pool.checkin(loan);

        let wres = self.middleware.apply_response(WireResponse {
            status,
            headers,
            body,
        })?;
        decode_response(wres)
    }

    /// Transparent `continue` following for lists without a caller limit.
    ///
    /// Aggregates `items` across pages and keeps the first page's metadata
    /// with `continue` stripped. The first error aborts the follow and is
    /// returned alongside the items gathered so far.
    async fn paged_list(&self, op: &Operation, first: WireRequest) -> Result<ApiResponse, Error> {
        let res = self.unary(first).await?;
        let status = res.status;
        let headers = res.headers.clone();
        let mut result = res.into_json()?;

        let mut items = match result.get_mut("items").map(Value::take) {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        };

        let mut token = continue_token(&result);
        while let Some(current) = token {
            let next_op = op.clone().continue_token(&current);
            let page = async {
                let wire = self.prepare(&next_op).await?;
                self.unary(wire).await?.into_json()
            }
            .await;
            let mut page = match page {
                Ok(page) => page,
                Err(source) => {
                    return Err(Error::PartialList {
                        items,
                        source: Box::new(source),
                    })
                }
            };
            if let Some(Value::Array(mut more)) = page.get_mut("items").map(Value::take) {
                items.append(&mut more);
            }
            token = continue_token(&page);
        }

        result["items"] = Value::Array(items);
        if let Some(meta) = result.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.remove("continue");
        }
        Ok(ApiResponse {
            status,
            headers,
            body: ResponseBody::Json(result),
        })
    }

    /// A lazy, restartable stream of watch events.
    ///
    /// The stream reconnects from its cursor on non-fatal transport errors
    /// with jittered exponential backoff; fatal errors (auth failures,
    /// missing list endpoints, expired cursors) are yielded and end the
    /// stream. Events arrive in server order.
    pub fn events(self: &Arc<Self>, op: &Operation) -> impl Stream<Item = Result<WatchEvent, Error>> + Send + 'static {
        let mut op = op.clone();
        op.verb = multik_core::Verb::Watch;
        let cursor = match &op.options.resource_version {
            Some(rv) => WatchCursor::at(rv),
            None => WatchCursor::default(),
        };
        let fsm = WatchFsm {
            cluster: self.clone(),
            op,
            cursor,
            backoff: watch_backoff(),
            state: WatchState::Connecting,
        };
        futures::stream::unfold(fsm, |mut fsm| async move {
            loop {
                match fsm.step().await {
                    StepOutcome::Yield(item) => return Some((item, fsm)),
                    StepOutcome::Continue => {}
                    StepOutcome::End => return None,
                }
            }
        })
    }

    /// Pump watch events into a caller-supplied sink.
    ///
    /// The pump lives as long as the sink's receiver: when the caller goes
    /// away the send fails and the stream is torn down. A final
    /// [`WatchMessage::Done`] is always delivered if the receiver survives.
    pub fn watch_with_sink(
        self: &Arc<Self>,
        op: &Operation,
        sink: mpsc::Sender<WatchMessage>,
    ) -> tokio::task::JoinHandle<()> {
        let stream = self.events(op);
        tokio::spawn(async move {
            futures::pin_mut!(stream);
            while let Some(item) = stream.next().await {
                let message = match item {
                    Ok(event) => WatchMessage::Event(event),
                    Err(error) => WatchMessage::Error(error),
                };
                if sink.send(message).await.is_err() {
                    return;
                }
            }
            let _ = sink.send(WatchMessage::Done).await;
        })
    }

    /// Open a channeled streaming session (`exec`, `attach`, `portforward`).
    ///
    /// Demultiplexed frames are delivered to `sink`; the returned session
    /// writes stdin/resize frames and controls the stream's lifetime.
    pub async fn connect(
        self: &Arc<Self>,
        op: &Operation,
        sink: mpsc::Sender<Inbound>,
    ) -> Result<RemoteSession, Error> {
        let mut wire = self.prepare(op).await?;
        if wire.mode != StreamMode::WebSocket {
            return Err(Error::BuildRequest(request::Error::Validation(
                "connect requires a connect operation".into(),
            )));
        }
        let key = upgrade::sec_websocket_key();
        upgrade::apply_headers(&mut wire.headers, &key);

        let (res, mut loan) = self.send(&wire).await?;
        upgrade::verify_response(&res, &key)?;
        let upgraded = hyper::upgrade::on(res)
            .await
            .map_err(|e| Error::Upgrade(UpgradeError::GetPendingUpgrade(e)))?;
        let ws = WebSocketStream::from_raw_socket(upgraded, Role::Client, None).await;
        // the upgrade consumed the connection; it never returns to the pool
        loan.mark_broken();

        let (out_tx, out_rx) = mpsc::channel(16);
        let cancel = self.shutdown.child_token();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let _loan = loan;
            remote::channel_loop(ws, out_rx, sink, task_cancel).await;
        });
        Ok(RemoteSession::new(out_tx, cancel, task))
    }

    /// Raw authenticated GET returning decoded JSON; discovery runs on this.
    async fn raw_get_json(&self, path: &str) -> Result<Value, Error> {
        let wire = WireRequest {
            method: http::Method::GET,
            uri: path.to_string(),
            headers: HeaderMap::new(),
            payload: Payload::Empty,
            mutating: false,
            mode: StreamMode::Unary,
        };
        let credential = self.auth.credentials(&self.conn).await?;
        let wire = self.middleware.apply_request(PendingRequest {
            wire,
            auth: credential.headers,
        })?;
        self.unary(wire).await?.into_json()
    }
}

#[async_trait]
impl DiscoveryApi for Cluster {
    async fn get_json(&self, path: &str) -> Result<Value, Error> {
        self.raw_get_json(path).await
    }
}

fn continue_token(page: &Value) -> Option<String> {
    page.pointer("/metadata/continue")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn decode_response(res: WireResponse) -> Result<ApiResponse, Error> {
    if !res.status.is_success() {
        let status = serde_json::from_slice::<Status>(&res.body).ok();
        if status.is_none() {
            tracing::debug!(code = res.status.as_u16(), "non-status error body from apiserver");
        }
        return Err(HttpError::Status {
            code: res.status.as_u16(),
            status,
        }
        .into());
    }

    let is_json = res
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains("json"))
        .unwrap_or(false);
    let body = if res.body.is_empty() || !is_json {
        ResponseBody::Raw(res.body)
    } else {
        ResponseBody::Json(serde_json::from_slice(&res.body).map_err(HttpError::Decode)?)
    };
    Ok(ApiResponse {
        status: res.status,
        headers: res.headers,
        body,
    })
}

fn join_uri(base: &http::Uri, path_and_query: &str) -> Result<http::Uri, Error> {
    let build_err =
        |e: http::Error| Error::BuildRequest(request::Error::BuildRequest(e));
    let prefix = base.path().trim_end_matches('/');
    let mut parts = http::uri::Parts::default();
    parts.scheme = base.scheme().cloned();
    parts.authority = base.authority().cloned();
    parts.path_and_query = Some(
        format!("{prefix}{path_and_query}")
            .parse()
            .map_err(|e: http::uri::InvalidUri| build_err(e.into()))?,
    );
    http::Uri::from_parts(parts).map_err(|e| build_err(e.into()))
}

fn watch_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(30),
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

type FrameStream = BoxStream<'static, Result<String, LinesCodecError>>;

enum WatchState {
    Connecting,
    Streaming { frames: FrameStream, loan: Loan },
    Terminated,
}

enum StepOutcome {
    Yield(Result<WatchEvent, Error>),
    Continue,
    End,
}

struct WatchFsm {
    cluster: Arc<Cluster>,
    op: Operation,
    cursor: WatchCursor,
    backoff: ExponentialBackoff,
    state: WatchState,
}

impl WatchFsm {
    async fn step(&mut self) -> StepOutcome {
        if self.cluster.shutdown.is_cancelled() {
            self.state = WatchState::Terminated;
            return StepOutcome::End;
        }
        match std::mem::replace(&mut self.state, WatchState::Terminated) {
            WatchState::Connecting => match self.connect().await {
                Ok((frames, loan)) => {
                    self.backoff.reset();
                    self.state = WatchState::Streaming { frames, loan };
                    StepOutcome::Continue
                }
                Err(error) if error.is_retryable() => {
                    let delay = self
                        .backoff
                        .next_backoff()
                        .unwrap_or_else(|| Duration::from_secs(30));
                    tracing::warn!(%error, ?delay, "watch connect failed, retrying");
                    self.state = WatchState::Connecting;
                    tokio::select! {
                        _ = self.cluster.shutdown.cancelled() => StepOutcome::End,
                        _ = tokio::time::sleep(delay) => StepOutcome::Continue,
                    }
                }
                Err(error) => StepOutcome::Yield(Err(error)),
            },
            WatchState::Streaming { mut frames, mut loan } => {
                let frame = tokio::select! {
                    biased;
                    _ = self.cluster.shutdown.cancelled() => return StepOutcome::End,
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(line)) => {
                        self.state = WatchState::Streaming { frames, loan };
                        self.decode_line(&line)
                    }
                    Some(Err(LinesCodecError::Io(e)))
                        if matches!(
                            e.kind(),
                            std::io::ErrorKind::TimedOut | std::io::ErrorKind::UnexpectedEof
                        ) =>
                    {
                        // routine long-poll expiry; resume from the cursor
                        tracing::trace!("watch poll ended: {e}");
                        self.state = WatchState::Connecting;
                        StepOutcome::Continue
                    }
                    Some(Err(LinesCodecError::Io(e))) => {
                        tracing::warn!(error = %e, "watch stream failed, reconnecting");
                        self.state = WatchState::Connecting;
                        let delay = self
                            .backoff
                            .next_backoff()
                            .unwrap_or_else(|| Duration::from_secs(30));
                        tokio::select! {
                            _ = self.cluster.shutdown.cancelled() => StepOutcome::End,
                            _ = tokio::time::sleep(delay) => StepOutcome::Continue,
                        }
                    }
                    Some(Err(e @ LinesCodecError::MaxLineLengthExceeded)) => {
                        self.state = WatchState::Connecting;
                        StepOutcome::Yield(Err(Error::Transport(TransportError::classify(e.into()))))
                    }
                    None => {
                        // server closed cleanly; the transport is reusable
                        loan.mark_healthy();
                        self.state = WatchState::Connecting;
                        StepOutcome::Continue
                    }
                }
            }
            WatchState::Terminated => StepOutcome::End,
        }
    }

    fn decode_line(&mut self, line: &str) -> StepOutcome {
        match serde_json::from_str::<WatchEvent>(line) {
            Ok(WatchEvent::Error(status)) => {
                if status.is_expired() {
                    // the caller restarts from a fresh list
                    self.state = WatchState::Terminated;
                    StepOutcome::Yield(Err(HttpError::Status {
                        code: 410,
                        status: Some(status),
                    }
                    .into()))
                } else {
                    StepOutcome::Yield(Err(HttpError::Status {
                        code: status.code,
                        status: Some(status),
                    }
                    .into()))
                }
            }
            Ok(event) => {
                self.cursor.advance(&event);
                StepOutcome::Yield(Ok(event))
            }
            Err(e) if e.is_eof() => StepOutcome::Continue,
            Err(e) => {
                // servers sometimes emit a bare Status instead of an event
                let status = serde_json::from_str::<Value>(line)
                    .ok()
                    .filter(|v| v["kind"] == "Status")
                    .and_then(|v| serde_json::from_value::<Status>(v).ok());
                match status {
                    Some(status) => StepOutcome::Yield(Err(HttpError::Status {
                        code: status.code,
                        status: Some(status),
                    }
                    .into())),
                    None => StepOutcome::Yield(Err(HttpError::Decode(e).into())),
                }
            }
        }
    }

    async fn connect(&mut self) -> Result<(FrameStream, Loan), Error> {
        let mut op = self.op.clone();
        if let Some(rv) = self.cursor.resource_version() {
            op.options.resource_version = Some(rv.to_string());
        }
        let wire = self.cluster.prepare(&op).await?;
        let (res, mut loan) = self.cluster.send(&wire).await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = hyper::body::to_bytes(res.into_body()).await.unwrap_or_default();
            loan.mark_healthy();
            self.cluster.pool.checkin(loan);
            return Err(HttpError::Status {
                code: status.as_u16(),
                status: serde_json::from_slice(&body).ok(),
            }
            .into());
        }
        let reader = StreamReader::new(res.into_body().map_err(|e| {
            if e.is_timeout() {
                return std::io::Error::new(std::io::ErrorKind::TimedOut, e);
            }
            // chunked decoder EOF after long polls; tolerated and resumed
            if e.to_string().contains("unexpected EOF during chunk") {
                return std::io::Error::new(std::io::ErrorKind::UnexpectedEof, e);
            }
            std::io::Error::new(std::io::ErrorKind::Other, e)
        }));
        let frames = FramedRead::new(reader, LinesCodec::new()).boxed();
        Ok((frames, loan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth::AuthChain,
        discovery::FileDriver,
        pool::{Connect, HttpService, PoolSettings},
    };
    use http::Request;
    use hyper::Body;
    use serde_json::json;
    use tower::{util::BoxService, BoxError, ServiceExt as _};
    use tower_test::mock::{self, Handle};

    struct MockConnect(std::sync::Mutex<Option<HttpService>>);

    impl Connect for MockConnect {
        fn connect(&self, _conn: &Connection) -> Result<HttpService, Error> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .take()
                .expect("runtime asked for a second transport"))
        }
    }

    fn fixtures() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("versions.json"), json!(["v1"]).to_string()).unwrap();
        std::fs::write(
            dir.path().join("v1.json"),
            json!({"resources": [
                {"name": "pods", "kind": "Pod", "namespaced": true,
                 "verbs": ["create", "delete", "get", "list", "watch"], "shortNames": ["po"]}
            ]})
            .to_string(),
        )
        .unwrap();
        dir
    }

    fn mock_cluster(
        pool_size: usize,
    ) -> (
        Arc<Cluster>,
        Handle<Request<Body>, http::Response<Body>>,
        tempfile::TempDir,
    ) {
        let (svc, handle) = mock::pair::<Request<Body>, http::Response<Body>>();
        let svc = BoxService::new(svc.map_err(BoxError::from));
        let dir = fixtures();
        let conn = Connection::new("https://cluster.example:6443".parse().unwrap());
        let cluster = Cluster::new(
            "test",
            conn,
            AuthChain::standard(vec![]),
            Arc::new(FileDriver::new(dir.path())),
            Arc::new(MockConnect(std::sync::Mutex::new(Some(svc)))),
            PoolSettings {
                size: pool_size,
                ..PoolSettings::default()
            },
        );
        (cluster, handle, dir)
    }

    fn json_response(code: u16, body: serde_json::Value) -> http::Response<Body> {
        http::Response::builder()
            .status(code)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn added(rv: u32) -> String {
        json!({"type": "ADDED", "object": {"kind": "Pod",
               "metadata": {"name": "p", "resourceVersion": rv.to_string()}}})
        .to_string()
    }

    #[tokio::test]
    async fn unary_get_decodes_json() {
        let (cluster, mut handle, _dir) = mock_cluster(2);
        let server = tokio::spawn(async move {
            let (req, send) = handle.next_request().await.expect("request");
            assert_eq!(req.method(), http::Method::GET);
            assert_eq!(req.uri().path(), "/api/v1/namespaces/default/pods/p1");
            assert_eq!(req.headers()[header::ACCEPT], "application/json");
            assert!(req.headers().contains_key(header::USER_AGENT));
            send.send_response(json_response(
                200,
                json!({"kind": "Pod", "metadata": {"name": "p1"}}),
            ));
        });

        let res = cluster.run(&Operation::get("v1", "pod").named("p1")).await.unwrap();
        assert_eq!(res.status, 200);
        assert_eq!(res.json().unwrap()["metadata"]["name"], "p1");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn create_sends_encoded_body() {
        let (cluster, mut handle, _dir) = mock_cluster(2);
        let server = tokio::spawn(async move {
            let (req, send) = handle.next_request().await.expect("request");
            assert_eq!(req.method(), http::Method::POST);
            assert_eq!(req.headers()[header::CONTENT_TYPE], "application/json");
            let body = hyper::body::to_bytes(req.into_body()).await.unwrap();
            let sent: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(sent["metadata"]["name"], "p1");
            send.send_response(json_response(201, sent));
        });

        let op = Operation::create("v1", "pod", json!({"metadata": {"name": "p1"}}));
        let res = cluster.run(&op).await.unwrap();
        assert_eq!(res.status, 201);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn non_2xx_surfaces_the_status_object() {
        let (cluster, mut handle, _dir) = mock_cluster(2);
        let server = tokio::spawn(async move {
            let (_req, send) = handle.next_request().await.expect("request");
            send.send_response(json_response(
                404,
                json!({"kind": "Status", "status": "Failure", "reason": "NotFound",
                       "message": "pods \"nope\" not found", "code": 404}),
            ));
        });

        let err = cluster
            .run(&Operation::get("v1", "pod").named("nope"))
            .await
            .unwrap_err();
        match err {
            Error::Http(HttpError::Status { code, status }) => {
                assert_eq!(code, 404);
                assert_eq!(status.unwrap().reason, "NotFound");
            }
            other => panic!("unexpected error {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn list_follows_continue_tokens() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            let pages = [
                (
                    "",
                    json!({"kind": "PodList",
                           "metadata": {"resourceVersion": "10", "continue": "c1"},
                           "items": [{"n": 1}, {"n": 2}]}),
                ),
                (
                    "c1",
                    json!({"kind": "PodList", "metadata": {"continue": "c2"},
                           "items": [{"n": 3}]}),
                ),
                (
                    "c2",
                    json!({"kind": "PodList", "metadata": {"continue": ""},
                           "items": [{"n": 4}]}),
                ),
            ];
            for (expected_token, page) in pages {
                let (req, send) = handle.next_request().await.expect("page request");
                assert_eq!(req.uri().path(), "/api/v1/namespaces/default/pods");
                let query = req.uri().query().unwrap_or("").to_string();
                if expected_token.is_empty() {
                    assert!(!query.contains("continue="), "query was {query}");
                } else {
                    assert!(query.contains(&format!("continue={expected_token}")));
                }
                send.send_response(json_response(200, page));
            }
        });

        let res = cluster.run(&Operation::list("v1", "pod")).await.unwrap();
        let body = res.into_json().unwrap();
        let ns: Vec<i64> = body["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v["n"].as_i64().unwrap())
            .collect();
        assert_eq!(ns, vec![1, 2, 3, 4]);
        // first page metadata survives with the continue token stripped
        assert_eq!(body["metadata"]["resourceVersion"], "10");
        assert!(body["metadata"].get("continue").is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn explicit_limit_disables_follow() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            let (req, send) = handle.next_request().await.expect("request");
            assert!(req.uri().query().unwrap().contains("limit=2"));
            send.send_response(json_response(
                200,
                json!({"kind": "PodList", "metadata": {"continue": "more"},
                       "items": [{"n": 1}, {"n": 2}]}),
            ));
        });

        let res = cluster
            .run(&Operation::list("v1", "pod").limit(2))
            .await
            .unwrap();
        let body = res.into_json().unwrap();
        assert_eq!(body["items"].as_array().unwrap().len(), 2);
        // the caller owns pagination; the token is passed through untouched
        assert_eq!(body["metadata"]["continue"], "more");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn batch_preserves_order_through_partial_failure() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            for _ in 0..3 {
                let (req, send) = handle.next_request().await.expect("request");
                if req.uri().path().ends_with("/broken") {
                    send.send_response(json_response(
                        404,
                        json!({"kind": "Status", "reason": "NotFound", "code": 404}),
                    ));
                } else {
                    send.send_response(json_response(200, json!({"kind": "Pod"})));
                }
            }
        });

        let ops = vec![
            Operation::get("v1", "pod").named("a"),
            Operation::get("v1", "pod").named("broken"),
            Operation::get("v1", "pod").named("c"),
        ];
        let results =
            crate::batch::run_many(&cluster, ops, &crate::batch::BatchOptions::default()).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(
            results[1],
            Err(Error::Http(HttpError::Status { code: 404, .. }))
        ));
        assert!(results[2].is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn batch_cancellation_marks_unfinished_children() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        drop(handle);

        let ops = vec![
            Operation::get("v1", "pod").named("a"),
            Operation::get("v1", "pod").named("b"),
        ];
        let opts = crate::batch::BatchOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let results = crate::batch::run_many(&cluster, ops, &opts).await;
        assert_eq!(results.len(), 2);
        for result in results {
            assert!(matches!(result, Err(Error::Cancelled)));
        }
    }

    #[tokio::test]
    async fn watch_reconnects_from_the_cursor() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            let (req, send) = handle.next_request().await.expect("watch request");
            let query = req.uri().query().unwrap().to_string();
            assert!(query.contains("watch=true"));
            assert!(query.contains("allowWatchBookmarks=true"));
            assert!(!query.contains("resourceVersion"), "query was {query}");
            let (mut tx, body) = Body::channel();
            send.send_response(
                http::Response::builder()
                    .status(200)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            );
            tx.send_data(format!("{}\n{}\n", added(100), added(101)).into())
                .await
                .unwrap();
            // server closes; the runtime must resume from rv=101
            drop(tx);

            let (req, send) = handle.next_request().await.expect("reconnect");
            assert!(req.uri().query().unwrap().contains("resourceVersion=101"));
            let (mut tx, body) = Body::channel();
            send.send_response(
                http::Response::builder()
                    .status(200)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            );
            tx.send_data(format!("{}\n", added(102)).into()).await.unwrap();
            // hold the stream open until the client has seen enough
            std::future::pending::<()>().await;
        });

        let op = Operation::watch("v1", "pod");
        let events: Vec<_> = cluster.events(&op).take(3).collect().await;
        let versions: Vec<_> = events
            .iter()
            .map(|e| e.as_ref().unwrap().resource_version().unwrap().to_string())
            .collect();
        assert_eq!(versions, vec!["100", "101", "102"]);
        server.abort();
    }

    #[tokio::test]
    async fn watch_surfaces_expired_cursors() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            let (_req, send) = handle.next_request().await.expect("watch request");
            let (mut tx, body) = Body::channel();
            send.send_response(
                http::Response::builder()
                    .status(200)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            );
            let frame = json!({"type": "ERROR",
                               "object": {"kind": "Status", "code": 410, "reason": "Expired",
                                          "message": "too old resource version"}});
            tx.send_data(format!("{frame}\n").into()).await.unwrap();
            std::future::pending::<()>().await;
        });

        let op = Operation::watch("v1", "pod").at("1");
        let events: Vec<_> = cluster.events(&op).collect().await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            Err(Error::Http(HttpError::Status { code: 410, .. }))
        ));
        server.abort();
    }

    #[tokio::test]
    async fn watch_sink_delivers_done_on_teardown() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            let (_req, send) = handle.next_request().await.expect("watch request");
            let (mut tx, body) = Body::channel();
            send.send_response(
                http::Response::builder()
                    .status(200)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(body)
                    .unwrap(),
            );
            tx.send_data(format!("{}\n", added(7)).into()).await.unwrap();
            std::future::pending::<()>().await;
        });

        let (sink, mut rx) = mpsc::channel(8);
        let pump = cluster.watch_with_sink(&Operation::watch("v1", "pod"), sink);

        match rx.recv().await {
            Some(WatchMessage::Event(ev)) => assert_eq!(ev.resource_version(), Some("7")),
            other => panic!("unexpected message {other:?}"),
        }

        // cluster teardown cancels the stream and flushes a final Done
        cluster.close();
        let mut saw_done = false;
        while let Some(message) = rx.recv().await {
            if matches!(message, WatchMessage::Done) {
                saw_done = true;
            }
        }
        assert!(saw_done);
        pump.await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn unknown_resources_are_routing_errors() {
        let (cluster, _handle, _dir) = mock_cluster(1);
        let err = cluster
            .run(&Operation::get("v1", "gadget").named("g"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound(NotFoundError::UnknownResource { .. })
        ));
    }

    #[tokio::test]
    async fn unsupported_verbs_are_refused() {
        let (cluster, _handle, _dir) = mock_cluster(1);
        // pods fixture advertises no patch verb
        let err = cluster
            .run(&Operation::patch("v1", "pod", json!({})).named("p"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound(NotFoundError::UnsupportedVerb { .. })
        ));
    }

    #[tokio::test]
    async fn wait_polls_until_the_predicate_holds() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            let phases = ["Pending", "Pending", "Running"];
            for phase in phases {
                let (_req, send) = handle.next_request().await.expect("poll");
                send.send_response(json_response(
                    200,
                    json!({"kind": "Pod", "status": {"phase": phase}}),
                ));
            }
        });

        let op = Operation::get("v1", "pod").named("p1");
        let params = crate::wait::WaitParams::equals("status.phase", json!("Running"))
            .interval(Duration::from_millis(10))
            .timeout(Duration::from_secs(5));
        let found = crate::wait::wait(&cluster, &op, &params).await.unwrap();
        assert_eq!(found, json!("Running"));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn wait_deadline_yields_wait_timeout() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        let server = tokio::spawn(async move {
            loop {
                let Some((_req, send)) = handle.next_request().await else { break };
                send.send_response(json_response(
                    200,
                    json!({"kind": "Pod", "status": {"phase": "Pending"}}),
                ));
            }
        });

        let op = Operation::get("v1", "pod").named("p1");
        let params = crate::wait::WaitParams::equals("status.phase", json!("Running"))
            .interval(Duration::from_millis(5))
            .timeout(Duration::from_millis(40));
        let err = crate::wait::wait(&cluster, &op, &params).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutError::Wait)));
        server.abort();
    }

    #[tokio::test]
    async fn operation_deadline_yields_deadline_timeout() {
        let (cluster, mut handle, _dir) = mock_cluster(1);
        // never respond
        let server = tokio::spawn(async move {
            let _pinned = handle.next_request().await;
            std::future::pending::<()>().await;
        });

        let ctx = OpContext {
            deadline: Some(Duration::from_millis(30)),
            cancel: None,
        };
        let err = cluster
            .run_with(&Operation::get("v1", "pod").named("p1"), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(TimeoutError::Deadline)));
        server.abort();
    }
}
