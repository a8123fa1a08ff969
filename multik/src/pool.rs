//! Bounded pools of persistent transports, one pool per apiserver
//! authority.
//!
//! A transport is loaned to exactly one request at a time. Checkout waits
//! FIFO behind a semaphore when the pool is at capacity; checkin returns
//! the transport to the idle set unless it was marked broken, in which
//! case it is discarded and the slot freed for a fresh connection.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use hyper::client::HttpConnector;
use hyper_timeout::TimeoutConnector;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tower::{util::BoxService, BoxError, Service, ServiceExt};

use crate::{
    config::Connection,
    error::{Error, TimeoutError, TransportError},
    tls,
};

/// A type-erased transport service
pub type HttpService = BoxService<http::Request<hyper::Body>, http::Response<hyper::Body>, BoxError>;

/// Produces a transport for one cluster connection.
///
/// The default implementation builds a TLS-capable hyper client; tests and
/// embedders can substitute their own.
pub trait Connect: Send + Sync + 'static {
    /// Open a new transport to the connection's endpoint
    fn connect(&self, conn: &Connection) -> Result<HttpService, Error>;
}

/// The default [`Connect`]: hyper over rustls with connect/read timeouts.
pub struct HyperConnector;

impl Connect for HyperConnector {
    fn connect(&self, conn: &Connection) -> Result<HttpService, Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let tls = tls::client_config(conn).map_err(Error::Auth)?;
        let https = hyper_rustls::HttpsConnector::from((http, Arc::new(tls)));

        let mut connector = TimeoutConnector::new(https);
        connector.set_connect_timeout(conn.timeout);
        connector.set_read_timeout(conn.timeout);

        let client: hyper::Client<_, hyper::Body> = hyper::Client::builder().build(connector);
        Ok(BoxService::new(client.map_err(BoxError::from)))
    }
}

/// Pool sizing knobs
#[derive(Clone, Debug)]
pub struct PoolSettings {
    /// Maximum transports per authority
    pub size: usize,
    /// Idle transports older than this are reaped at checkout
    pub idle_timeout: Duration,
    /// How long a checkout may wait for a free slot
    pub checkout_deadline: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            size: 10,
            idle_timeout: Duration::from_secs(90),
            checkout_deadline: Duration::from_secs(30),
        }
    }
}

/// Per-cluster transport pools, created lazily per authority.
pub struct Pool {
    settings: PoolSettings,
    connector: Arc<dyn Connect>,
    hosts: parking_lot::Mutex<HashMap<String, Arc<HostPool>>>,
}

struct HostPool {
    permits: Arc<Semaphore>,
    idle: parking_lot::Mutex<VecDeque<IdleTransport>>,
    closed: AtomicBool,
}

struct IdleTransport {
    svc: HttpService,
    since: Instant,
}

/// An exclusive loan of one transport.
///
/// Dropping the loan is the checkin: healthy transports return to the idle
/// set, broken ones are discarded. Either way the capacity slot is freed.
pub struct Loan {
    svc: Option<HttpService>,
    host: Arc<HostPool>,
    broken: bool,
    // released on drop, freeing the slot
    _permit: OwnedSemaphorePermit,
}

impl Loan {
    /// Dispatch one request on the loaned transport.
    ///
    /// The loan is considered broken from the moment a request is in
    /// flight until the caller declares the exchange finished with
    /// [`Loan::mark_healthy`]; a loan dropped mid-exchange is discarded
    /// rather than returned with unread state on the wire.
    pub(crate) async fn call(
        &mut self,
        req: http::Request<hyper::Body>,
    ) -> Result<http::Response<hyper::Body>, Error> {
        self.broken = true;
        let svc = self.svc.as_mut().expect("loan holds a transport until dropped");
        match svc.ready().await {
            Ok(svc) => match svc.call(req).await {
                Ok(res) => Ok(res),
                Err(e) => Err(Error::Transport(TransportError::classify(e))),
            },
            Err(e) => Err(Error::Transport(TransportError::classify(e))),
        }
    }

    /// Declare the exchange complete; checkin returns the transport to
    /// the idle set.
    pub(crate) fn mark_healthy(&mut self) {
        self.broken = false;
    }

    /// Flag the transport so checkin discards it
    pub(crate) fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for Loan {
    fn drop(&mut self) {
        if let Some(svc) = self.svc.take() {
            if !self.broken && !self.host.closed.load(Ordering::Acquire) {
                self.host.idle.lock().push_back(IdleTransport {
                    svc,
                    since: Instant::now(),
                });
            }
        }
    }
}

impl Pool {
    pub(crate) fn new(settings: PoolSettings, connector: Arc<dyn Connect>) -> Self {
        Self {
            settings,
            connector,
            hosts: parking_lot::Mutex::new(HashMap::new()),
        }
    }

    /// Borrow a transport for the connection's authority, waiting FIFO when
    /// the pool is at capacity.
    pub(crate) async fn checkout(&self, conn: &Connection) -> Result<Loan, Error> {
        let host = {
            let mut hosts = self.hosts.lock();
            hosts
                .entry(conn.authority())
                .or_insert_with(|| {
                    Arc::new(HostPool {
                        permits: Arc::new(Semaphore::new(self.settings.size)),
                        idle: parking_lot::Mutex::new(VecDeque::new()),
                        closed: AtomicBool::new(false),
                    })
                })
                .clone()
        };

        let permit = tokio::time::timeout(
            self.settings.checkout_deadline,
            host.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| Error::Timeout(TimeoutError::Deadline))?
        .map_err(|_| Error::Timeout(TimeoutError::Deadline))?;

        let reused = {
            let mut idle = host.idle.lock();
            // oldest first: reap everything past the idle timeout
            while idle
                .front()
                .map(|t| t.since.elapsed() > self.settings.idle_timeout)
                .unwrap_or(false)
            {
                idle.pop_front();
            }
            idle.pop_back().map(|t| t.svc)
        };

        let svc = match reused {
            Some(svc) => svc,
            None => self.connector.connect(conn)?,
        };

        Ok(Loan {
            svc: Some(svc),
            host,
            broken: false,
            _permit: permit,
        })
    }

    /// Return a loaned transport; equivalent to dropping it.
    pub(crate) fn checkin(&self, loan: Loan) {
        drop(loan);
    }

    /// Discard all idle transports and refuse future checkins.
    pub(crate) fn close(&self) {
        let hosts = self.hosts.lock();
        for host in hosts.values() {
            host.closed.store(true, Ordering::Release);
            host.idle.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingConnect {
        connects: AtomicUsize,
    }

    impl Connect for Arc<CountingConnect> {
        fn connect(&self, _conn: &Connection) -> Result<HttpService, Error> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let svc = tower::service_fn(|_req: http::Request<hyper::Body>| async {
                Ok::<_, BoxError>(http::Response::new(hyper::Body::empty()))
            });
            Ok(BoxService::new(svc))
        }
    }

    fn test_conn() -> Connection {
        Connection::new("https://example:6443".parse().unwrap())
    }

    fn counting_pool(size: usize, checkout_deadline: Duration) -> (Pool, Arc<CountingConnect>) {
        let counter = Arc::new(CountingConnect {
            connects: AtomicUsize::new(0),
        });
        let pool = Pool::new(
            PoolSettings {
                size,
                idle_timeout: Duration::from_secs(90),
                checkout_deadline,
            },
            Arc::new(counter.clone()),
        );
        (pool, counter)
    }

    #[tokio::test]
    async fn checkin_enables_reuse() {
        let (pool, counter) = counting_pool(2, Duration::from_secs(1));
        let conn = test_conn();

        let loan = pool.checkout(&conn).await.unwrap();
        pool.checkin(loan);
        let loan = pool.checkout(&conn).await.unwrap();
        pool.checkin(loan);

        assert_eq!(counter.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_transports_are_discarded() {
        let (pool, counter) = counting_pool(2, Duration::from_secs(1));
        let conn = test_conn();

        let mut loan = pool.checkout(&conn).await.unwrap();
        loan.mark_broken();
        pool.checkin(loan);
        let loan = pool.checkout(&conn).await.unwrap();
        pool.checkin(loan);

        assert_eq!(counter.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capacity_is_enforced() {
        let (pool, counter) = counting_pool(2, Duration::from_millis(50));
        let conn = test_conn();

        let a = pool.checkout(&conn).await.unwrap();
        let b = pool.checkout(&conn).await.unwrap();
        // at capacity: the third checkout times out on its deadline
        let denied = pool.checkout(&conn).await;
        assert!(matches!(denied, Err(Error::Timeout(TimeoutError::Deadline))));

        drop(a);
        let c = pool.checkout(&conn).await.unwrap();
        pool.checkin(c);
        pool.checkin(b);

        // never more live transports than the cap
        assert!(counter.connects.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn closed_pools_drop_checkins() {
        let (pool, counter) = counting_pool(2, Duration::from_secs(1));
        let conn = test_conn();

        let loan = pool.checkout(&conn).await.unwrap();
        pool.close();
        pool.checkin(loan);
        let _loan = pool.checkout(&conn).await.unwrap();

        assert_eq!(counter.connects.load(Ordering::SeqCst), 2);
    }
}
