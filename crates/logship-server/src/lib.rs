//! Multi-address HTTP server lifecycle.
//!
//! Wraps a user-supplied `axum` router with a shutdown gate and an in-flight
//! request counter, serves it on every configured address (optionally behind
//! TLS), and drains gracefully within a bounded shutdown window:
//!
//! 1. [`Server::init`] binds the listeners and returns the serve future.
//! 2. Requests pass the gate, which rejects with `503` + `Connection: close`
//!    once shutdown begins, and otherwise counts the request in-flight.
//! 3. [`Server::shutdown`] closes the listeners, then polls the counter with
//!    jittered exponential backoff until it reaches zero or the shutdown
//!    timeout fires.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::{
    future::Future,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use hyper::{body::Incoming, service::service_fn};
use hyper_util::{
    rt::{TokioExecutor, TokioIo, TokioTimer},
    server::conn::auto,
};
use rand::Rng;
use tokio_rustls::TlsAcceptor;
use tokio_util::{either::Either, sync::CancellationToken};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod error;
mod listener;

pub use error::{Result, ServerError};

use listener::MultiListener;

/// Default window for graceful shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Default limit on reading a request's header section; also bounds how long
/// an idle keep-alive connection waits for its next request.
pub const DEFAULT_READ_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Default maximum HTTP header size in bytes.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 1 << 20;

/// Ceiling for the shutdown poll interval.
const SHUTDOWN_POLL_INTERVAL_MAX: Duration = Duration::from_millis(500);

/// Shared request-gate state: shutdown flag plus in-flight counter.
#[derive(Debug, Default)]
struct GateState {
    in_shutdown: AtomicU32,
    request_count: AtomicI64,
}

/// Decrements the in-flight counter on every exit path, including dropped
/// request futures.
struct RequestGuard {
    state: Arc<GateState>,
}

impl RequestGuard {
    fn enter(state: &Arc<GateState>) -> Self {
        state.request_count.fetch_add(1, Ordering::SeqCst);
        Self { state: Arc::clone(state) }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.state.request_count.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Rejects requests once shutdown began; counts everything else in-flight
/// while the inner handler runs.
async fn shutdown_gate(State(state): State<Arc<GateState>>, req: Request, next: Next) -> Response {
    if state.in_shutdown.load(Ordering::SeqCst) != 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONNECTION, "close")],
            ServerError::Closed.to_string(),
        )
            .into_response();
    }

    let _guard = RequestGuard::enter(&state);
    next.run(req).await
}

/// Stamps every response with an `x-request-id` for cross-service tracing.
async fn inject_request_id(mut req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;
    if let Ok(value) = request_id.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// HTTP server listening on multiple addresses with graceful shutdown.
///
/// Configure with the `use_*` builders, then [`init`](Server::init) once and
/// drive the returned serve future; [`shutdown`](Server::shutdown) tears the
/// server down.
pub struct Server {
    addrs: Vec<SocketAddr>,
    handler: Router,
    tls: Option<Arc<rustls::ServerConfig>>,
    shutdown_timeout: Duration,
    read_header_timeout: Duration,
    max_header_bytes: usize,

    state: Arc<GateState>,
    shutdown_token: Mutex<Option<CancellationToken>>,
    local_addrs: Mutex<Vec<SocketAddr>>,
}

impl Server {
    /// Creates a server for the given listen addresses with default timeouts
    /// and a handler that answers 404 until [`use_handler`](Self::use_handler)
    /// replaces it.
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self {
            addrs,
            handler: Router::new(),
            tls: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            read_header_timeout: DEFAULT_READ_HEADER_TIMEOUT,
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            state: Arc::new(GateState::default()),
            shutdown_token: Mutex::new(None),
            local_addrs: Mutex::new(Vec::new()),
        }
    }

    /// Sets the request handler.
    #[must_use]
    pub fn use_handler(mut self, handler: Router) -> Self {
        self.handler = handler;
        self
    }

    /// Serves every address behind TLS with the given configuration.
    #[must_use]
    pub fn use_tls_config(mut self, config: Arc<rustls::ServerConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    /// Overrides the graceful shutdown window.
    #[must_use]
    pub fn use_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Overrides the header read timeout.
    #[must_use]
    pub fn use_read_header_timeout(mut self, timeout: Duration) -> Self {
        self.read_header_timeout = timeout;
        self
    }

    /// Overrides the maximum header size.
    #[must_use]
    pub fn use_max_header_bytes(mut self, bytes: usize) -> Self {
        self.max_header_bytes = bytes;
        self
    }

    /// Number of requests currently in flight.
    pub fn request_count(&self) -> i64 {
        self.state.request_count.load(Ordering::SeqCst)
    }

    /// Addresses actually bound by [`init`](Self::init), with ephemeral ports
    /// resolved.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        lock_unpoisoned(&self.local_addrs).clone()
    }

    /// Binds the listeners and returns the serve future.
    ///
    /// Every address that fails to bind is reported through
    /// `listen_err_callback`; init succeeds as long as at least one bind
    /// worked. The returned future accepts and serves connections until
    /// [`shutdown`](Self::shutdown) and must be driven by the caller
    /// (typically in a spawned task).
    ///
    /// # Errors
    ///
    /// `ServerError::NoInterface` when no address could be bound.
    pub async fn init(
        &self,
        mut listen_err_callback: impl FnMut(SocketAddr, &std::io::Error),
    ) -> Result<impl Future<Output = Result<()>> + Send + 'static> {
        let token = CancellationToken::new();
        let (multi, failures) = MultiListener::bind(&self.addrs, token.clone()).await;
        for (addr, err) in &failures {
            listen_err_callback(*addr, err);
        }
        let Some(mut multi) = multi else {
            return Err(ServerError::NoInterface);
        };

        info!(addrs = ?multi.local_addrs(), tls = self.tls.is_some(), "server listening");
        *lock_unpoisoned(&self.local_addrs) = multi.local_addrs().to_vec();
        *lock_unpoisoned(&self.shutdown_token) = Some(token);

        // Gate first (innermost), then request-id stamping, then tracing.
        let app = self
            .handler
            .clone()
            .layer(middleware::from_fn_with_state(Arc::clone(&self.state), shutdown_gate))
            .layer(middleware::from_fn(inject_request_id))
            .layer(TraceLayer::new_for_http());

        let tls_acceptor = self.tls.clone().map(TlsAcceptor::from);

        let mut builder = auto::Builder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(self.read_header_timeout)
            .max_buf_size(self.max_header_bytes);
        builder.http2().timer(TokioTimer::new());

        let serve = async move {
            while let Some((stream, peer)) = multi.accept().await {
                let app = app.clone();
                let builder = builder.clone();
                let tls_acceptor = tls_acceptor.clone();

                tokio::spawn(async move {
                    let io = match &tls_acceptor {
                        None => Either::Left(stream),
                        Some(acceptor) => match acceptor.accept(stream).await {
                            Ok(tls_stream) => Either::Right(tls_stream),
                            Err(err) => {
                                debug!(%peer, error = %err, "TLS handshake failed");
                                return;
                            }
                        },
                    };

                    let service = service_fn(move |request: hyper::Request<Incoming>| {
                        app.clone().oneshot(request)
                    });

                    if let Err(err) = builder
                        .serve_connection_with_upgrades(TokioIo::new(io), service)
                        .await
                    {
                        debug!(%peer, error = %err, "connection ended with error");
                    }
                });
            }
            Ok(())
        };

        Ok(serve)
    }

    /// Shuts the server down.
    ///
    /// Closes the listeners so new connections are refused, then waits for
    /// in-flight requests to finish, polling the counter with jittered
    /// exponential backoff. Requests arriving on surviving keep-alive
    /// connections are answered `503` by the gate.
    ///
    /// # Errors
    ///
    /// - `ServerError::Closed` when the server was never started or shutdown
    ///   already ran.
    /// - A shutdown-timeout error when in-flight requests outlive the
    ///   configured window; a best-effort task inventory path is included
    ///   when one could be written.
    pub async fn shutdown(&self) -> Result<()> {
        let token = match lock_unpoisoned(&self.shutdown_token).as_ref() {
            None => return Err(ServerError::Closed),
            Some(token) => token.clone(),
        };

        if self.state.in_shutdown.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(ServerError::Closed);
        }

        // Stop accepting: the accept tasks exit and drop their listeners.
        token.cancel();

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut poll_base = Duration::from_millis(1);
        loop {
            let in_flight = self.state.request_count.load(Ordering::SeqCst);
            if in_flight <= 0 {
                info!("server shutdown complete");
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(in_flight, "shutdown window elapsed with requests still active");
                return Err(self.shutdown_timeout_error(in_flight));
            }

            let interval = next_poll_interval(&mut poll_base).min(deadline - now);
            tokio::time::sleep(interval).await;
        }
    }

    fn shutdown_timeout_error(&self, in_flight: i64) -> ServerError {
        match dump_task_inventory(in_flight) {
            Ok(path) => ServerError::ShutdownTimeoutWithDump { path },
            Err(_) => ServerError::ShutdownTimeout,
        }
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Poll interval schedule for shutdown draining: exponentially doubling base
/// with 10 % additive jitter, capped at [`SHUTDOWN_POLL_INTERVAL_MAX`].
fn next_poll_interval(base: &mut Duration) -> Duration {
    let jitter_ns = u64::try_from(base.as_nanos() / 10).unwrap_or(u64::MAX);
    let jitter = if jitter_ns == 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(rand::rng().random_range(0..jitter_ns))
    };
    let interval = *base + jitter;

    *base = (*base * 2).min(SHUTDOWN_POLL_INTERVAL_MAX);
    interval
}

/// Best-effort dump of the live task inventory for timeout diagnostics.
fn dump_task_inventory(in_flight: i64) -> std::io::Result<PathBuf> {
    use std::io::Write;

    let metrics = tokio::runtime::Handle::current().metrics();
    let mut file =
        tempfile::Builder::new().prefix("logship-tasks-").suffix(".txt").tempfile()?;
    writeln!(file, "in-flight requests: {in_flight}")?;
    writeln!(file, "alive runtime tasks: {}", metrics.num_alive_tasks())?;
    writeln!(file, "runtime workers: {}", metrics.num_workers())?;

    let (_, path) = file.keep().map_err(|e| e.error)?;
    Ok(path)
}
