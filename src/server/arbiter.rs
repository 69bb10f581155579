//! Single-shot request arbitration.
//!
//! Every request on every connection lands in one queue. While the exchange
//! is open a single worker drains it in arrival order through
//! [`Handler::serve`]. The first invocation that completes sets the latch:
//! from then on no connection is accepted, idle connections are closed, and
//! a pool of workers answers whatever is still queued through
//! [`Handler::serve_expired`].

use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use axum::body::Body;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Request, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::Router;
use futures_util::FutureExt;
use http_body_util::Limited;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;

use super::handler::{gone, ExchangeContext, Handler, Outcome};
use super::listener::{Listener, TimeoutListener};
use super::middleware::{basic_auth, block_bots, no_cache, Credentials};
use super::sink::{ResponseSink, ResponseSlot};
use super::summary::{Ledger, RequestSummary};
use crate::common::{AppConfig, ExchangeError};
use crate::events::{EventSender, HttpRequest, SessionEvent};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Knobs for one [`Arbiter::serve`] run.
#[derive(Debug, Clone)]
pub struct ArbiterConfig {
    /// Deadline for the first connection. Zero waits forever.
    pub timeout: Duration,
    /// How long open connections may keep going once accepting stopped.
    pub drain_timeout: Duration,
    /// Expired-mode responders. Zero uses the available parallelism.
    pub workers: usize,
    /// Request body limit in bytes. Zero is unlimited.
    pub max_body_size: u64,
    pub block_bots: bool,
    pub no_cache: bool,
    pub credentials: Option<Credentials>,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            drain_timeout: Duration::from_secs(5),
            workers: 0,
            max_body_size: 0,
            block_bots: true,
            no_cache: true,
            credentials: None,
        }
    }
}

impl From<&AppConfig> for ArbiterConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            timeout: config.timeout(),
            drain_timeout: config.drain_timeout(),
            workers: config.server.workers,
            max_body_size: config.server.max_body_size,
            block_bots: config.server.block_bots,
            no_cache: config.server.no_cache,
            credentials: config.credentials(),
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conclusion {
    Succeeded,
    /// Nobody connected before the timeout.
    TimedOut,
    /// Interrupted or past the deadline without a success.
    Cancelled,
}

impl Conclusion {
    pub fn exit_code(self) -> u8 {
        match self {
            Conclusion::Succeeded => 0,
            Conclusion::Cancelled => 1,
            Conclusion::TimedOut => 2,
        }
    }
}

/// Result of [`Arbiter::serve`].
#[derive(Debug)]
pub struct ServeSummary {
    pub conclusion: Conclusion,
    pub success: Option<RequestSummary>,
    pub failures: Vec<RequestSummary>,
}

struct Pending {
    request: Request,
    slot: ResponseSlot,
    arrived: Instant,
}

#[derive(Clone)]
struct QueueHandle {
    tx: mpsc::UnboundedSender<Pending>,
    body_limit: Option<usize>,
}

struct Shared<H> {
    handler: H,
    ledger: Ledger,
    events: EventSender,
    cancel: CancellationToken,
}

/// Owns the handler for the lifetime of one run.
pub struct Arbiter<H> {
    shared: Arc<Shared<H>>,
    config: ArbiterConfig,
}

impl<H: Handler> Arbiter<H> {
    pub fn new(
        handler: H,
        events: EventSender,
        cancel: CancellationToken,
        config: ArbiterConfig,
    ) -> Self {
        let shared = Shared {
            handler,
            ledger: Ledger::default(),
            events,
            cancel,
        };
        Self {
            shared: Arc::new(shared),
            config,
        }
    }

    pub fn is_latched(&self) -> bool {
        self.shared.ledger.is_latched()
    }

    fn worker_count(&self) -> usize {
        if self.config.workers > 0 {
            return self.config.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    fn router(&self, queue: QueueHandle) -> Router {
        let mut router = Router::new()
            .fallback(enqueue)
            .with_state(queue)
            .layer(DefaultBodyLimit::disable());

        if let Some(credentials) = self.config.credentials.clone() {
            router = router.layer(middleware::from_fn_with_state(credentials, basic_auth));
        }
        if self.config.block_bots {
            router = router.layer(middleware::from_fn(block_bots));
        }
        if self.config.no_cache {
            router = router.layer(middleware::from_fn(no_cache));
        }
        router
    }

    /// Runs until the exchange succeeded, nobody connected in time, or the
    /// run was cancelled, then drains open connections and returns.
    pub async fn serve<L: Listener>(self, listener: L) -> ServeSummary {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (latch_tx, latch_rx) = watch::channel(false);
        let body_limit = usize::try_from(self.config.max_body_size)
            .ok()
            .filter(|limit| *limit > 0);
        let app = self.router(QueueHandle {
            tx: queue_tx,
            body_limit,
        });

        let (mut listener, mut timeout) = TimeoutListener::new(listener, self.config.timeout);
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "accepting connections");
        }

        let workers = tokio::spawn(run_workers(
            self.shared.clone(),
            queue_rx,
            latch_tx,
            self.worker_count(),
        ));
        let connections = TaskTracker::new();
        let cancel = self.shared.cancel.clone();
        let mut latched = latch_rx.clone();

        let conclusion = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Conclusion::Cancelled,
                Ok(()) = latch_set(&mut latched) => break Conclusion::Succeeded,
                _ = timeout.fired() => break Conclusion::TimedOut,
                accepted = listener.accept() => match accepted {
                    Ok((io, remote)) => {
                        tracing::debug!(%remote, "accepted connection");
                        connections.spawn(serve_connection(
                            io,
                            remote,
                            app.clone(),
                            latch_rx.clone(),
                            cancel.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        };

        // Stop accepting; connection tasks hold the only remaining queue handles.
        drop(listener);
        drop(app);
        drop(latch_rx);
        connections.close();
        if conclusion != Conclusion::Succeeded {
            cancel.cancel();
        }

        if tokio::time::timeout(self.config.drain_timeout, connections.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                open = connections.len(),
                "connections still open after drain timeout, dropping them"
            );
            cancel.cancel();
            connections.wait().await;
        }

        if let Err(e) = workers.await {
            tracing::error!(error = %e, "arbiter worker failed");
        }

        let (success, failures) = self.shared.ledger.snapshot();
        let conclusion = if success.is_some() {
            Conclusion::Succeeded
        } else {
            conclusion
        };
        tracing::info!(?conclusion, failed_attempts = failures.len(), "serve finished");

        ServeSummary {
            conclusion,
            success,
            failures,
        }
    }
}

async fn serve_connection<I>(
    io: I,
    remote: SocketAddr,
    app: Router,
    mut latched: watch::Receiver<bool>,
    cancel: CancellationToken,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if *latched.borrow() {
        tracing::debug!(%remote, "closing connection accepted after the exchange");
        return;
    }

    let service = app.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(remote));
        request
    });
    let service = TowerToHyperService::new(service);
    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let mut shutting_down = false;
    loop {
        tokio::select! {
            result = connection.as_mut() => {
                if let Err(e) = result {
                    tracing::debug!(%remote, error = %e, "connection ended with error");
                }
                break;
            }
            Ok(()) = latch_set(&mut latched), if !shutting_down => {
                // Idle connections close now; one mid-response finishes first.
                connection.as_mut().graceful_shutdown();
                shutting_down = true;
            }
            _ = cancel.cancelled() => {
                tracing::debug!(%remote, "dropping connection");
                break;
            }
        }
    }
}

/// Resolves once the latch is set, without holding the borrow guard.
async fn latch_set(latched: &mut watch::Receiver<bool>) -> Result<(), watch::error::RecvError> {
    latched.wait_for(|latched| *latched).await.map(|_| ())
}

/// The axum fallback every request goes through: queue it, wait for the answer.
async fn enqueue(State(queue): State<QueueHandle>, request: Request) -> Response {
    let request = match queue.body_limit {
        Some(limit) => request.map(|body| Body::new(Limited::new(body, limit))),
        None => request,
    };

    let (slot, answer) = ResponseSlot::new();
    let pending = Pending {
        request,
        slot,
        arrived: Instant::now(),
    };
    if queue.tx.send(pending).is_err() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down\n").into_response();
    }

    match answer.await {
        Ok(response) => response,
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "server is shutting down\n").into_response(),
    }
}

fn remote_of(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

async fn run_workers<H: Handler>(
    shared: Arc<Shared<H>>,
    mut queue: mpsc::UnboundedReceiver<Pending>,
    latch: watch::Sender<bool>,
    pool_size: usize,
) {
    loop {
        let pending = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => {
                tracing::debug!("primary worker cancelled");
                return;
            }
            next = queue.recv() => match next {
                Some(pending) => pending,
                None => return,
            },
        };
        if shared.dispatch(pending).await {
            break;
        }
    }

    latch.send_replace(true);
    tracing::info!(pool_size, "exchange complete, answering 410 Gone from now on");

    let queue = Arc::new(AsyncMutex::new(queue));
    let mut pool = JoinSet::new();
    for _ in 0..pool_size {
        pool.spawn(expired_worker(shared.clone(), queue.clone()));
    }
    while let Some(result) = pool.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "expired worker failed");
        }
    }
}

async fn expired_worker<H: Handler>(
    shared: Arc<Shared<H>>,
    queue: Arc<AsyncMutex<mpsc::UnboundedReceiver<Pending>>>,
) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some(Pending { request, slot, .. }) = next else {
            break;
        };

        let ctx = ExchangeContext::new(
            EventSender::detached(),
            shared.cancel.clone(),
            remote_of(&request),
        );
        shared
            .handler
            .serve_expired(&ctx, request, ResponseSink::new(slot.clone()))
            .await;
        if !slot.is_answered() {
            slot.deliver(gone());
        }
    }
}

impl<H: Handler> Shared<H> {
    /// Runs the primary handler for one request. Returns true if it set the latch.
    async fn dispatch(&self, pending: Pending) -> bool {
        let Pending {
            request,
            slot,
            arrived,
        } = pending;
        let remote = remote_of(&request);
        let mut summary = RequestSummary::begin(
            request.method().clone(),
            request.uri().clone(),
            remote,
            arrived,
        );
        let ctx = ExchangeContext::new(self.events.clone(), self.cancel.child_token(), remote);

        tracing::debug!(method = %summary.method, uri = %summary.uri, ?remote, "dispatching request");
        self.events
            .raise(SessionEvent::RequestReceived(HttpRequest::from_request(&request)))
            .await;

        let invocation = self
            .handler
            .serve(&ctx, request, ResponseSink::new(slot.clone()));
        let result = match AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(ExchangeError::Internal(anyhow!("handler panicked"))),
        };

        match result {
            Ok(outcome) => {
                if !slot.is_answered() {
                    slot.deliver(StatusCode::OK.into_response());
                }
                summary.end(slot.status());
                match outcome {
                    Outcome::Pending => {
                        tracing::debug!(uri = %summary.uri, "served auxiliary page");
                        false
                    }
                    Outcome::Completed => {
                        if !self.ledger.latch(summary) {
                            return false;
                        }
                        tracing::info!(?remote, "exchange succeeded");
                        self.events.raise(SessionEvent::ExchangeSucceeded).await;
                        true
                    }
                }
            }
            Err(error) => {
                let message = error.to_string();
                tracing::warn!(?remote, error = %message, "exchange attempt failed");
                if !slot.is_answered() {
                    slot.deliver(error.into_response());
                }
                summary.end(slot.status());
                summary.error = Some(message.clone());
                self.ledger.record_failure(summary);
                self.events
                    .raise(SessionEvent::ClientDisconnected { error: message })
                    .await;
                false
            }
        }
    }
}
