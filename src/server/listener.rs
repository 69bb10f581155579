//! Connection sources for the arbiter, and the first-connection timeout guard.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Anything that yields byte-stream connections.
#[async_trait]
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl Listener for tokio::net::TcpListener {
    type Io = tokio::net::TcpStream;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)> {
        let (stream, addr) = tokio::net::TcpListener::accept(self).await?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "failed to set TCP_NODELAY");
        }
        Ok((stream, addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::TcpListener::local_addr(self)
    }
}

const ARMED: u8 = 0;
const DISARMED: u8 = 1;
const FIRED: u8 = 2;

/// Wraps a listener with a deadline for the first connection.
///
/// The first `accept` that returns, with a connection or an error,
/// disarms the timer. If the timer runs out first, the paired
/// [`TimeoutSignal`] fires once. Disarm and fire race on one
/// compare-and-swap, so the signal can never fire after a disarm.
pub struct TimeoutListener<L> {
    inner: L,
    state: Arc<AtomicU8>,
    timer: Option<JoinHandle<()>>,
}

/// Resolves when the paired [`TimeoutListener`] saw no connection in time.
pub struct TimeoutSignal {
    rx: Option<oneshot::Receiver<()>>,
}

impl<L> TimeoutListener<L> {
    /// A zero `timeout` disables the guard; the signal then never fires.
    pub fn new(inner: L, timeout: Duration) -> (Self, TimeoutSignal) {
        let state = Arc::new(AtomicU8::new(ARMED));

        if timeout.is_zero() {
            state.store(DISARMED, Ordering::Release);
            let listener = Self {
                inner,
                state,
                timer: None,
            };
            return (listener, TimeoutSignal { rx: None });
        }

        let (tx, rx) = oneshot::channel();
        let timer_state = state.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timer_state
                .compare_exchange(ARMED, FIRED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                tracing::info!(?timeout, "no connection before timeout");
                let _ = tx.send(());
            }
        });

        let listener = Self {
            inner,
            state,
            timer: Some(timer),
        };
        (listener, TimeoutSignal { rx: Some(rx) })
    }

    fn disarm(&mut self) {
        let won = self
            .state
            .compare_exchange(ARMED, DISARMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if let Some(timer) = self.timer.take() {
            if won {
                timer.abort();
            }
        }
    }

    pub fn has_fired(&self) -> bool {
        self.state.load(Ordering::Acquire) == FIRED
    }

    pub fn get_ref(&self) -> &L {
        &self.inner
    }
}

#[async_trait]
impl<L: Listener> Listener for TimeoutListener<L> {
    type Io = L::Io;

    async fn accept(&mut self) -> io::Result<(Self::Io, SocketAddr)> {
        let result = self.inner.accept().await;
        self.disarm();
        result
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl<L> Drop for TimeoutListener<L> {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

impl TimeoutSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        Self { rx: None }
    }

    /// Waits for the timer. Pends forever when the guard is disabled,
    /// disarmed, or its listener was dropped.
    pub fn fired(&mut self) -> impl Future<Output = ()> + '_ {
        async move {
            match self.rx.as_mut() {
                Some(rx) => {
                    let result = rx.await;
                    self.rx = None;
                    if result.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                None => std::future::pending::<()>().await,
            }
        }
    }
}
