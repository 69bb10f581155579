//! Lock-free byte counting for payload streams.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::events::{EventSender, SessionEvent};

/// Minimum spacing between intermediate progress samples.
pub const SAMPLE_PERIOD: Duration = Duration::from_millis(125);

/// One observation of a running transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSample {
    pub transferred: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// Set on the single closing sample of a transfer.
    pub finished: bool,
}

/// Shared counter behind one or more [`Metered`] streams.
///
/// Counting uses atomics so the meter can be read from the reporter side
/// while the handler is mid-copy. The total is set at most once.
#[derive(Debug)]
pub struct TransferMeter {
    transferred: AtomicU64,
    total: OnceLock<u64>,
    started: Instant,
    last_sample_nanos: AtomicU64,
    finished: AtomicBool,
    period: Duration,
    events: Option<EventSender>,
}

impl TransferMeter {
    /// A meter that only counts.
    pub fn new(total: Option<u64>) -> Arc<Self> {
        Arc::new(Self::build(total, None, SAMPLE_PERIOD))
    }

    /// A meter that also offers progress samples to the event bus.
    pub fn with_events(total: Option<u64>, events: EventSender) -> Arc<Self> {
        Arc::new(Self::build(total, Some(events), SAMPLE_PERIOD))
    }

    fn build(total: Option<u64>, events: Option<EventSender>, period: Duration) -> Self {
        let meter = Self {
            transferred: AtomicU64::new(0),
            total: OnceLock::new(),
            started: Instant::now(),
            last_sample_nanos: AtomicU64::new(0),
            finished: AtomicBool::new(false),
            period,
            events,
        };
        if let Some(total) = total {
            let _ = meter.total.set(total);
        }
        meter
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    pub fn total(&self) -> Option<u64> {
        self.total.get().copied()
    }

    /// Records the expected size once it becomes known. Later calls are ignored.
    pub fn set_total(&self, total: u64) {
        let _ = self.total.set(total);
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn sample(&self) -> ProgressSample {
        ProgressSample {
            transferred: self.transferred(),
            total: self.total(),
            elapsed: self.elapsed(),
            finished: self.is_finished(),
        }
    }

    /// Adds `n` moved bytes and offers a throttled sample to the event bus.
    pub fn record(&self, n: usize) {
        if n == 0 {
            return;
        }
        self.transferred.fetch_add(n as u64, Ordering::AcqRel);

        let Some(events) = &self.events else {
            return;
        };
        let now = self.started.elapsed().as_nanos() as u64;
        let last = self.last_sample_nanos.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.period.as_nanos() as u64 {
            return;
        }
        if self
            .last_sample_nanos
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            // Intermediate samples are lossy; a full bus just skips one.
            events.try_raise(SessionEvent::TransferProgressSample(self.sample()));
        }
    }

    /// Latches completion. Returns the closing sample the first time only.
    pub fn finish(&self) -> Option<ProgressSample> {
        if self.finished.swap(true, Ordering::AcqRel) {
            return None;
        }
        let sample = self.sample();
        if let Some(events) = &self.events {
            if !events.try_raise(SessionEvent::TransferProgressSample(sample)) {
                tracing::debug!("event bus full, closing progress sample dropped");
            }
        }
        Some(sample)
    }
}

/// Pass-through stream decorator that mirrors every read or write into a
/// [`TransferMeter`]. Bytes, errors and short reads/writes are untouched.
///
/// End of stream (a zero-byte read into a non-empty buffer, or a shutdown
/// on the write side) finishes the meter.
#[derive(Debug)]
pub struct Metered<T> {
    inner: T,
    meter: Arc<TransferMeter>,
}

impl<T> Metered<T> {
    pub fn new(inner: T, meter: Arc<TransferMeter>) -> Self {
        Self { inner, meter }
    }

    pub fn meter(&self) -> &Arc<TransferMeter> {
        &self.meter
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Metered<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.meter.record(n);
            } else if buf.remaining() > 0 {
                self.meter.finish();
            }
        }
        poll
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Metered<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let poll = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &poll {
            self.meter.record(*n);
        }
        poll
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_shutdown(cx);
        if let Poll::Ready(Ok(())) = &poll {
            self.meter.finish();
        }
        poll
    }
}
