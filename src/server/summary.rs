//! Per-attempt request summaries and the success latch.

use std::net::SocketAddr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant, SystemTime};

use axum::http::{Method, StatusCode, Uri};

/// What the arbiter remembers about one handler invocation.
#[derive(Debug, Clone)]
pub struct RequestSummary {
    pub method: Method,
    pub uri: Uri,
    pub remote_addr: Option<SocketAddr>,
    pub received_at: SystemTime,
    /// Time spent in the queue before a worker picked the request up.
    pub queued: Duration,
    /// Time the handler took.
    pub duration: Duration,
    pub status: Option<StatusCode>,
    pub error: Option<String>,
    started: Instant,
}

impl RequestSummary {
    pub(crate) fn begin(
        method: Method,
        uri: Uri,
        remote_addr: Option<SocketAddr>,
        arrived: Instant,
    ) -> Self {
        let now = Instant::now();
        Self {
            method,
            uri,
            remote_addr,
            received_at: SystemTime::now() - now.duration_since(arrived),
            queued: now.duration_since(arrived),
            duration: Duration::ZERO,
            status: None,
            error: None,
            started: now,
        }
    }

    pub(crate) fn end(&mut self, status: Option<StatusCode>) {
        self.duration = self.started.elapsed();
        self.status = status;
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    success: Option<RequestSummary>,
    failures: Vec<RequestSummary>,
}

/// Write-once success latch plus the ordered list of failed attempts.
#[derive(Debug, Default)]
pub(crate) struct Ledger {
    state: RwLock<LedgerState>,
}

impl Ledger {
    fn read(&self) -> RwLockReadGuard<'_, LedgerState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Ledger lock poisoned during read, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, LedgerState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Ledger lock poisoned during write, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub(crate) fn is_latched(&self) -> bool {
        self.read().success.is_some()
    }

    /// Records `summary` as the success. Returns false, leaving the
    /// existing success untouched, if the latch was already set.
    pub(crate) fn latch(&self, summary: RequestSummary) -> bool {
        let mut state = self.write();
        if state.success.is_some() {
            tracing::warn!("second success ignored, latch already set");
            return false;
        }
        state.success = Some(summary);
        true
    }

    pub(crate) fn record_failure(&self, summary: RequestSummary) {
        self.write().failures.push(summary);
    }

    pub(crate) fn snapshot(&self) -> (Option<RequestSummary>, Vec<RequestSummary>) {
        let state = self.read();
        (state.success.clone(), state.failures.clone())
    }
}
