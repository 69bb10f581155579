//! The contract between the arbiter and a command.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio_util::sync::CancellationToken;

use super::ResponseSink;
use crate::common::ExchangeError;
use crate::events::EventSender;

/// What a handler invocation gets besides the request itself.
#[derive(Debug, Clone)]
pub struct ExchangeContext {
    pub events: EventSender,
    /// Cancelled on Ctrl-C, deadline or forced drain.
    pub cancel: CancellationToken,
    pub remote_addr: Option<SocketAddr>,
}

impl ExchangeContext {
    pub fn new(events: EventSender, cancel: CancellationToken, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            events,
            cancel,
            remote_addr,
        }
    }
}

/// How a primary invocation ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The exchange happened; the arbiter latches.
    Completed,
    /// An auxiliary page (such as the upload form) was served. Neither a
    /// success nor a failed attempt.
    Pending,
}

/// A command installed into the arbiter.
///
/// `serve` runs for requests while the exchange is still open, one at a
/// time and in arrival order. It raises `FileDescribed` and progress events
/// through `ctx.events`; request, success and failure events are raised by
/// the arbiter. `serve_expired` runs concurrently for everything after the
/// success and must not raise events.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn serve(
        &self,
        ctx: &ExchangeContext,
        request: Request,
        sink: ResponseSink,
    ) -> Result<Outcome, ExchangeError>;

    async fn serve_expired(&self, _ctx: &ExchangeContext, _request: Request, sink: ResponseSink) {
        if sink.respond(gone()).is_err() {
            tracing::debug!("client left before the 410");
        }
    }
}

/// The answer for every request after the exchange.
pub fn gone() -> Response {
    (
        StatusCode::GONE,
        "410 Gone: this resource has already been transferred\n",
    )
        .into_response()
}
