//! The handler's half of a queued request: where its response goes.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::common::ExchangeError;

/// In-flight body chunks per streamed response.
const BODY_CHANNEL_CAPACITY: usize = 2;

#[derive(Default)]
struct SlotState {
    tx: Option<oneshot::Sender<Response>>,
    status: Option<StatusCode>,
}

/// Shared between the arbiter and the [`ResponseSink`] so the arbiter can
/// see whether (and with what status) the handler answered.
#[derive(Clone)]
pub(crate) struct ResponseSlot {
    state: Arc<Mutex<SlotState>>,
}

impl ResponseSlot {
    pub(crate) fn new() -> (Self, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        let state = SlotState {
            tx: Some(tx),
            status: None,
        };
        (
            Self {
                state: Arc::new(Mutex::new(state)),
            },
            rx,
        )
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Response slot lock poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Hands `response` to the connection. Returns false if the slot was
    /// already used or the client stopped waiting.
    pub(crate) fn deliver(&self, response: Response) -> bool {
        let mut state = self.lock();
        let Some(tx) = state.tx.take() else {
            return false;
        };
        state.status = Some(response.status());
        tx.send(response).is_ok()
    }

    pub(crate) fn is_answered(&self) -> bool {
        self.lock().tx.is_none()
    }

    pub(crate) fn status(&self) -> Option<StatusCode> {
        self.lock().status
    }
}

/// Where a handler writes its single response.
///
/// Either [`respond`](Self::respond) with a complete response, or
/// [`stream`](Self::stream) a head and push the body through the returned
/// [`BodySender`]. Both consume the sink.
pub struct ResponseSink {
    slot: ResponseSlot,
}

impl ResponseSink {
    pub(crate) fn new(slot: ResponseSlot) -> Self {
        Self { slot }
    }

    /// A sink whose response is handed to the returned receiver.
    pub fn detached() -> (Self, oneshot::Receiver<Response>) {
        let (slot, rx) = ResponseSlot::new();
        (Self::new(slot), rx)
    }

    pub fn respond(self, response: impl IntoResponse) -> Result<(), ExchangeError> {
        if self.slot.deliver(response.into_response()) {
            Ok(())
        } else {
            Err(ExchangeError::disconnected("client stopped waiting for a response"))
        }
    }

    /// Sends the response head now; the body follows through [`BodySender`].
    pub fn stream(self, status: StatusCode, headers: HeaderMap) -> Result<BodySender, ExchangeError> {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(BODY_CHANNEL_CAPACITY);
        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });

        let mut response = Response::new(Body::from_stream(body));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        if self.slot.deliver(response) {
            Ok(BodySender { tx })
        } else {
            Err(ExchangeError::disconnected("client stopped waiting for a response"))
        }
    }
}

/// Body half of a streamed response. Dropping it ends the body.
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl BodySender {
    /// Waits until the connection takes `chunk`. Fails once the client is gone.
    pub async fn send(&mut self, chunk: Bytes) -> Result<(), ExchangeError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| ExchangeError::disconnected("connection closed mid-transfer"))
    }

    /// Aborts the body so the client sees a truncated response instead of a
    /// clean end.
    pub async fn abort(self, reason: impl Into<String>) {
        let error = io::Error::other(reason.into());
        let _ = self.tx.send(Err(error)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
