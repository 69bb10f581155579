//! Session events and the bounded bus that carries them to the reporter.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use axum::extract::{ConnectInfo, Query};
use axum::http::{header, Request};
use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::transfer::ProgressSample;

pub const DEFAULT_CAPACITY: usize = 64;

/// Everything the reporter learns about an exchange.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A request reached the primary handler. Opens a new client session.
    RequestReceived(HttpRequest),
    /// Ends the current attempt as failed, for any cause, not only a
    /// dropped client.
    ClientDisconnected { error: String },
    TransferProgressSample(ProgressSample),
    /// Metadata of the payload moved by the current attempt.
    FileDescribed(FileDescription),
    /// The current attempt is the single successful exchange.
    ExchangeSucceeded,
}

/// Request metadata as it appears in the JSON report.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HttpRequest {
    pub method: String,
    #[serde(rename = "RequestURI")]
    pub request_uri: String,
    pub path: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub query: BTreeMap<String, Vec<String>>,
    pub protocol: String,
    pub header: BTreeMap<String, Vec<String>>,
    pub host: String,
    pub remote_addr: String,
    #[serde(skip)]
    pub received_at: Option<SystemTime>,
}

impl HttpRequest {
    pub fn from_request<B>(request: &Request<B>) -> Self {
        let uri = request.uri();

        let mut query = BTreeMap::<String, Vec<String>>::new();
        if let Ok(Query(pairs)) = Query::<Vec<(String, String)>>::try_from_uri(uri) {
            for (key, value) in pairs {
                query.entry(key).or_default().push(value);
            }
        }

        let mut headers = BTreeMap::<String, Vec<String>>::new();
        for (name, value) in request.headers() {
            headers
                .entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let remote_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.to_string())
            .unwrap_or_default();

        Self {
            method: request.method().to_string(),
            request_uri: uri.to_string(),
            path: uri.path().to_string(),
            query,
            protocol: format!("{:?}", request.version()),
            header: headers,
            host,
            remote_addr,
            received_at: Some(SystemTime::now()),
        }
    }
}

/// Payload metadata raised once per completed transfer.
#[derive(Debug, Clone, Default)]
pub struct FileDescription {
    pub name: String,
    pub path: Option<PathBuf>,
    pub mime: String,
    pub size: Option<u64>,
    pub transfer_size: u64,
    pub transfer_duration: Duration,
    /// Received bytes, kept only when the payload went to stdout.
    pub content: Option<Bytes>,
}

/// Sending half of the bus. Cheap to clone; every handler invocation gets one.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::Sender<SessionEvent>,
}

/// Receiving half, owned by the reporter task.
#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::Receiver<SessionEvent>,
}

pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (EventSender { tx }, EventReceiver { rx })
}

impl EventSender {
    /// Delivers `event`, waiting for room. Events raised after the reporter
    /// stopped are dropped.
    pub async fn raise(&self, event: SessionEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::debug!("reporter gone, event dropped");
        }
    }

    /// Delivers `event` only if there is room right now.
    pub fn try_raise(&self, event: SessionEvent) -> bool {
        self.tx.try_send(event).is_ok()
    }

    /// A sender whose events go nowhere.
    pub fn detached() -> Self {
        let (tx, _) = mpsc::channel(1);
        Self { tx }
    }
}

impl EventReceiver {
    pub async fn next(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Result<SessionEvent, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    #[test]
    fn test_request_metadata() {
        let mut request = Request::builder()
            .method("POST")
            .uri("/upload?tag=a&tag=b&x=1")
            .header("host", "example.test:8080")
            .header("x-thing", "one")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 2], 5000))));

        let info = HttpRequest::from_request(&request);
        assert_eq!(info.method, "POST");
        assert_eq!(info.path, "/upload");
        assert_eq!(info.query["tag"], vec!["a", "b"]);
        assert_eq!(info.host, "example.test:8080");
        assert_eq!(info.remote_addr, "10.0.0.2:5000");
        assert_eq!(info.protocol, "HTTP/1.1");
        assert_eq!(info.header["x-thing"], vec!["one"]);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["RequestURI"], "/upload?tag=a&tag=b&x=1");
        assert_eq!(json["RemoteAddr"], "10.0.0.2:5000");
    }

    #[tokio::test]
    async fn test_detached_sender_drops_quietly() {
        let events = EventSender::detached();
        events.raise(SessionEvent::ExchangeSucceeded).await;
        assert!(!events.try_raise(SessionEvent::ExchangeSucceeded));
    }

    #[tokio::test]
    async fn test_order_is_preserved() {
        let (tx, mut rx) = channel(4);
        tx.raise(SessionEvent::ClientDisconnected { error: "first".into() }).await;
        tx.raise(SessionEvent::ExchangeSucceeded).await;
        drop(tx);

        assert!(matches!(rx.next().await, Some(SessionEvent::ClientDisconnected { .. })));
        assert!(matches!(rx.next().await, Some(SessionEvent::ExchangeSucceeded)));
        assert!(rx.next().await.is_none());
    }
}
