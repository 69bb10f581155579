//! `redirect`: send the one client somewhere else.

use anyhow::{ensure, Context as _};
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};

use crate::common::ExchangeError;
use crate::server::{ExchangeContext, Handler, Outcome, ResponseSink};

pub const DEFAULT_STATUS: StatusCode = StatusCode::TEMPORARY_REDIRECT;

#[derive(Debug)]
pub struct RedirectHandler {
    status: StatusCode,
    headers: HeaderMap,
}

impl RedirectHandler {
    /// `status` must be a 3xx code.
    pub fn new(location: &str, status: StatusCode, extra: HeaderMap) -> anyhow::Result<Self> {
        ensure!(
            status.is_redirection(),
            "Redirect status must be 3xx, got {}",
            status.as_u16()
        );
        let location = HeaderValue::try_from(location)
            .with_context(|| format!("Invalid redirect target '{location}'"))?;

        let mut headers = extra;
        headers.insert(header::LOCATION, location);
        Ok(Self { status, headers })
    }
}

#[async_trait]
impl Handler for RedirectHandler {
    async fn serve(
        &self,
        _ctx: &ExchangeContext,
        _request: Request,
        sink: ResponseSink,
    ) -> Result<Outcome, ExchangeError> {
        sink.respond((self.status, self.headers.clone()))?;
        Ok(Outcome::Completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventSender;
    use axum::body::Body;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_redirects_with_location_and_headers() {
        let mut extra = HeaderMap::new();
        extra.insert("x-reason", HeaderValue::from_static("moved"));
        let handler = RedirectHandler::new("https://example.test/next", DEFAULT_STATUS, extra).unwrap();

        let ctx = ExchangeContext::new(EventSender::detached(), CancellationToken::new(), None);
        let (sink, answer) = ResponseSink::detached();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(handler.serve(&ctx, request, sink).await.unwrap(), Outcome::Completed);

        let response = answer.await.unwrap();
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[header::LOCATION], "https://example.test/next");
        assert_eq!(response.headers()["x-reason"], "moved");
    }

    #[test]
    fn test_rejects_non_redirect_status() {
        let err = RedirectHandler::new("/x", StatusCode::OK, HeaderMap::new()).unwrap_err();
        assert!(err.to_string().contains("3xx"));
    }
}
