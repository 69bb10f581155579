//! `proxy`: forward the one request upstream and relay the answer.

use std::io;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderName, Method};
use futures_util::TryStreamExt;
use reqwest::{Client, Url};
use tokio_util::io::StreamReader;

use super::pump;
use crate::common::ExchangeError;
use crate::events::{FileDescription, SessionEvent};
use crate::server::{ExchangeContext, Handler, Outcome, ResponseSink};
use crate::transfer::{Metered, TransferMeter};

/// Connection-scoped headers that are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
];

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub upstream: Url,
    /// Replaces the client's method when set.
    pub method: Option<Method>,
    /// Added to the forwarded request.
    pub headers: HeaderMap,
}

pub struct ProxyHandler {
    client: Client,
    options: ProxyOptions,
}

impl ProxyHandler {
    pub fn new(options: ProxyOptions) -> anyhow::Result<Self> {
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, options })
    }

    /// The upstream URL, taking the client's query when the upstream has none.
    fn target(&self, request: &Request) -> Url {
        let mut url = self.options.upstream.clone();
        if url.query().is_none() {
            url.set_query(request.uri().query());
        }
        url
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove("keep-alive");
}

#[async_trait]
impl Handler for ProxyHandler {
    async fn serve(
        &self,
        ctx: &ExchangeContext,
        request: Request,
        sink: ResponseSink,
    ) -> Result<Outcome, ExchangeError> {
        let url = self.target(&request);
        let method = self
            .options
            .method
            .clone()
            .unwrap_or_else(|| request.method().clone());
        let (parts, body) = request.into_parts();

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.extend(self.options.headers.clone());

        tracing::debug!(%method, %url, "forwarding request");
        let forwarded = self
            .client
            .request(method, url.clone())
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send();
        let upstream = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ExchangeError::Cancelled),
            upstream = forwarded => upstream.with_context(|| format!("request to {url} failed"))?,
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);
        let mime = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let size = upstream.content_length();

        let meter = TransferMeter::with_events(size, ctx.events.clone());
        let mut body = sink.stream(status, headers)?;
        let upstream_body = StreamReader::new(upstream.bytes_stream().map_err(io::Error::other));
        if let Err(e) = pump(Metered::new(upstream_body, meter.clone()), &mut body, &ctx.cancel).await {
            body.abort(e.to_string()).await;
            return Err(e);
        }
        drop(body);
        meter.finish();

        if !status.is_success() {
            return Err(ExchangeError::Upstream(status));
        }

        ctx.events
            .raise(SessionEvent::FileDescribed(FileDescription {
                name: url.path().rsplit('/').next().unwrap_or_default().to_string(),
                path: None,
                mime,
                size,
                transfer_size: meter.transferred(),
                transfer_duration: meter.elapsed(),
                content: None,
            }))
            .await;
        Ok(Outcome::Completed)
    }
}
