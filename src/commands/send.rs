//! `send`: serve one file, stdin, or an archive of several paths.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use tokio::sync::Mutex;

use super::{pump, CommandContext};
use crate::common::ExchangeError;
use crate::events::{FileDescription, SessionEvent};
use crate::server::{ExchangeContext, Handler, Outcome, ResponseSink};
use crate::transfer::{Metered, TransferMeter, TransferReader};

#[derive(Debug, Clone)]
pub struct SendOptions {
    pub status: StatusCode,
    /// Added after the generated headers, replacing any with the same name.
    pub headers: HeaderMap,
    /// Omit `Content-Disposition` so browsers display instead of download.
    pub no_download: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            no_download: false,
        }
    }
}

pub struct SendHandler {
    reader: Mutex<TransferReader>,
    options: SendOptions,
}

impl SendHandler {
    pub fn new(reader: TransferReader, options: SendOptions) -> Self {
        Self {
            reader: Mutex::new(reader),
            options,
        }
    }

    /// Resolves the payload before anything is served: every path is
    /// statted, stdin is drained (unless streamed) and archives are built.
    /// The reader is handed over closed, with its bytes cached for replay.
    pub async fn prepare(mut reader: TransferReader, options: SendOptions) -> anyhow::Result<Self> {
        reader.open().await.context("Cannot prepare the payload")?;
        tracing::debug!(name = reader.name(), size = ?reader.size(), "payload ready");
        reader.reset();
        Ok(Self::new(reader, options))
    }

    /// Builds the reader for `paths` with the configured archive method.
    pub fn for_paths(ctx: &CommandContext, paths: Vec<PathBuf>) -> TransferReader {
        TransferReader::new(paths)
            .with_archive_method(ctx.config.archive.method)
            .with_cancellation(ctx.cancel.clone())
    }

    fn response_headers(&self, reader: &TransferReader) -> Result<HeaderMap, ExchangeError> {
        let mut headers = HeaderMap::new();
        let mime = HeaderValue::try_from(reader.mime_type())
            .context("MIME type is not a valid header value")?;
        headers.insert(header::CONTENT_TYPE, mime);

        if !self.options.no_download {
            let name = reader.name().replace(['"', '\\'], "");
            let disposition = HeaderValue::try_from(format!("attachment;filename=\"{name}\""))
                .context("file name is not a valid header value")?;
            headers.insert(header::CONTENT_DISPOSITION, disposition);
        }
        if let Some(size) = reader.size() {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
        }

        headers.extend(self.options.headers.clone());
        Ok(headers)
    }

    async fn transfer(
        &self,
        ctx: &ExchangeContext,
        reader: &mut TransferReader,
        sink: ResponseSink,
    ) -> Result<Outcome, ExchangeError> {
        reader.open().await?;
        let headers = self.response_headers(reader)?;
        let meter = TransferMeter::with_events(reader.size(), ctx.events.clone());

        let mut body = sink.stream(self.options.status, headers)?;
        let copied = pump(Metered::new(&mut *reader, meter.clone()), &mut body, &ctx.cancel).await;
        if let Err(e) = copied {
            body.abort(e.to_string()).await;
            return Err(e);
        }

        let sent = meter.transferred();
        if let Some(expected) = reader.size() {
            if sent != expected {
                body.abort("short read").await;
                return Err(ExchangeError::Internal(anyhow::anyhow!(
                    "sent {sent} of {expected} bytes"
                )));
            }
        }
        drop(body);
        meter.finish();

        tracing::debug!(name = reader.name(), bytes = sent, "payload sent");
        ctx.events
            .raise(SessionEvent::FileDescribed(FileDescription {
                name: reader.name().to_string(),
                path: None,
                mime: reader.mime_type(),
                size: reader.size(),
                transfer_size: sent,
                transfer_duration: meter.elapsed(),
                content: None,
            }))
            .await;
        Ok(Outcome::Completed)
    }
}

#[async_trait]
impl Handler for SendHandler {
    async fn serve(
        &self,
        ctx: &ExchangeContext,
        _request: Request,
        sink: ResponseSink,
    ) -> Result<Outcome, ExchangeError> {
        let mut reader = self.reader.lock().await;
        let result = self.transfer(ctx, &mut reader, sink).await;
        reader.reset();
        result
    }
}
