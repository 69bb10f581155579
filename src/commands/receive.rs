//! `receive`: accept one upload into a directory or stdout.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, ensure, Context as _};
use async_trait::async_trait;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse};
use axum::Form;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use super::CommandContext;
use crate::common::{ExchangeError, OutputFormat};
use crate::events::{FileDescription, SessionEvent};
use crate::server::{ExchangeContext, Handler, Outcome, ResponseSink};
use crate::transfer::{random_name, Metered, TransferError, TransferMeter, TransferWriter};

const UPLOAD_PAGE: &str = include_str!("upload.html");
const CSRF_FIELD: &str = "csrf-token";
const CSRF_HEADER: &str = "x-csrf-token";
const TEXT_FIELD: &str = "text";

/// Line endings for text submitted through the form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Eol {
    /// CRLF is normalised to LF.
    #[default]
    Unix,
    /// Text is kept as the browser sent it.
    Dos,
}

#[derive(Debug, Clone, Default)]
pub struct ReceiveOptions {
    pub csrf_token: Option<String>,
    pub eol: Eol,
    /// The upload is base64 and is stored decoded.
    pub decode_b64: bool,
}

pub struct ReceiveHandler {
    writer: Mutex<TransferWriter>,
    options: ReceiveOptions,
}

impl ReceiveHandler {
    pub fn new(writer: TransferWriter, options: ReceiveOptions) -> Self {
        let options = ReceiveOptions {
            csrf_token: options.csrf_token.filter(|t| !t.is_empty()),
            ..options
        };
        Self {
            writer: Mutex::new(writer),
            options,
        }
    }

    /// Builds the writer for `location`, or stdout when there is none. With
    /// JSON output on stdout the received bytes go into the report instead.
    ///
    /// `location` is a directory, or a file path whose parent directory
    /// exists; an explicit `name` wins over the file name in the path.
    pub fn destination(
        ctx: &CommandContext,
        location: Option<PathBuf>,
        name: Option<String>,
    ) -> anyhow::Result<TransferWriter> {
        let writer = match location {
            Some(location) => {
                let (dir, file_name) = resolve_destination(&location)?;
                TransferWriter::to_dir(dir).with_name(name.or(file_name))
            }
            None => TransferWriter::to_stdout()
                .capture_stdout(ctx.config.output.format == OutputFormat::Json)
                .with_name(name),
        };
        Ok(writer.with_garbage(ctx.garbage.clone()))
    }

    fn decoder(&self) -> Option<Base64Chunks> {
        self.options.decode_b64.then(Base64Chunks::default)
    }

    fn upload_page(&self) -> impl IntoResponse {
        let csrf = match &self.options.csrf_token {
            Some(token) => format!(
                r#"<input type="hidden" name="{CSRF_FIELD}" value="{}">"#,
                escape_attr(token)
            ),
            None => String::new(),
        };
        (
            [(header::X_CONTENT_TYPE_OPTIONS, "nosniff")],
            Html(UPLOAD_PAGE.replace("{{csrf}}", &csrf)),
        )
    }

    fn check_csrf(&self, supplied: Option<&str>) -> Result<(), ExchangeError> {
        match &self.options.csrf_token {
            None => Ok(()),
            Some(expected) if supplied == Some(expected.as_str()) => Ok(()),
            Some(_) => Err(ExchangeError::Unauthorized("invalid CSRF token".into())),
        }
    }

    async fn receive(
        &self,
        ctx: &ExchangeContext,
        writer: &mut TransferWriter,
        request: Request,
    ) -> Result<Arc<TransferMeter>, ExchangeError> {
        let content_type = header_str(request.headers(), header::CONTENT_TYPE)
            .unwrap_or_default()
            .to_ascii_lowercase();
        let header_token = header_str(request.headers(), CSRF_HEADER).map(str::to_string);

        let meter = if content_type.starts_with("multipart/form-data") {
            self.receive_multipart(ctx, writer, request, header_token).await?
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            self.receive_form(ctx, writer, request, header_token).await?
        } else {
            self.check_csrf(header_token.as_deref())?;
            self.receive_raw(ctx, writer, request).await?
        };

        writer.close().await?;
        Ok(meter)
    }

    async fn receive_multipart(
        &self,
        ctx: &ExchangeContext,
        writer: &mut TransferWriter,
        request: Request,
        header_token: Option<String>,
    ) -> Result<Arc<TransferMeter>, ExchangeError> {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ExchangeError::BadRequest(e.body_text()))?;

        let mut field = next_field(&mut multipart).await?;
        if field.name() == Some(CSRF_FIELD) {
            let token = field
                .text()
                .await
                .map_err(|e| ExchangeError::BadRequest(e.body_text()))?;
            self.check_csrf(Some(&token))?;
            field = next_field(&mut multipart).await?;
        } else {
            self.check_csrf(header_token.as_deref())?;
        }

        if let Some(name) = field.file_name() {
            writer.set_remote_name(name);
        }
        writer.set_mime_type(field.content_type().map(str::to_string));
        writer.open().await?;

        let meter = TransferMeter::with_events(None, ctx.events.clone());
        let mut out = Metered::new(&mut *writer, meter.clone());
        let mut decoder = self.decoder();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ExchangeError::Cancelled),
                chunk = field.chunk() => chunk.map_err(|e| ExchangeError::disconnected(e.body_text()))?,
            };
            let Some(chunk) = chunk else { break };
            write_chunk(&mut out, &mut decoder, &chunk).await?;
        }
        finish_chunks(&mut out, decoder).await?;
        out.shutdown()
            .await
            .map_err(|e| TransferError::io("cannot flush upload", e))?;
        Ok(meter)
    }

    async fn receive_form(
        &self,
        ctx: &ExchangeContext,
        writer: &mut TransferWriter,
        request: Request,
        header_token: Option<String>,
    ) -> Result<Arc<TransferMeter>, ExchangeError> {
        let Form(mut fields) = Form::<HashMap<String, String>>::from_request(request, &())
            .await
            .map_err(|e| ExchangeError::BadRequest(e.body_text()))?;

        let form_token = fields.remove(CSRF_FIELD);
        if self.check_csrf(header_token.as_deref()).is_err() {
            self.check_csrf(form_token.as_deref())?;
        }

        let mut text = fields.remove(TEXT_FIELD).unwrap_or_default();
        if self.options.eol == Eol::Unix {
            text = text.replace("\r\n", "\n");
        }

        writer.set_mime_type(Some("text/plain".into()));
        writer.open().await?;
        let mut decoder = self.decoder();
        let length = decoded_len(text.len() as u64, decoder.is_some());
        let meter = TransferMeter::with_events(Some(length), ctx.events.clone());
        let mut out = Metered::new(&mut *writer, meter.clone());
        write_chunk(&mut out, &mut decoder, text.as_bytes()).await?;
        finish_chunks(&mut out, decoder).await?;
        out.shutdown()
            .await
            .map_err(|e| TransferError::io("cannot flush text", e))?;
        Ok(meter)
    }

    async fn receive_raw(
        &self,
        ctx: &ExchangeContext,
        writer: &mut TransferWriter,
        request: Request,
    ) -> Result<Arc<TransferMeter>, ExchangeError> {
        let headers = request.headers();
        if let Some(name) = header_str(headers, header::CONTENT_DISPOSITION).and_then(disposition_filename) {
            writer.set_remote_name(&name);
        }
        writer.set_mime_type(header_str(headers, header::CONTENT_TYPE).map(str::to_string));
        let length = header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.parse::<u64>().ok());
        let mut decoder = self.decoder();
        let expected_size = length.map(|n| decoded_len(n, decoder.is_some()));
        writer.set_size(expected_size);
        writer.open().await?;

        let mut body = request.into_body().into_data_stream();
        let meter = TransferMeter::with_events(expected_size, ctx.events.clone());
        let mut out = Metered::new(&mut *writer, meter.clone());
        let mut received = 0u64;
        loop {
            let chunk = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(ExchangeError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(ExchangeError::disconnected)?;
            received += chunk.len() as u64;
            write_chunk(&mut out, &mut decoder, &chunk).await?;
        }

        if let Some(expected) = length {
            if received != expected {
                return Err(ExchangeError::disconnected(format!(
                    "received {received} of {expected} bytes"
                )));
            }
        }
        finish_chunks(&mut out, decoder).await?;
        out.shutdown()
            .await
            .map_err(|e| TransferError::io("cannot flush upload", e))?;
        Ok(meter)
    }
}

#[async_trait]
impl Handler for ReceiveHandler {
    async fn serve(
        &self,
        ctx: &ExchangeContext,
        request: Request,
        sink: ResponseSink,
    ) -> Result<Outcome, ExchangeError> {
        if request.method() == Method::GET || request.method() == Method::HEAD {
            if sink.respond(self.upload_page()).is_err() {
                tracing::debug!("client left before the upload page");
            }
            return Ok(Outcome::Pending);
        }

        let mut writer = self.writer.lock().await;
        let meter = match self.receive(ctx, &mut writer, request).await {
            Ok(meter) => meter,
            Err(e) => {
                writer.reset().await;
                return Err(e);
            }
        };

        tracing::debug!(name = writer.name(), bytes = meter.transferred(), "upload committed");
        if sink.respond((StatusCode::OK, "success\n")).is_err() {
            tracing::debug!("client left before the confirmation, upload kept");
        }

        ctx.events
            .raise(SessionEvent::FileDescribed(FileDescription {
                name: writer.name().to_string(),
                path: writer.location().map(Path::to_path_buf),
                mime: writer.mime_type(),
                size: Some(writer.size()),
                transfer_size: meter.transferred(),
                transfer_duration: meter.elapsed(),
                content: writer.take_captured(),
            }))
            .await;
        Ok(Outcome::Completed)
    }
}

/// Decodes base64 that arrives in arbitrary pieces. Whitespace is skipped.
#[derive(Debug, Default)]
struct Base64Chunks {
    pending: Vec<u8>,
}

impl Base64Chunks {
    /// Decodes every complete quantum buffered so far.
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<u8>, ExchangeError> {
        self.pending
            .extend(chunk.iter().copied().filter(|b| !b.is_ascii_whitespace()));
        let whole = self.pending.len() / 4 * 4;
        let decoded = decode_b64(&self.pending[..whole])?;
        self.pending.drain(..whole);
        Ok(decoded)
    }

    /// Decodes the tail, which fails unless the input was padded.
    fn finish(self) -> Result<Vec<u8>, ExchangeError> {
        decode_b64(&self.pending)
    }
}

fn decode_b64(data: &[u8]) -> Result<Vec<u8>, ExchangeError> {
    STANDARD
        .decode(data)
        .map_err(|e| ExchangeError::BadRequest(format!("invalid base64 upload: {e}")))
}

/// Upper bound of the decoded size of `len` bytes when decoding.
fn decoded_len(len: u64, decoding: bool) -> u64 {
    if decoding {
        len.div_ceil(4) * 3
    } else {
        len
    }
}

async fn write_chunk<W>(
    out: &mut W,
    decoder: &mut Option<Base64Chunks>,
    chunk: &[u8],
) -> Result<(), ExchangeError>
where
    W: AsyncWrite + Unpin,
{
    let written = match decoder {
        Some(decoder) => out.write_all(&decoder.push(chunk)?).await,
        None => out.write_all(chunk).await,
    };
    written.map_err(|e| TransferError::io("cannot write upload", e).into())
}

async fn finish_chunks<W>(out: &mut W, decoder: Option<Base64Chunks>) -> Result<(), ExchangeError>
where
    W: AsyncWrite + Unpin,
{
    let Some(decoder) = decoder else {
        return Ok(());
    };
    out.write_all(&decoder.finish()?)
        .await
        .map_err(|e| TransferError::io("cannot write upload", e).into())
}

async fn next_field<'a>(
    multipart: &'a mut Multipart,
) -> Result<axum::extract::multipart::Field<'a>, ExchangeError> {
    multipart
        .next_field()
        .await
        .map_err(|e| ExchangeError::BadRequest(e.body_text()))?
        .ok_or_else(|| ExchangeError::BadRequest("multipart body has no file part".into()))
}

fn header_str(headers: &HeaderMap, name: impl header::AsHeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// `filename` parameter of a `Content-Disposition` header.
fn disposition_filename(value: &str) -> Option<String> {
    value.split(';').find_map(|param| {
        let (key, val) = param.split_once('=')?;
        (key.trim().eq_ignore_ascii_case("filename"))
            .then(|| val.trim().trim_matches('"').to_string())
            .filter(|name| !name.is_empty())
    })
}

fn escape_attr(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Splits a receive location into the directory to write in and, when the
/// location is not an existing directory, the file name to save as.
fn resolve_destination(location: &Path) -> anyhow::Result<(PathBuf, Option<String>)> {
    if location.is_dir() {
        ensure_writable(location)?;
        return Ok((location.to_path_buf(), None));
    }
    let file_name = location
        .file_name()
        .ok_or_else(|| anyhow!("Destination {} has no file name", location.display()))?
        .to_string_lossy()
        .into_owned();
    let dir = location
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    ensure_writable(dir)?;
    Ok((dir.to_path_buf(), Some(file_name)))
}

/// Fails unless a file can be created in `dir`.
fn ensure_writable(dir: &Path) -> anyhow::Result<()> {
    let meta = std::fs::metadata(dir)
        .with_context(|| format!("Destination {} does not exist", dir.display()))?;
    ensure!(meta.is_dir(), "Destination {} is not a directory", dir.display());

    let scratch = dir.join(format!(".oneshot-{}", random_name()));
    std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&scratch)
        .with_context(|| format!("Destination {} is not writable", dir.display()))?;
    if let Err(e) = std::fs::remove_file(&scratch) {
        tracing::warn!(path = %scratch.display(), error = %e, "Failed to remove write check file");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventSender};
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;

    fn ctx(events: EventSender) -> ExchangeContext {
        ExchangeContext::new(events, CancellationToken::new(), None)
    }

    fn post(content_type: &str, body: &'static str) -> Request {
        Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    #[tokio::test]
    async fn test_raw_body_written_exactly() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(dir.path()).with_name(Some("out.txt".into())),
            ReceiveOptions::default(),
        );
        let (tx, mut rx) = events::channel(64);

        let (sink, answer) = ResponseSink::detached();
        let outcome = handler
            .serve(&ctx(tx), post("application/octet-stream", "SUCCESS"), sink)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Completed);
        assert_eq!(answer.await.unwrap().status(), StatusCode::OK);

        let written = std::fs::read(dir.path().join("out.txt")).unwrap();
        assert_eq!(written, b"SUCCESS");

        let mut described = None;
        while let Ok(event) = rx.try_next() {
            if let SessionEvent::FileDescribed(file) = event {
                described = Some(file);
            }
        }
        let file = described.unwrap();
        assert_eq!(file.transfer_size, 7);
        assert_eq!(file.path, Some(dir.path().join("out.txt")));
    }

    #[tokio::test]
    async fn test_form_text_normalises_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(dir.path()).with_name(Some("note.txt".into())),
            ReceiveOptions::default(),
        );
        let (sink, _answer) = ResponseSink::detached();
        handler
            .serve(
                &ctx(EventSender::detached()),
                post("application/x-www-form-urlencoded", "text=a%0D%0Ab"),
                sink,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("note.txt")).unwrap(), b"a\nb");
    }

    #[tokio::test]
    async fn test_wrong_csrf_token_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(dir.path()),
            ReceiveOptions {
                csrf_token: Some("secret".into()),
                ..Default::default()
            },
        );
        let (sink, _answer) = ResponseSink::detached();
        let err = handler
            .serve(
                &ctx(EventSender::detached()),
                post("application/x-www-form-urlencoded", "csrf-token=nope&text=hi"),
                sink,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_multipart_with_csrf_part() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(dir.path()),
            ReceiveOptions {
                csrf_token: Some("secret".into()),
                ..Default::default()
            },
        );
        let body = "--XYZ\r\n\
            Content-Disposition: form-data; name=\"csrf-token\"\r\n\r\n\
            secret\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            SUCCESS\r\n\
            --XYZ--\r\n";
        let (sink, _answer) = ResponseSink::detached();
        handler
            .serve(
                &ctx(EventSender::detached()),
                post("multipart/form-data; boundary=XYZ", body),
                sink,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("hello.txt")).unwrap(), b"SUCCESS");
    }

    #[tokio::test]
    async fn test_get_serves_form_without_concluding() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(dir.path()),
            ReceiveOptions {
                csrf_token: Some("tok\"en".into()),
                ..Default::default()
            },
        );
        let (sink, answer) = ResponseSink::detached();
        let get = Request::builder().uri("/").body(Body::empty()).unwrap();
        let outcome = handler
            .serve(&ctx(EventSender::detached()), get, sink)
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Pending);

        let body = answer.await.unwrap().into_body().collect().await.unwrap().to_bytes();
        let html = String::from_utf8(body.to_vec()).unwrap();
        assert!(html.contains(r#"name="csrf-token" value="tok&quot;en""#));
        assert!(files_in(dir.path()).is_empty());
    }

    #[test]
    fn test_disposition_filename() {
        assert_eq!(
            disposition_filename(r#"attachment; filename="report.pdf""#).as_deref(),
            Some("report.pdf")
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[test]
    fn test_destination_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ensure_writable(dir.path()).is_ok());
        assert!(files_in(dir.path()).is_empty());
        assert!(ensure_writable(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_file_path_destination_is_split() {
        let dir = tempfile::tempdir().unwrap();
        let (resolved, name) = resolve_destination(dir.path()).unwrap();
        assert_eq!(resolved, dir.path());
        assert!(name.is_none());

        let (resolved, name) = resolve_destination(&dir.path().join("new.txt")).unwrap();
        assert_eq!(resolved, dir.path());
        assert_eq!(name.as_deref(), Some("new.txt"));

        assert!(resolve_destination(&dir.path().join("missing").join("x.txt")).is_err());
    }

    #[tokio::test]
    async fn test_receive_into_new_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let (resolved, name) = resolve_destination(&dir.path().join("out.txt")).unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(resolved).with_name(name),
            ReceiveOptions::default(),
        );
        let (sink, _answer) = ResponseSink::detached();
        handler
            .serve(&ctx(EventSender::detached()), post("text/plain", "SUCCESS"), sink)
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("out.txt")).unwrap(), b"SUCCESS");
        assert_eq!(files_in(dir.path()).len(), 1);
    }

    #[tokio::test]
    async fn test_base64_upload_stored_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(dir.path()).with_name(Some("decoded.txt".into())),
            ReceiveOptions {
                decode_b64: true,
                ..Default::default()
            },
        );
        let (sink, _answer) = ResponseSink::detached();
        handler
            .serve(
                &ctx(EventSender::detached()),
                post("application/octet-stream", "U1VD\nQ0VTUw==\n"),
                sink,
            )
            .await
            .unwrap();
        assert_eq!(std::fs::read(dir.path().join("decoded.txt")).unwrap(), b"SUCCESS");
    }

    #[tokio::test]
    async fn test_invalid_base64_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let handler = ReceiveHandler::new(
            TransferWriter::to_dir(dir.path()).with_name(Some("decoded.txt".into())),
            ReceiveOptions {
                decode_b64: true,
                ..Default::default()
            },
        );
        let (sink, _answer) = ResponseSink::detached();
        let err = handler
            .serve(
                &ctx(EventSender::detached()),
                post("application/octet-stream", "not base64!"),
                sink,
            )
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        assert!(files_in(dir.path()).is_empty());
    }

    #[test]
    fn test_base64_split_across_chunks() {
        let mut decoder = Base64Chunks::default();
        let mut out = decoder.push(b"U1").unwrap();
        assert!(out.is_empty());
        out.extend(decoder.push(b"VDQ0").unwrap());
        out.extend(decoder.push(b"VTUw==").unwrap());
        out.extend(decoder.finish().unwrap());
        assert_eq!(out, b"SUCCESS");
    }
}
