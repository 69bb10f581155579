//! `exec`: run a program per attempt, request body in, stdout out.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::{anyhow, bail, Context as _};
use async_trait::async_trait;
use axum::extract::Request;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use futures_util::TryStreamExt;
use tokio::process::Command;
use tokio_util::io::StreamReader;

use super::pump;
use crate::common::{mime, ExchangeError};
use crate::events::{FileDescription, SessionEvent};
use crate::server::{ExchangeContext, Handler, Outcome, ResponseSink};
use crate::transfer::{Metered, TransferMeter};

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub program: String,
    pub args: Vec<String>,
    pub dir: Option<PathBuf>,
    /// Added to the inherited environment.
    pub env: Vec<(String, String)>,
    pub headers: HeaderMap,
    /// `headers` replace the default response headers instead of adding to them.
    pub replace_headers: bool,
    /// Content type of the program's output.
    pub mime: Option<String>,
    /// File the program's stderr is appended to. Unset inherits ours.
    pub stderr: Option<PathBuf>,
}

/// Parses repeated `NAME=VALUE` environment assignments.
pub fn parse_env(raw: &[String]) -> anyhow::Result<Vec<(String, String)>> {
    raw.iter()
        .map(|entry| match entry.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok((name.to_string(), value.to_string())),
            _ => bail!("Invalid environment variable '{entry}': expected NAME=VALUE"),
        })
        .collect()
}

pub struct ExecHandler {
    options: ExecOptions,
}

impl ExecHandler {
    pub fn new(options: ExecOptions) -> anyhow::Result<Self> {
        if options.program.trim().is_empty() {
            bail!("No program given to exec");
        }
        if let Some(path) = &options.stderr {
            open_stderr(path)?;
        }
        Ok(Self { options })
    }

    fn stderr(&self) -> anyhow::Result<Stdio> {
        match &self.options.stderr {
            Some(path) => Ok(Stdio::from(open_stderr(path)?)),
            None => Ok(Stdio::inherit()),
        }
    }

    fn command(&self, ctx: &ExchangeContext, request: &Request) -> anyhow::Result<Command> {
        let header = |name: header::HeaderName| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };

        let mut command = Command::new(&self.options.program);
        command
            .args(&self.options.args)
            .envs(self.options.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("REQUEST_METHOD", request.method().as_str())
            .env("REQUEST_URI", request.uri().to_string())
            .env("QUERY_STRING", request.uri().query().unwrap_or(""))
            .env(
                "REMOTE_ADDR",
                ctx.remote_addr.map(|a| a.to_string()).unwrap_or_default(),
            )
            .env("CONTENT_TYPE", header(header::CONTENT_TYPE))
            .env("CONTENT_LENGTH", header(header::CONTENT_LENGTH))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(self.stderr()?)
            .kill_on_drop(true);
        if let Some(dir) = &self.options.dir {
            command.current_dir(dir);
        }
        Ok(command)
    }

    fn mime_type(&self) -> String {
        mime::resolve(self.options.mime.as_deref(), None)
    }

    fn response_headers(&self) -> Result<HeaderMap, ExchangeError> {
        if self.options.replace_headers {
            return Ok(self.options.headers.clone());
        }
        let mut headers = HeaderMap::new();
        let content_type = HeaderValue::try_from(self.mime_type())
            .context("MIME type is not a valid header value")?;
        headers.insert(header::CONTENT_TYPE, content_type);
        headers.extend(self.options.headers.clone());
        Ok(headers)
    }
}

#[async_trait]
impl Handler for ExecHandler {
    async fn serve(
        &self,
        ctx: &ExchangeContext,
        request: Request,
        sink: ResponseSink,
    ) -> Result<Outcome, ExchangeError> {
        let program = &self.options.program;
        let mut child = self
            .command(ctx, &request)?
            .spawn()
            .with_context(|| format!("cannot start {program}"))?;
        tracing::debug!(program, pid = ?child.id(), "started program");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("{program} has no stdout"))?;
        let feeder = child.stdin.take().map(|mut stdin| {
            let body = request.into_body().into_data_stream().map_err(io::Error::other);
            tokio::spawn(async move {
                let mut body = StreamReader::new(body);
                if let Err(e) = tokio::io::copy(&mut body, &mut stdin).await {
                    tracing::debug!(error = %e, "stopped feeding request body to program");
                }
            })
        });

        let meter = TransferMeter::with_events(None, ctx.events.clone());
        let mut body = sink.stream(StatusCode::OK, self.response_headers()?)?;
        if let Err(e) = pump(Metered::new(stdout, meter.clone()), &mut body, &ctx.cancel).await {
            body.abort(e.to_string()).await;
            return Err(e);
        }

        let status = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(ExchangeError::Cancelled),
            status = child.wait() => status.with_context(|| format!("cannot wait for {program}"))?,
        };
        if let Some(feeder) = feeder {
            feeder.abort();
        }
        if !status.success() {
            body.abort(format!("{program} failed")).await;
            return Err(ExchangeError::Internal(anyhow!("{program} exited with {status}")));
        }
        drop(body);
        meter.finish();

        let name = Path::new(program)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| program.clone());
        ctx.events
            .raise(SessionEvent::FileDescribed(FileDescription {
                name,
                path: None,
                mime: self.mime_type(),
                size: Some(meter.transferred()),
                transfer_size: meter.transferred(),
                transfer_duration: meter.elapsed(),
                content: None,
            }))
            .await;
        Ok(Outcome::Completed)
    }
}

fn open_stderr(path: &Path) -> anyhow::Result<std::fs::File> {
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Cannot open stderr file {}", path.display()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::events::EventSender;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tokio_util::sync::CancellationToken;

    fn ctx() -> ExchangeContext {
        ExchangeContext::new(EventSender::detached(), CancellationToken::new(), None)
    }

    fn sh(script: &str) -> ExecHandler {
        ExecHandler::new(ExecOptions {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            ..Default::default()
        })
        .unwrap()
    }

    async fn run(handler: &ExecHandler, request: Request) -> (Result<Outcome, ExchangeError>, Vec<u8>) {
        let (sink, answer) = ResponseSink::detached();
        let collect = tokio::spawn(async move {
            match answer.await {
                Ok(response) => response
                    .into_body()
                    .collect()
                    .await
                    .map(|c| c.to_bytes().to_vec())
                    .unwrap_or_default(),
                Err(_) => Vec::new(),
            }
        });
        let result = handler.serve(&ctx(), request, sink).await;
        (result, collect.await.unwrap())
    }

    #[tokio::test]
    async fn test_body_piped_through_program() {
        let request = Request::builder()
            .method("POST")
            .uri("/run?x=1")
            .body(Body::from("SUCCESS"))
            .unwrap();
        let (result, output) = run(&sh("cat; echo \" $REQUEST_METHOD $QUERY_STRING\""), request).await;
        assert_eq!(result.unwrap(), Outcome::Completed);
        assert_eq!(output, b"SUCCESS POST x=1\n");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_attempt() {
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (result, _) = run(&sh("echo partial; exit 3"), request).await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("exit"));
    }

    #[tokio::test]
    async fn test_missing_program_is_internal_error() {
        let handler = ExecHandler::new(ExecOptions {
            program: "/no/such/program".into(),
            ..Default::default()
        })
        .unwrap();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (result, _) = run(&handler, request).await;
        assert_eq!(result.unwrap_err().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_parse_env() {
        let env = parse_env(&["A=1".into(), "B=x=y".into()]).unwrap();
        assert_eq!(env, vec![("A".into(), "1".into()), ("B".into(), "x=y".into())]);
        assert!(parse_env(&["=oops".into()]).is_err());
    }

    #[tokio::test]
    async fn test_stderr_goes_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stderr.log");
        let handler = ExecHandler::new(ExecOptions {
            program: "sh".into(),
            args: vec!["-c".into(), "echo oops >&2; echo out".into()],
            stderr: Some(log.clone()),
            ..Default::default()
        })
        .unwrap();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let (result, output) = run(&handler, request).await;
        assert_eq!(result.unwrap(), Outcome::Completed);
        assert_eq!(output, b"out\n");
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "oops\n");
    }

    #[test]
    fn test_unopenable_stderr_file_rejected_at_setup() {
        let result = ExecHandler::new(ExecOptions {
            program: "true".into(),
            stderr: Some("/no/such/dir/stderr.log".into()),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_replace_headers_drops_content_type() {
        let mut headers = HeaderMap::new();
        headers.insert("x-run", HeaderValue::from_static("1"));
        let extending = ExecHandler::new(ExecOptions {
            program: "true".into(),
            headers: headers.clone(),
            ..Default::default()
        })
        .unwrap();
        let extended = extending.response_headers().unwrap();
        assert!(extended.contains_key(header::CONTENT_TYPE));
        assert_eq!(extended["x-run"], "1");

        let replacing = ExecHandler::new(ExecOptions {
            program: "true".into(),
            headers,
            replace_headers: true,
            ..Default::default()
        })
        .unwrap();
        let replaced = replacing.response_headers().unwrap();
        assert!(!replaced.contains_key(header::CONTENT_TYPE));
        assert_eq!(replaced["x-run"], "1");
    }
}
