//! The five commands, each a [`Handler`](crate::server::Handler) installed
//! into the arbiter.

pub mod exec;
pub mod proxy;
pub mod receive;
pub mod redirect;
pub mod send;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

pub use exec::{ExecHandler, ExecOptions};
pub use proxy::{ProxyHandler, ProxyOptions};
pub use receive::{Eol, ReceiveHandler, ReceiveOptions};
pub use redirect::RedirectHandler;
pub use send::{SendHandler, SendOptions};

use crate::common::{AppConfig, ExchangeError, GarbageFiles};
use crate::events::EventSender;
use crate::server::BodySender;
use crate::transfer::TransferError;

/// What every command gets from `main` when it is built.
#[derive(Debug, Clone)]
pub struct CommandContext {
    pub config: Arc<AppConfig>,
    pub events: EventSender,
    pub cancel: CancellationToken,
    pub garbage: GarbageFiles,
}

/// Parses repeated `NAME=VALUE` arguments.
pub fn parse_headers(raw: &[String]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("Invalid header '{entry}': expected NAME=VALUE");
        };
        let name = HeaderName::try_from(name.trim())
            .with_context(|| format!("Invalid header name in '{entry}'"))?;
        let value = HeaderValue::try_from(value.trim())
            .with_context(|| format!("Invalid header value in '{entry}'"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Copies `reader` into a streamed response body until EOF. A read failure
/// or cancellation aborts the body so the client sees a truncated response.
pub(crate) async fn pump<R>(
    reader: R,
    body: &mut BodySender,
    cancel: &CancellationToken,
) -> Result<(), ExchangeError>
where
    R: AsyncRead + Unpin,
{
    let mut chunks = ReaderStream::new(reader);
    let copy = async {
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| TransferError::io("cannot read payload", e))?;
            body.send(chunk).await?;
        }
        Ok::<(), ExchangeError>(())
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
        result = copy => result,
    }
}
