//! Run lifecycle: signal handling, the overall deadline, and one serve loop.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{Arbiter, ArbiterConfig, Handler, Listener, ServeSummary};
use crate::events::EventSender;

/// Serves `handler` on `listener` until the exchange happened, nobody came,
/// Ctrl+C was pressed, or `deadline` passed.
pub async fn run<H, L>(
    handler: H,
    listener: L,
    config: ArbiterConfig,
    deadline: Option<Duration>,
    events: EventSender,
    cancel: CancellationToken,
) -> ServeSummary
where
    H: Handler,
    L: Listener,
{
    // Spawn Ctrl+C handler: cancels the run on the first Ctrl+C
    let signal_token = cancel.clone();
    let ctrl_c_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            tracing::error!("Failed to listen for Ctrl+C");
            return;
        }
        tracing::info!("Ctrl+C received - shutting down");
        signal_token.cancel();
    });

    let deadline_task = deadline.map(|deadline| spawn_deadline(deadline, cancel.clone()));

    let summary = Arbiter::new(handler, events, cancel, config)
        .serve(listener)
        .await;

    ctrl_c_task.abort();
    let _ = ctrl_c_task.await;
    if let Some(task) = deadline_task {
        task.abort();
    }

    summary
}

fn spawn_deadline(deadline: Duration, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(?deadline, "deadline reached - shutting down");
                cancel.cancel();
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Conclusion, ExchangeContext, Outcome, ResponseSink};
    use crate::common::ExchangeError;
    use axum::extract::Request;

    struct NeverCalled;

    #[async_trait::async_trait]
    impl Handler for NeverCalled {
        async fn serve(
            &self,
            _ctx: &ExchangeContext,
            _request: Request,
            _sink: ResponseSink,
        ) -> Result<Outcome, ExchangeError> {
            unreachable!("no client connects in these tests")
        }
    }

    #[tokio::test]
    async fn deadline_cancels_the_run() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let summary = run(
            NeverCalled,
            listener,
            ArbiterConfig::default(),
            Some(Duration::from_millis(50)),
            EventSender::detached(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(summary.conclusion, Conclusion::Cancelled);
        assert!(summary.success.is_none());
    }

    #[tokio::test]
    async fn connection_timeout_wins_over_later_deadline() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let config = ArbiterConfig {
            timeout: Duration::from_millis(50),
            ..ArbiterConfig::default()
        };
        let summary = run(
            NeverCalled,
            listener,
            config,
            Some(Duration::from_secs(30)),
            EventSender::detached(),
            CancellationToken::new(),
        )
        .await;
        assert_eq!(summary.conclusion, Conclusion::TimedOut);
        assert_eq!(summary.conclusion.exit_code(), 2);
    }
}
