//! The single consumer of the event bus.
//!
//! [`Reporter::spawn`] starts a task that folds every [`SessionEvent`] into a
//! [`SessionLog`] and, in human mode, renders it live. [`Reporter::finish`]
//! drains what is still queued and emits the final output.

#[cfg(test)]
pub(crate) mod captured;
mod format;
mod human;
mod json;
mod session;

use std::io::Write;

use anyhow::Context;
use console::Term;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub use format::{pretty_duration, pretty_rate, pretty_size, progress_line, transfer_rate};
pub use human::HumanRenderer;
pub use json::JsonRenderer;
pub use session::{ClientSession, FileReport, Report, SessionLog};

use crate::common::OutputFormat;
use crate::events::{EventReceiver, SessionEvent};
use crate::server::Conclusion;

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub format: OutputFormat,
    pub compact: bool,
    /// Put received bytes into the JSON report.
    pub include_content: bool,
    /// The payload itself is written to stdout, so status text must not be.
    pub payload_on_stdout: bool,
    pub color: bool,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Human,
            compact: false,
            include_content: false,
            payload_on_stdout: false,
            color: true,
        }
    }
}

enum Renderer {
    Human(HumanRenderer),
    Json(JsonRenderer),
    Quiet,
}

impl Renderer {
    fn event(&mut self, event: &SessionEvent) {
        if let Renderer::Human(human) = self {
            if let Err(e) = human.event(event) {
                tracing::debug!(error = %e, "failed to write status output");
            }
        }
    }

    fn finish(&mut self, report: &Report, conclusion: Option<Conclusion>) -> std::io::Result<()> {
        match self {
            Renderer::Human(human) => human.finish(report, conclusion),
            Renderer::Json(json) => json.finish(report),
            Renderer::Quiet => Ok(()),
        }
    }
}

pub struct Reporter {
    done: oneshot::Sender<Option<Conclusion>>,
    task: JoinHandle<std::io::Result<Report>>,
}

impl Reporter {
    /// Starts the consumer task writing to `out`.
    pub fn spawn(
        receiver: EventReceiver,
        options: ReportOptions,
        out: Box<dyn Write + Send>,
        is_term: bool,
    ) -> Self {
        let renderer = match options.format {
            OutputFormat::Human => Renderer::Human(HumanRenderer::new(out, is_term, options.color)),
            OutputFormat::Json => Renderer::Json(JsonRenderer::new(out, options.compact)),
            OutputFormat::Quiet => Renderer::Quiet,
        };
        let log = SessionLog::new(options.include_content);
        let (done, done_rx) = oneshot::channel();
        let task = tokio::spawn(consume(receiver, renderer, log, done_rx));
        Self { done, task }
    }

    /// Picks stdout or stderr for the chosen format. JSON always goes to
    /// stdout; human text moves to stderr when the payload is on stdout.
    pub fn stdio(receiver: EventReceiver, options: ReportOptions) -> Self {
        let use_stderr =
            options.format == OutputFormat::Human && options.payload_on_stdout;
        let (out, term): (Box<dyn Write + Send>, Term) = if use_stderr {
            (Box::new(std::io::stderr()), Term::stderr())
        } else {
            (Box::new(std::io::stdout()), Term::stdout())
        };
        let is_term = term.is_term();
        let options = ReportOptions {
            color: options.color && is_term,
            ..options
        };
        Self::spawn(receiver, options, out, is_term)
    }

    /// Processes every event still queued, writes the final output and
    /// returns the report.
    pub async fn finish(self, conclusion: Conclusion) -> anyhow::Result<Report> {
        if self.done.send(Some(conclusion)).is_err() {
            tracing::debug!("reporter task already stopped");
        }
        let report = self
            .task
            .await
            .context("reporter task failed")?
            .context("failed to write report")?;
        Ok(report)
    }
}

async fn consume(
    mut receiver: EventReceiver,
    mut renderer: Renderer,
    mut log: SessionLog,
    mut done: oneshot::Receiver<Option<Conclusion>>,
) -> std::io::Result<Report> {
    let conclusion = loop {
        tokio::select! {
            biased;
            Some(event) = receiver.next() => {
                renderer.event(&event);
                log.apply(event);
            }
            conclusion = &mut done => break conclusion.ok().flatten(),
        }
    };

    while let Ok(event) = receiver.try_next() {
        renderer.event(&event);
        log.apply(event);
    }

    let report = log.finish();
    renderer.finish(&report, conclusion)?;
    Ok(report)
}
