//! Live terminal output.

use std::io::{self, Write};

use console::style;

use super::format::{pretty_duration, pretty_rate, pretty_size, progress_line, transfer_rate};
use super::session::{ClientSession, Report};
use crate::events::SessionEvent;
use crate::server::Conclusion;

const SAVE_CURSOR: &str = "\x1b7";
const RESTORE_AND_CLEAR: &str = "\x1b8\x1b[K";

/// Renders events as they arrive. In-place progress redraws are used only
/// when `is_term` is set; otherwise only the closing progress line is printed.
pub struct HumanRenderer {
    out: Box<dyn Write + Send>,
    is_term: bool,
    color: bool,
    remote: String,
    progress_drawn: bool,
    progress_done: bool,
}

impl HumanRenderer {
    pub fn new(out: Box<dyn Write + Send>, is_term: bool, color: bool) -> Self {
        Self {
            out,
            is_term,
            color,
            remote: String::new(),
            progress_drawn: false,
            progress_done: false,
        }
    }

    pub fn event(&mut self, event: &SessionEvent) -> io::Result<()> {
        match event {
            SessionEvent::RequestReceived(request) => {
                self.remote = request.remote_addr.clone();
                self.progress_drawn = false;
                self.progress_done = false;
                writeln!(
                    self.out,
                    "{} {} {} from {}",
                    style("→").cyan().force_styling(self.color),
                    request.method,
                    request.request_uri,
                    request.remote_addr
                )?;
            }
            SessionEvent::TransferProgressSample(sample) => {
                if self.progress_done {
                    return Ok(());
                }
                let line = progress_line(sample);
                if self.is_term {
                    let prefix = if self.progress_drawn {
                        RESTORE_AND_CLEAR
                    } else {
                        SAVE_CURSOR
                    };
                    write!(self.out, "{prefix}{line}")?;
                    self.progress_drawn = true;
                    if sample.finished {
                        writeln!(self.out)?;
                        self.progress_done = true;
                    }
                } else if sample.finished {
                    writeln!(self.out, "{line}")?;
                    self.progress_done = true;
                }
            }
            SessionEvent::ClientDisconnected { error } => {
                self.end_progress_line()?;
                writeln!(
                    self.out,
                    "{} attempt from {} failed: {}",
                    style("✗").red().force_styling(self.color),
                    self.remote,
                    error
                )?;
            }
            SessionEvent::FileDescribed(_) | SessionEvent::ExchangeSucceeded => {}
        }
        self.out.flush()
    }

    // Leaves a half-drawn progress line before printing anything else.
    fn end_progress_line(&mut self) -> io::Result<()> {
        if self.progress_drawn && !self.progress_done {
            writeln!(self.out)?;
            self.progress_done = true;
        }
        Ok(())
    }

    pub fn finish(&mut self, report: &Report, conclusion: Option<Conclusion>) -> io::Result<()> {
        self.end_progress_line()?;
        match (&report.success, conclusion) {
            (Some(session), _) => self.success(session)?,
            (None, Some(Conclusion::TimedOut)) => writeln!(
                self.out,
                "{} timed out: nobody connected",
                style("✗").red().force_styling(self.color)
            )?,
            (None, _) => writeln!(
                self.out,
                "{} stopped before a successful exchange ({} failed attempt{})",
                style("✗").red().force_styling(self.color),
                report.attempts.len(),
                if report.attempts.len() == 1 { "" } else { "s" }
            )?,
        }
        self.out.flush()
    }

    fn success(&mut self, session: &ClientSession) -> io::Result<()> {
        let check = style("✓").green().bold().force_styling(self.color);
        let request = &session.request;

        let Some(file) = &session.file else {
            return writeln!(
                self.out,
                "{check} exchange complete: {} {} from {}",
                request.method, request.request_uri, request.remote_addr
            );
        };

        let duration = std::time::Duration::from_nanos(file.transfer_duration);
        let rate = transfer_rate(file.transfer_size, duration)
            .map(pretty_rate)
            .unwrap_or_else(|| "instantaneous".to_string());

        writeln!(self.out, "{check} transfer complete")?;
        writeln!(self.out, "  name:      {}", file.name)?;
        if let Some(path) = &file.path {
            writeln!(self.out, "  saved to:  {path}")?;
        }
        writeln!(self.out, "  MIME type: {}", file.mime)?;
        writeln!(self.out, "  size:      {}", pretty_size(file.size.unwrap_or(file.transfer_size)))?;
        writeln!(self.out, "  duration:  {}", pretty_duration(duration))?;
        writeln!(self.out, "  rate:      {rate}")?;
        writeln!(self.out, "  client:    {}", request.remote_addr)
    }
}
