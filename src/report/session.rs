//! The report model and the accumulator that builds it from events.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Serialize;

use super::format::transfer_rate;
use crate::events::{FileDescription, HttpRequest, SessionEvent};

/// One client's attempt at the exchange.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ClientSession {
    pub request: HttpRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct FileReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(rename = "MIME")]
    pub mime: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    pub transfer_size: u64,
    /// Nanoseconds.
    pub transfer_duration: u64,
    /// Bytes per second; absent when the duration rounds to zero.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_rate: Option<u64>,
    /// UTF-8 text, or base64 when the bytes are not valid UTF-8.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

impl FileReport {
    pub fn from_description(file: FileDescription, include_content: bool) -> Self {
        let rate = transfer_rate(file.transfer_size, file.transfer_duration);
        let content = file
            .content
            .filter(|_| include_content)
            .map(|bytes| match std::str::from_utf8(&bytes) {
                Ok(text) => text.to_string(),
                Err(_) => STANDARD.encode(&bytes),
            });

        Self {
            name: file.name,
            path: file.path.map(|p| p.display().to_string()),
            mime: file.mime,
            size: file.size,
            transfer_size: file.transfer_size,
            transfer_duration: u64::try_from(file.transfer_duration.as_nanos()).unwrap_or(u64::MAX),
            transfer_rate: rate.map(|r| r.round() as u64),
            content,
        }
    }
}

/// Everything that happened in one run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    pub success: Option<ClientSession>,
    pub attempts: Vec<ClientSession>,
}

/// Folds events into a [`Report`].
///
/// `RequestReceived` opens a session. `ExchangeSucceeded` closes it as the
/// success (once; a second one is kept as an attempt), `ClientDisconnected`
/// closes it as an attempt. A session never closed is dropped when the next
/// one opens or the log finishes.
#[derive(Debug, Default)]
pub struct SessionLog {
    current: Option<ClientSession>,
    report: Report,
    include_content: bool,
}

impl SessionLog {
    pub fn new(include_content: bool) -> Self {
        Self {
            include_content,
            ..Self::default()
        }
    }

    pub fn current(&self) -> Option<&ClientSession> {
        self.current.as_ref()
    }

    pub fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::RequestReceived(request) => {
                if self.current.is_some() {
                    tracing::debug!("dropping session that never concluded");
                }
                self.current = Some(ClientSession {
                    request,
                    file: None,
                    error: None,
                });
            }
            SessionEvent::FileDescribed(file) => match self.current.as_mut() {
                Some(session) => {
                    session.file = Some(FileReport::from_description(file, self.include_content))
                }
                None => tracing::debug!("file description without an open session"),
            },
            SessionEvent::TransferProgressSample(_) => {}
            SessionEvent::ClientDisconnected { error } => {
                if let Some(mut session) = self.current.take() {
                    session.error = Some(error);
                    self.report.attempts.push(session);
                }
            }
            SessionEvent::ExchangeSucceeded => {
                if let Some(session) = self.current.take() {
                    if self.report.success.is_none() {
                        self.report.success = Some(session);
                    } else {
                        tracing::warn!("second success recorded as an attempt");
                        self.report.attempts.push(session);
                    }
                }
            }
        }
    }

    pub fn finish(self) -> Report {
        self.report
    }
}
