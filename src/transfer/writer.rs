//! Inbound payload: a file in a destination directory, or stdout.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{random_name, TransferError};
use crate::common::{mime, GarbageFiles};

const MAX_NAME_ATTEMPTS: u32 = 1000;

enum Sink {
    File(tokio::fs::File),
    Stdout(tokio::io::Stdout),
    Capture,
}

/// Streaming sink for the receive side.
///
/// A file created by this writer is removed again unless [`close`](Self::close)
/// committed it: explicitly by [`reset`](Self::reset) after a failed attempt,
/// or on drop.
pub struct TransferWriter {
    dir: Option<PathBuf>,
    name: Option<String>,
    user_named: bool,
    mime_type: Option<String>,
    capture_stdout: bool,
    garbage: Option<GarbageFiles>,

    sink: Option<Sink>,
    location: Option<PathBuf>,
    committed: bool,
    size: Option<u64>,
    progress: u64,
    captured: Vec<u8>,
}

impl TransferWriter {
    /// Writes into `dir`, which must already exist.
    pub fn to_dir(dir: impl Into<PathBuf>) -> Self {
        Self::build(Some(dir.into()))
    }

    /// Writes to stdout.
    pub fn to_stdout() -> Self {
        Self::build(None)
    }

    fn build(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            name: None,
            user_named: false,
            mime_type: None,
            capture_stdout: false,
            garbage: None,
            sink: None,
            location: None,
            committed: false,
            size: None,
            progress: 0,
            captured: Vec::new(),
        }
    }

    /// A name given by the user. It is never replaced by the client's name.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        if let Some(name) = name.and_then(|n| sanitize_name(&n)) {
            self.name = Some(name);
            self.user_named = true;
        }
        self
    }

    /// Keep stdout-bound bytes in memory instead of printing them.
    pub fn capture_stdout(mut self, capture: bool) -> Self {
        self.capture_stdout = capture;
        self
    }

    /// Files that cannot be removed on reset are handed to `garbage`.
    pub fn with_garbage(mut self, garbage: GarbageFiles) -> Self {
        self.garbage = Some(garbage);
        self
    }

    /// Name suggested by the client. Ignored when the user named the output.
    pub fn set_remote_name(&mut self, name: &str) {
        if self.user_named || self.sink.is_some() {
            return;
        }
        if let Some(name) = sanitize_name(name) {
            self.name = Some(name);
        }
    }

    pub fn set_mime_type(&mut self, mime_type: Option<String>) {
        self.mime_type = mime_type.filter(|m| !m.is_empty());
    }

    /// Expected size, when the client announced one.
    pub fn set_size(&mut self, size: Option<u64>) {
        self.size = size;
    }

    /// Creates the destination. Calling it again while open does nothing.
    pub async fn open(&mut self) -> Result<(), TransferError> {
        if self.sink.is_some() {
            return Ok(());
        }

        let Some(dir) = self.dir.clone() else {
            self.sink = Some(if self.capture_stdout {
                Sink::Capture
            } else {
                Sink::Stdout(tokio::io::stdout())
            });
            return Ok(());
        };

        let name = match &self.name {
            Some(name) => name.clone(),
            None => {
                let ext = self
                    .mime_type
                    .as_deref()
                    .and_then(mime::extension_for)
                    .unwrap_or("");
                let name = format!("{}{ext}", random_name());
                self.name = Some(name.clone());
                name
            }
        };

        let (file, location) = if self.user_named {
            let location = dir.join(&name);
            let file = tokio::fs::File::create(&location)
                .await
                .map_err(|e| TransferError::io(format!("cannot create {}", location.display()), e))?;
            (file, location)
        } else {
            create_unique(&dir, &name).await?
        };

        tracing::debug!(path = %location.display(), "receiving into file");
        self.name = location
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .or(Some(name));
        self.location = Some(location);
        self.committed = false;
        self.sink = Some(Sink::File(file));
        Ok(())
    }

    /// Flushes and commits the output. A committed file survives reset and drop.
    pub async fn close(&mut self) -> Result<(), TransferError> {
        match self.sink.take() {
            Some(Sink::File(mut file)) => {
                file.flush()
                    .await
                    .map_err(|e| TransferError::io("cannot flush output file", e))?;
                file.sync_all()
                    .await
                    .map_err(|e| TransferError::io("cannot sync output file", e))?;
            }
            Some(Sink::Stdout(mut stdout)) => {
                stdout
                    .flush()
                    .await
                    .map_err(|e| TransferError::io("cannot flush stdout", e))?;
            }
            Some(Sink::Capture) => {}
            None => return Err(TransferError::Unopened),
        }
        self.committed = true;
        Ok(())
    }

    /// Discards a failed attempt: releases the handle, deletes the
    /// uncommitted file this writer created, zeroes progress and forgets a
    /// generated or client-supplied name. Safe to call repeatedly.
    pub async fn reset(&mut self) {
        self.sink = None;
        if let Some(location) = self.location.take() {
            if !self.committed {
                if let Err(e) = tokio::fs::remove_file(&location).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        tracing::warn!(path = %location.display(), error = %e, "Failed to remove partial file");
                        if let Some(garbage) = &self.garbage {
                            garbage.push(location);
                        }
                    }
                }
            }
        }
        if !self.user_named {
            self.name = None;
        }
        self.mime_type = None;
        self.committed = false;
        self.size = None;
        self.progress = 0;
        self.captured.clear();
    }

    pub fn is_open(&self) -> bool {
        self.sink.is_some()
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    pub fn mime_type(&self) -> String {
        let extension = self
            .name
            .as_deref()
            .and_then(|n| Path::new(n).extension())
            .map(|e| e.to_string_lossy().into_owned());
        mime::resolve(self.mime_type.as_deref(), extension.as_deref())
    }

    /// Where the output went; `None` for stdout.
    pub fn location(&self) -> Option<&Path> {
        self.location.as_deref()
    }

    /// Announced size if any, else the bytes written so far.
    pub fn size(&self) -> u64 {
        self.size.unwrap_or(self.progress)
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Bytes kept by [`capture_stdout`](Self::capture_stdout).
    pub fn take_captured(&mut self) -> Option<Bytes> {
        if self.dir.is_some() || !self.capture_stdout {
            return None;
        }
        Some(Bytes::from(std::mem::take(&mut self.captured)))
    }
}

impl AsyncWrite for TransferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = match this.sink.as_mut() {
            None => return Poll::Ready(Err(TransferError::Unopened.into_io())),
            Some(Sink::File(file)) => Pin::new(file).poll_write(cx, buf),
            Some(Sink::Stdout(stdout)) => Pin::new(stdout).poll_write(cx, buf),
            Some(Sink::Capture) => {
                this.captured.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
        };
        if let Poll::Ready(Ok(n)) = &poll {
            this.progress += *n as u64;
        }
        poll
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut().sink.as_mut() {
            None => Poll::Ready(Err(TransferError::Unopened.into_io())),
            Some(Sink::File(file)) => Pin::new(file).poll_flush(cx),
            Some(Sink::Stdout(stdout)) => Pin::new(stdout).poll_flush(cx),
            Some(Sink::Capture) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_flush(cx)
    }
}

/// Drop is synchronous, so the uncommitted file is removed with std::fs.
impl Drop for TransferWriter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        if let Some(location) = &self.location {
            if let Err(e) = std::fs::remove_file(location) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(
                        path = %location.display(),
                        error = %e,
                        "Failed to clean up partial file"
                    );
                }
            }
        }
    }
}

/// Reduces a client-supplied name to a single path component.
fn sanitize_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next().unwrap_or("").trim();
    if last.is_empty() || last == "." || last == ".." || last.contains('\0') {
        return None;
    }
    Some(last.to_string())
}

/// Creates `dir/name`, or `dir/name (N).ext` when taken, without clobbering.
async fn create_unique(dir: &Path, name: &str) -> Result<(tokio::fs::File, PathBuf), TransferError> {
    let (base, extensions) = match name.find('.') {
        Some(0) | None => (name, ""),
        Some(pos) => name.split_at(pos),
    };

    for attempt in 0..MAX_NAME_ATTEMPTS {
        let candidate = if attempt == 0 {
            dir.join(name)
        } else {
            dir.join(format!("{base} ({attempt}){extensions}"))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => return Ok((file, candidate)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                return Err(TransferError::io(
                    format!("cannot create {}", candidate.display()),
                    e,
                ))
            }
        }
    }

    Err(TransferError::io(
        format!("no free name for {name} in {}", dir.display()),
        io::Error::from(io::ErrorKind::AlreadyExists),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unopened_write_fails() {
        let dir = TempDir::new().unwrap();
        let mut writer = TransferWriter::to_dir(dir.path());
        let err = writer.write_all(b"x").await.unwrap_err();
        assert!(err.to_string().contains("before open()"));
    }

    #[tokio::test]
    async fn test_reset_before_open_is_harmless() {
        let dir = TempDir::new().unwrap();
        let mut writer = TransferWriter::to_dir(dir.path()).with_name(Some("kept.txt".into()));
        writer.reset().await;
        writer.reset().await;
        assert!(!writer.is_open());
        assert_eq!(writer.name(), "kept.txt");
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());

        writer.open().await.unwrap();
        writer.write_all(b"ok").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(std::fs::read(dir.path().join("kept.txt")).unwrap(), b"ok");
    }

    #[tokio::test]
    async fn test_committed_file_survives() {
        let dir = TempDir::new().unwrap();
        let mut writer = TransferWriter::to_dir(dir.path());
        writer.set_remote_name("upload.txt");
        writer.open().await.unwrap();
        writer.open().await.unwrap();
        writer.write_all(b"SUCCESS").await.unwrap();
        writer.close().await.unwrap();

        let path = dir.path().join("upload.txt");
        assert_eq!(writer.location(), Some(path.as_path()));
        assert_eq!(writer.size(), 7);
        drop(writer);
        assert_eq!(std::fs::read(&path).unwrap(), b"SUCCESS");
    }

    #[tokio::test]
    async fn test_reset_removes_partial_file_and_forgets_name() {
        let dir = TempDir::new().unwrap();
        let mut writer = TransferWriter::to_dir(dir.path());
        writer.set_mime_type(Some("application/json".into()));
        writer.open().await.unwrap();
        writer.write_all(b"{\"half\":").await.unwrap();

        let first = writer.location().unwrap().to_path_buf();
        assert!(first.exists());
        assert!(writer.name().ends_with(".json"));

        writer.reset().await;
        writer.reset().await;
        assert!(!first.exists());
        assert_eq!(writer.progress(), 0);
        assert_eq!(writer.name(), "");
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_drop_removes_uncommitted_file() {
        let dir = TempDir::new().unwrap();
        let mut writer = TransferWriter::to_dir(dir.path()).with_name(Some("out.bin".into()));
        writer.open().await.unwrap();
        writer.write_all(b"partial").await.unwrap();
        drop(writer);
        assert!(!dir.path().join("out.bin").exists());
    }

    #[tokio::test]
    async fn test_user_name_beats_remote_name() {
        let dir = TempDir::new().unwrap();
        let mut writer = TransferWriter::to_dir(dir.path()).with_name(Some("mine.txt".into()));
        writer.set_remote_name("theirs.txt");
        writer.open().await.unwrap();
        assert_eq!(writer.name(), "mine.txt");
        writer.reset().await;
        assert_eq!(writer.name(), "mine.txt");
    }

    #[tokio::test]
    async fn test_collision_gets_counter() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("file.tar.gz"), b"existing").unwrap();

        let mut writer = TransferWriter::to_dir(dir.path());
        writer.set_remote_name("file.tar.gz");
        writer.open().await.unwrap();
        assert_eq!(writer.name(), "file (1).tar.gz");
        writer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_capture_keeps_bytes() {
        let mut writer = TransferWriter::to_stdout().capture_stdout(true);
        writer.open().await.unwrap();
        writer.write_all(b"inline").await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(writer.take_captured().unwrap(), Bytes::from_static(b"inline"));
        assert_eq!(writer.location(), None);
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_name("C:\\Users\\me\\doc.txt").as_deref(), Some("doc.txt"));
        assert_eq!(sanitize_name(".."), None);
        assert_eq!(sanitize_name("dir/"), None);
    }
}
