//! Outbound payload: a file, stdin, or an archive of several paths.

use std::io::{self, Cursor};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio_util::sync::CancellationToken;

use super::{build_archive, random_name, ArchiveMethod, TransferError};
use crate::common::mime;

enum Source {
    File(tokio::fs::File),
    Buffer(Cursor<Bytes>),
    Stdin(tokio::io::Stdin),
}

/// Streaming source for the send side.
///
/// Nothing touches the filesystem until [`open`](Self::open). Drained
/// stdin and built archives are cached, so a failed attempt followed by
/// [`reset`](Self::reset) replays the same bytes on the next one.
pub struct TransferReader {
    sources: Vec<PathBuf>,
    name: Option<String>,
    extension: Option<String>,
    mime_type: Option<String>,
    archive_method: ArchiveMethod,
    stream_stdin: bool,
    cancel: CancellationToken,

    cached: Option<Bytes>,
    is_archive: bool,
    source: Option<Source>,
    size: Option<u64>,
    progress: u64,
    finished: bool,
}

impl TransferReader {
    /// Zero sources read stdin; one file is sent as is; a directory or
    /// several paths are archived.
    pub fn new(sources: Vec<PathBuf>) -> Self {
        Self {
            sources,
            name: None,
            extension: None,
            mime_type: None,
            archive_method: ArchiveMethod::default(),
            stream_stdin: false,
            cancel: CancellationToken::new(),
            cached: None,
            is_archive: false,
            source: None,
            size: None,
            progress: 0,
            finished: false,
        }
    }

    /// A payload whose bytes are already in memory.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        let mut reader = Self::new(Vec::new());
        reader.name = Some(name.into());
        reader.cached = Some(bytes.into());
        reader
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        if let Some(name) = name.filter(|n| !n.is_empty()) {
            self.name = Some(name);
        }
        self
    }

    pub fn with_extension(mut self, extension: Option<String>) -> Self {
        self.extension = extension
            .filter(|e| !e.is_empty())
            .map(|e| format!(".{}", e.trim_start_matches('.')));
        self
    }

    pub fn with_mime_type(mut self, mime_type: Option<String>) -> Self {
        self.mime_type = mime_type.filter(|m| !m.is_empty());
        self
    }

    pub fn with_archive_method(mut self, method: ArchiveMethod) -> Self {
        self.archive_method = method;
        self
    }

    /// Stream stdin instead of draining it first. The size stays unknown.
    pub fn streaming_stdin(mut self, stream: bool) -> Self {
        self.stream_stdin = stream;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Resolves the concrete source. Calling it again while open does nothing.
    pub async fn open(&mut self) -> Result<(), TransferError> {
        if self.source.is_some() {
            return Ok(());
        }

        match self.sources.as_slice() {
            // Built on an earlier attempt; the sources are not looked at again.
            _ if self.is_archive && self.cached.is_some() => self.open_archive().await?,
            [] => self.open_stdin().await?,
            [path] => {
                let path = path.clone();
                let meta = tokio::fs::metadata(&path)
                    .await
                    .map_err(|e| TransferError::io(format!("cannot stat {}", path.display()), e))?;
                if meta.is_dir() {
                    self.open_archive().await?;
                } else {
                    self.open_file(&path, meta.len()).await?;
                }
            }
            _ => self.open_archive().await?,
        }

        self.progress = 0;
        self.finished = false;
        tracing::debug!(
            name = self.name(),
            size = ?self.size,
            archive = self.is_archive,
            "payload opened"
        );
        Ok(())
    }

    async fn open_stdin(&mut self) -> Result<(), TransferError> {
        if self.name.is_none() {
            self.name = Some(random_name());
        }

        if self.cached.is_none() && self.stream_stdin {
            self.source = Some(Source::Stdin(tokio::io::stdin()));
            self.size = None;
            return Ok(());
        }

        let bytes = match &self.cached {
            Some(bytes) => bytes.clone(),
            None => {
                let mut buf = Vec::new();
                tokio::io::stdin()
                    .read_to_end(&mut buf)
                    .await
                    .map_err(|e| TransferError::io("cannot read stdin", e))?;
                let bytes = Bytes::from(buf);
                self.cached = Some(bytes.clone());
                bytes
            }
        };
        self.size = Some(bytes.len() as u64);
        self.source = Some(Source::Buffer(Cursor::new(bytes)));
        Ok(())
    }

    async fn open_file(&mut self, path: &Path, len: u64) -> Result<(), TransferError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::io(format!("cannot open {}", path.display()), e))?;
        if self.name.is_none() {
            self.name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .or_else(|| Some(random_name()));
        }
        self.size = Some(len);
        self.source = Some(Source::File(file));
        Ok(())
    }

    async fn open_archive(&mut self) -> Result<(), TransferError> {
        self.is_archive = true;
        let suffix = self.archive_method.extension();

        let name = match self.name.take() {
            Some(name) => name,
            None => match self.sources.as_slice() {
                [dir] => dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(random_name),
                _ => random_name(),
            },
        };
        self.name = Some(if name.ends_with(suffix) {
            name
        } else {
            format!("{name}{suffix}")
        });

        let bytes = match &self.cached {
            Some(bytes) => bytes.clone(),
            None => {
                let sources = self.sources.clone();
                let method = self.archive_method;
                let cancel = self.cancel.clone();
                let built = tokio::task::spawn_blocking(move || {
                    build_archive(method, &sources, &cancel)
                })
                .await
                .map_err(|e| TransferError::Archive(format!("archive task failed: {e}")))??;
                let bytes = Bytes::from(built);
                self.cached = Some(bytes.clone());
                bytes
            }
        };

        self.size = Some(bytes.len() as u64);
        self.source = Some(Source::Buffer(Cursor::new(bytes)));
        Ok(())
    }

    /// Releases the handle and zeroes progress. Cached bytes survive, so the
    /// next [`open`](Self::open) replays them. Safe to call repeatedly.
    pub fn reset(&mut self) {
        self.source = None;
        self.progress = 0;
        self.finished = false;
    }

    /// Releases the handle. Progress is kept for reporting.
    pub fn close(&mut self) {
        self.source = None;
    }

    pub fn is_open(&self) -> bool {
        self.source.is_some()
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Explicit extension, else the one in the resolved name.
    pub fn extension(&self) -> Option<String> {
        if let Some(ext) = &self.extension {
            return Some(ext.clone());
        }
        let name = self.name.as_deref()?;
        if name.ends_with(".tar.gz") {
            return Some(".tar.gz".to_string());
        }
        Path::new(name)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
    }

    pub fn mime_type(&self) -> String {
        let extension = self.extension();
        mime::resolve(self.mime_type.as_deref(), extension.as_deref())
    }

    /// Known up front for files, archives and drained stdin. For streamed
    /// stdin it is known only once the stream ended.
    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn progress(&self) -> u64 {
        self.progress
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl AsyncRead for TransferReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let Some(source) = this.source.as_mut() else {
            return Poll::Ready(Err(TransferError::Unopened.into_io()));
        };

        let before = buf.filled().len();
        let poll = match source {
            Source::File(file) => Pin::new(file).poll_read(cx, buf),
            Source::Buffer(cursor) => Pin::new(cursor).poll_read(cx, buf),
            Source::Stdin(stdin) => Pin::new(stdin).poll_read(cx, buf),
        };

        if let Poll::Ready(Ok(())) = &poll {
            let n = buf.filled().len() - before;
            this.progress += n as u64;
            if n == 0 && buf.remaining() > 0 && !this.finished {
                this.finished = true;
                if this.size.is_none() {
                    this.size = Some(this.progress);
                }
            }
        }
        poll
    }
}
