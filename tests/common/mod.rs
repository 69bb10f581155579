#![allow(dead_code)]

pub mod config_test_utils;

use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use oneshot::common::OutputFormat;
use oneshot::events;
use oneshot::report::{Report, ReportOptions, Reporter};
use oneshot::server::{Arbiter, ArbiterConfig, Handler, ServeSummary};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

/// In-memory report destination shared with the reporter task.
#[derive(Clone, Default)]
pub struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    pub fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).expect("report is UTF-8")
    }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// An arbiter serving on a loopback port, with a reporter attached.
pub struct Running {
    pub addr: SocketAddr,
    pub cancel: CancellationToken,
    pub output: Captured,
    serve: JoinHandle<ServeSummary>,
    reporter: Reporter,
}

impl Running {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Waits for the run to conclude and the report to be written.
    pub async fn finish(self) -> (ServeSummary, Report) {
        let summary = self.serve.await.expect("serve task panicked");
        let report = self
            .reporter
            .finish(summary.conclusion)
            .await
            .expect("reporter failed");
        (summary, report)
    }
}

pub async fn start<H: Handler>(handler: H, config: ArbiterConfig) -> Running {
    start_with_format(handler, config, OutputFormat::Json).await
}

pub async fn start_with_format<H: Handler>(
    handler: H,
    config: ArbiterConfig,
    format: OutputFormat,
) -> Running {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test listener");
    let addr = listener.local_addr().expect("bound address");

    let (events, receiver) = events::channel(events::DEFAULT_CAPACITY);
    let output = Captured::default();
    let reporter = Reporter::spawn(
        receiver,
        ReportOptions {
            format,
            compact: true,
            color: false,
            ..Default::default()
        },
        Box::new(output.clone()),
        false,
    );

    let cancel = CancellationToken::new();
    let arbiter = Arbiter::new(handler, events, cancel.clone(), config);
    let serve = tokio::spawn(arbiter.serve(listener));

    Running {
        addr,
        cancel,
        output,
        serve,
        reporter,
    }
}

/// Plain client without connection reuse surprises or redirects.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to build client")
}
