//! Machine-readable output: the whole report, once, at the end.

use std::io::{self, Write};

use super::session::Report;

pub struct JsonRenderer {
    out: Box<dyn Write + Send>,
    compact: bool,
}

impl JsonRenderer {
    pub fn new(out: Box<dyn Write + Send>, compact: bool) -> Self {
        Self { out, compact }
    }

    pub fn finish(&mut self, report: &Report) -> io::Result<()> {
        let encoded = if self.compact {
            serde_json::to_vec(report)
        } else {
            serde_json::to_vec_pretty(report)
        }
        .map_err(io::Error::other)?;

        self.out.write_all(&encoded)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }
}
