//! Human-readable sizes, rates and progress lines.

use std::time::Duration;

use crate::transfer::ProgressSample;

const KB: f64 = 1_000.0;
const MB: f64 = 1_000_000.0;
const GB: f64 = 1_000_000_000.0;

/// Byte count with decimal units.
pub fn pretty_size(bytes: u64) -> String {
    let b = bytes as f64;
    if b < KB {
        format!("{bytes} B")
    } else if b < MB {
        format!("{:.3} KB", b / KB)
    } else if b < GB {
        format!("{:.3} MB", b / MB)
    } else {
        format!("{:.3} GB", b / GB)
    }
}

/// Throughput with decimal units.
pub fn pretty_rate(bytes_per_sec: f64) -> String {
    if bytes_per_sec < KB {
        format!("{bytes_per_sec:.2} B/s")
    } else if bytes_per_sec < MB {
        format!("{:.2} KB/s", bytes_per_sec / KB)
    } else if bytes_per_sec < GB {
        format!("{:.2} MB/s", bytes_per_sec / MB)
    } else {
        format!("{:.2} GB/s", bytes_per_sec / GB)
    }
}

/// `size * 1e9 / duration_ns` bytes per second; `None` for a zero duration.
pub fn transfer_rate(size: u64, duration: Duration) -> Option<f64> {
    let nanos = duration.as_nanos();
    if nanos == 0 {
        return None;
    }
    Some(size as f64 * 1e9 / nanos as f64)
}

pub fn pretty_duration(duration: Duration) -> String {
    format!("{duration:.2?}")
}

/// Percentage when the total is known, otherwise the running byte count.
pub fn progress_line(sample: &ProgressSample) -> String {
    let mut line = match sample.total {
        Some(total) if total > 0 => {
            let percent = sample.transferred as f64 * 100.0 / total as f64;
            format!(
                "transfer progress: {percent:.2}% ({} of {})",
                pretty_size(sample.transferred),
                pretty_size(total)
            )
        }
        _ => format!("transferred: {}", pretty_size(sample.transferred)),
    };
    if let Some(rate) = transfer_rate(sample.transferred, sample.elapsed) {
        line.push_str(&format!(" at {}", pretty_rate(rate)));
    }
    line
}
