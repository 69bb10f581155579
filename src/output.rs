//! Startup status on stderr, shown before the reporter takes over.

use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner_style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
        pb.set_style(spinner_style);
    }
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn finish_spinner_success(spinner: &ProgressBar, msg: &str) {
    spinner.finish_with_message(format!("{} {}", style("✓").green().bold(), msg));
}

pub fn finish_spinner_error(spinner: &ProgressBar, msg: &str) {
    spinner.finish_with_message(format!("{} {}", style("✗").red().bold(), msg));
}

/// One line per URL the server can be reached at.
pub fn listening_message(urls: &[String]) -> String {
    let mut message = String::from("listening on");
    for url in urls {
        message.push_str("\n    ");
        message.push_str(url);
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listening_message_lists_every_url() {
        let urls = vec!["http://127.0.0.1:8080".to_string(), "http://10.0.0.2:8080".to_string()];
        assert_eq!(
            listening_message(&urls),
            "listening on\n    http://127.0.0.1:8080\n    http://10.0.0.2:8080"
        );
    }
}
