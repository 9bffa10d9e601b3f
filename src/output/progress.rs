//! Terminal progress bars for the fetch passes
//!
//! Bars are drawn only when stderr is a terminal and output is not quiet.
//! Otherwise every bar is hidden but still counts, so callers never branch
//! on visibility.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::{IsTerminal, Write};
use tracing_subscriber::fmt::MakeWriter;

fn pass_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{prefix:<16.cyan.bold} {bar:30.green/dim} {pos:>6}/{len:6} {eta:>4} {wide_msg:.dim}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━━")
}

/// Owned progress display shared by the passes
#[derive(Debug)]
pub struct ProgressReporter {
    multi: MultiProgress,
    visible: bool,
}

impl ProgressReporter {
    /// Draws bars when `enabled` and stderr is a terminal
    pub fn new(enabled: bool) -> Self {
        let visible = enabled && std::io::stderr().is_terminal();
        let multi = MultiProgress::new();
        if !visible {
            multi.set_draw_target(ProgressDrawTarget::hidden());
        }
        Self { multi, visible }
    }

    /// Reporter that never draws
    pub fn hidden() -> Self {
        Self::new(false)
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// Adds a bar of `total` steps labelled `label`
    ///
    /// Callers advance it as work settles and finish it when the pass ends.
    pub fn bar(&self, label: &str, total: u64) -> ProgressBar {
        if !self.visible {
            return ProgressBar::with_draw_target(Some(total), ProgressDrawTarget::hidden());
        }
        let bar = self.multi.add(ProgressBar::new(total));
        bar.set_style(pass_style());
        // Long slugs would push the bar out of line
        let prefix: String = label.chars().take(16).collect();
        bar.set_prefix(prefix);
        bar
    }

    /// Log writer that clears the bars around each line
    pub fn log_writer(&self) -> LogBridge {
        LogBridge {
            multi: self.multi.clone(),
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::hidden()
    }
}

/// `tracing` writer that prints through the progress display
#[derive(Debug, Clone)]
pub struct LogBridge {
    multi: MultiProgress,
}

impl Write for LogBridge {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.multi.suspend(|| std::io::stderr().write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        std::io::stderr().flush()
    }
}

impl<'a> MakeWriter<'a> for LogBridge {
    type Writer = LogBridge;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_reporter_is_hidden() {
        let reporter = ProgressReporter::new(false);
        assert!(!reporter.is_visible());
        assert!(!ProgressReporter::hidden().is_visible());
    }

    #[test]
    fn test_hidden_bar_still_counts() {
        let reporter = ProgressReporter::hidden();
        let bar = reporter.bar("serie-with-a-very-long-slug", 10);
        bar.inc(4);
        bar.inc(3);
        assert_eq!(bar.position(), 7);
        assert_eq!(bar.length(), Some(10));
        bar.finish_and_clear();
    }
}
