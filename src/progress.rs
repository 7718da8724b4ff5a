//! Spinner-style progress for long transfers
//!
//! Finished files scroll above the spinner line, cargo style. Every event is
//! forwarded to an inner logger so file logs keep working underneath.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::logger::Logger;

pub struct TransferProgress {
    spinner: ProgressBar,
    start_time: Instant,
    files: AtomicU64,
    bytes: AtomicU64,
    show_files: bool,
    inner: Arc<dyn Logger>,
}

impl TransferProgress {
    pub fn new(show_files: bool, inner: Arc<dyn Logger>) -> Self {
        Self::with_bar(ProgressBar::new_spinner(), show_files, inner)
    }

    /// Progress that draws nowhere; counters still update
    pub fn hidden(inner: Arc<dyn Logger>) -> Self {
        let bar = ProgressBar::with_draw_target(None, ProgressDrawTarget::hidden());
        Self::with_bar(bar, false, inner)
    }

    fn with_bar(spinner: ProgressBar, show_files: bool, inner: Arc<dyn Logger>) -> Self {
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        spinner.enable_steady_tick(Duration::from_millis(100));
        Self {
            spinner,
            start_time: Instant::now(),
            files: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            show_files,
            inner,
        }
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.files.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }

    fn refresh(&self) {
        let (files, bytes) = self.totals();
        let secs = self.start_time.elapsed().as_secs_f64();
        let rate = if secs > 0.1 {
            format!(" @ {:.1} KB/s", bytes as f64 / secs / 1024.0)
        } else {
            String::new()
        };
        self.spinner.set_message(format!(
            "Transferring {} files ({:.1} KB) in {:.1}s{}",
            files,
            bytes as f64 / 1024.0,
            secs,
            rate
        ));
    }
}

impl Logger for TransferProgress {
    fn sent(&self, frame: &[u8]) {
        self.inner.sent(frame);
    }

    fn received(&self, reply: &[u8]) {
        self.inner.received(reply);
    }

    fn transfer_done(&self, op: &str, remote: &str, bytes: u64) {
        self.files.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        if self.show_files {
            self.spinner.suspend(|| println!("  {:>4} {}", op, remote));
        }
        self.refresh();
        self.inner.transfer_done(op, remote, bytes);
    }

    fn delete(&self, remote: &str) {
        self.inner.delete(remote);
    }

    fn error(&self, context: &str, remote: &str, msg: &str) {
        self.spinner
            .suspend(|| eprintln!("  {} {}: {}", context, remote, msg));
        self.inner.error(context, remote, msg);
    }

    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        let rate = if seconds > 0.0 {
            bytes as f64 / seconds / 1024.0
        } else {
            0.0
        };
        self.spinner.finish_with_message(format!(
            "Completed {} files ({:.1} KB) in {:.1}s ({:.1} KB/s)",
            files,
            bytes as f64 / 1024.0,
            seconds,
            rate
        ));
        self.inner.done(files, bytes, seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl Logger for Recorder {
        fn transfer_done(&self, op: &str, remote: &str, bytes: u64) {
            self.0.lock().unwrap().push(format!("{op} {remote} {bytes}"));
        }
    }

    #[test]
    fn test_counts_and_forwards() {
        let rec = Arc::new(Recorder::default());
        let progress = TransferProgress::hidden(rec.clone());
        progress.transfer_done("GET", "/c/a", 10);
        progress.transfer_done("GET", "/c/b", 32);
        assert_eq!(progress.totals(), (2, 42));
        assert_eq!(rec.0.lock().unwrap().len(), 2);
    }
}
