use anyhow::Result;
use chrono::Utc;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::codec::hex_dump;

/// Session event sink. Every hook defaults to a no-op.
pub trait Logger: Send + Sync {
    fn sent(&self, _frame: &[u8]) {}
    fn received(&self, _reply: &[u8]) {}
    fn transfer_done(&self, _op: &str, _remote: &str, _bytes: u64) {}
    fn delete(&self, _remote: &str) {}
    fn error(&self, _context: &str, _remote: &str, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    out: Mutex<Box<dyn Write + Send>>,
    verbose: bool,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P, verbose: bool) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            out: Mutex::new(Box::new(f)),
            verbose,
        })
    }

    pub fn stderr(verbose: bool) -> Self {
        Self {
            out: Mutex::new(Box::new(std::io::stderr())),
            verbose,
        }
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.out.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl Logger for TextLogger {
    fn sent(&self, frame: &[u8]) {
        if self.verbose {
            self.line(&format!("SENT bytes={}\n{}", frame.len(), hex_dump(frame)));
        }
    }
    fn received(&self, reply: &[u8]) {
        if self.verbose {
            self.line(&format!("RECEIVED bytes={}\n{}", reply.len(), hex_dump(reply)));
        }
    }
    fn transfer_done(&self, op: &str, remote: &str, bytes: u64) {
        self.line(&format!("{} remote={} bytes={}", op, remote, bytes));
    }
    fn delete(&self, remote: &str) {
        self.line(&format!("DELETE remote={}", remote));
    }
    fn error(&self, context: &str, remote: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} remote={} msg={}", context, remote, msg));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
