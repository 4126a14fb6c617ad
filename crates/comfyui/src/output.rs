//! Bounded capture of the server's stdout/stderr.
//!
//! Each stream is read by a [`pump`] task that splits it into lines, logs
//! every line at debug level and keeps the most recent ones in a shared
//! [`OutputBuffer`] so failures can report what the server printed.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};

/// Longest line kept, in bytes. Anything beyond is dropped.
pub const MAX_LINE_BYTES: usize = 2000;

/// Default number of lines retained.
pub const DEFAULT_CAPACITY: usize = 200;

/// Ring buffer of the most recent output lines.
#[derive(Debug)]
pub struct OutputBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    /// The last `n` lines joined with newlines.
    pub fn tail(&self, n: usize) -> String {
        let lines = self.lock();
        let skip = lines.len().saturating_sub(n);
        lines.iter().skip(skip).cloned().collect::<Vec<_>>().join("\n")
    }

    pub fn lines(&self) -> Vec<String> {
        self.lock().iter().cloned().collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<String>> {
        // A panic while holding the lock cannot leave the deque inconsistent.
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Incremental splitter for progress-bar style output.
///
/// `\n` and `\r\n` end a line. A bare `\r` rewinds the current line, so a
/// tqdm bar redrawn a hundred times yields only its final state.
#[derive(Debug, Default)]
pub struct LineSplitter {
    current: Vec<u8>,
    pending_cr: bool,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect the lines it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut complete = Vec::new();
        for &byte in chunk {
            if self.pending_cr {
                self.pending_cr = false;
                if byte != b'\n' {
                    self.current.clear();
                }
            }
            match byte {
                b'\n' => complete.push(self.take_line()),
                b'\r' => self.pending_cr = true,
                _ if self.current.len() < MAX_LINE_BYTES => self.current.push(byte),
                _ => {}
            }
        }
        complete
    }

    /// Flush whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.pending_cr = false;
        if self.current.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.current).into_owned();
        self.current.clear();
        line
    }
}

/// Copy one child stream into `buffer` until EOF.
pub async fn pump<R>(mut reader: R, stream: &'static str, buffer: Arc<OutputBuffer>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(stream, error = %e, "Server output stream closed");
                break;
            }
        };
        for line in splitter.feed(&chunk[..n]) {
            record(&buffer, stream, line);
        }
    }

    if let Some(line) = splitter.finish() {
        record(&buffer, stream, line);
    }
}

fn record(buffer: &OutputBuffer, stream: &'static str, line: String) {
    tracing::debug!(stream, "{line}");
    buffer.push(line);
}
