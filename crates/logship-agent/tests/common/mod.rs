//! Shared fixtures for integration tests

use std::io::{self, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use logship_agent::LogWriter;

/// In-memory sink capturing everything the agent would write to stdout.
#[derive(Clone, Default)]
pub struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Capture {
    pub fn text(&self) -> String {
        String::from_utf8(self.buf.lock().clone()).expect("captured output is UTF-8")
    }

    pub fn lines(&self) -> Vec<String> {
        self.text().lines().map(str::to_string).collect()
    }

    /// Polls until at least `count` lines arrived or the timeout elapses.
    pub fn wait_for_lines(&self, count: usize, timeout: Duration) -> Vec<String> {
        let deadline = Instant::now() + timeout;
        loop {
            let lines = self.lines();
            if lines.len() >= count || Instant::now() >= deadline {
                return lines;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }
}

struct CaptureSink(Capture);

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.buf.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn capture_writer() -> (Arc<LogWriter>, Capture) {
    let capture = Capture::default();
    let writer = Arc::new(LogWriter::with_sink(Box::new(CaptureSink(capture.clone()))));
    (writer, capture)
}

/// Generous settle time for the polling watcher to pick up a change.
pub const SETTLE: Duration = Duration::from_secs(5);
