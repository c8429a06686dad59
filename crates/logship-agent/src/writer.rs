//! Serialized record output
//!
//! Every monitor worker shares one [`LogWriter`]. A record is written with a
//! single locked `write_all`, so bytes from two records never interleave no
//! matter how many workers are emitting.

use std::io::{self, Write};

use parking_lot::Mutex;

const ERROR_PREFIX: &str = "LOGSHIP ERROR:";
const WARNING_PREFIX: &str = "LOGSHIP WARNING:";

pub struct LogWriter {
    out: Mutex<Box<dyn Write + Send>>,
}

impl LogWriter {
    /// Writer over the process standard output, the normal sink: the
    /// container runtime captures it.
    pub fn stdout() -> Self {
        Self::with_sink(Box::new(io::stdout()))
    }

    /// Writer over an arbitrary sink; used by tests to capture output.
    pub fn with_sink(sink: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(sink) }
    }

    /// Writes one record as a single newline-terminated chunk.
    ///
    /// The write is atomic with respect to every other call on this writer.
    /// Output errors are reported on stderr; there is nowhere further
    /// downstream to surface them.
    pub fn write_line(&self, record: &str) {
        let mut out = self.out.lock();
        let result = if record.ends_with('\n') {
            out.write_all(record.as_bytes())
        } else {
            out.write_all(record.as_bytes())
                .and_then(|()| out.write_all(b"\n"))
        };
        if let Err(e) = result.and_then(|()| out.flush()) {
            tracing::error!(error = %e, "failed writing record to output");
        }
    }

    /// Diagnostic line with a distinguished prefix so downstream pipelines
    /// can filter it from record traffic.
    pub fn trace_error(&self, message: &str) {
        tracing::error!("{message}");
        self.write_line(&format!("{ERROR_PREFIX} {message}"));
    }

    pub fn trace_warn(&self, message: &str) {
        tracing::warn!("{message}");
        self.write_line(&format!("{WARNING_PREFIX} {message}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn capture() -> (LogWriter, SharedBuf) {
        let buf = SharedBuf::default();
        (LogWriter::with_sink(Box::new(buf.clone())), buf)
    }

    #[test]
    fn appends_newline_once() {
        let (writer, buf) = capture();
        writer.write_line("plain");
        writer.write_line("terminated\n");
        assert_eq!(String::from_utf8(buf.0.lock().clone()).unwrap(), "plain\nterminated\n");
    }

    #[test]
    fn diagnostics_carry_prefix() {
        let (writer, buf) = capture();
        writer.trace_error("bad thing");
        writer.trace_warn("odd thing");
        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        assert!(text.contains("LOGSHIP ERROR: bad thing"));
        assert!(text.contains("LOGSHIP WARNING: odd thing"));
    }

    #[test]
    fn concurrent_writes_never_interleave() {
        let (writer, buf) = capture();
        let writer = Arc::new(writer);

        let threads: Vec<_> = (0..4u8)
            .map(|t| {
                let writer = Arc::clone(&writer);
                std::thread::spawn(move || {
                    let fill = (b'a' + t) as char;
                    let payload: String = std::iter::repeat(fill).take(8 * 1024).collect();
                    for _ in 0..200 {
                        writer.write_line(&payload);
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let text = String::from_utf8(buf.0.lock().clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 800);
        for line in lines {
            assert_eq!(line.len(), 8 * 1024);
            let first = line.chars().next().unwrap();
            assert!(line.chars().all(|c| c == first), "interleaved record detected");
        }
    }
}
