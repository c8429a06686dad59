//! Source monitors
//!
//! Each monitor family owns its OS handles and one worker thread, emits
//! normalized records to the shared writer, and is stopped exactly once by
//! the supervisor. The capability the supervisor consumes is deliberately
//! narrow: identify the source kind, shut down.

pub mod event_log;
pub mod file_log;
pub mod schema;
pub mod tailer;
pub mod trace;

pub use event_log::{EventLogMonitor, EventMonitorState, EventStream, EventStreamFactory};
pub use file_log::FileLogMonitor;
pub use trace::{TraceBackend, TraceMonitor, TraceSession};

use logship_common::SourceKind;

/// The surface the supervisor drives monitors through.
pub trait SourceMonitor: Send {
    fn kind(&self) -> SourceKind;

    /// Signals the worker, completes any in-flight record write, releases OS
    /// handles, and joins within the bounded timeout. Idempotent.
    fn shutdown(&mut self);
}
