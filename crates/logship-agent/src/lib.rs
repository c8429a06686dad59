//! logship-agent library
//!
//! Core of the logship sidecar: the serialized stdout writer, the three
//! source-monitor families (event log, file tailing, kernel trace), the
//! config-directory watcher, and the supervisor that diffs configuration
//! changes onto the running monitor set.

pub mod child;
pub mod fswatch;
pub mod monitors;
pub mod signal;
pub mod supervisor;
pub mod worker;
pub mod writer;

pub use supervisor::{MonitorBackends, Supervisor};
pub use worker::StopToken;
pub use writer::LogWriter;
