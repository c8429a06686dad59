//! Common types and parsing for the logship sidecar
//!
//! This crate provides the vocabulary shared between the agent binary and its
//! monitors: severity levels, the normalized source configuration tree, the
//! record-formatting pipeline, and text-encoding detection.

pub mod config;
pub mod encoding;
pub mod error;
pub mod level;
pub mod record;

pub use config::{
    EventChannel, EventLogSourceConfig, FileSourceConfig, LogConfig, TraceProvider,
    TraceSourceConfig,
};
pub use encoding::TextEncoding;
pub use error::{ConfigError, ConfigResult, MonitorError, MonitorResult};
pub use level::LogLevel;
pub use record::{EventFields, RecordFormat, SourceKind};
