//! Normalized records and the shared formatting pipeline
//!
//! Event-log and trace monitors produce the same record shape and feed it
//! through one of three renderings; file monitors emit their lines verbatim
//! and do not pass through here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::error::ConfigError;
use crate::level::LogLevel;

/// Which family of source produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    EventLog,
    File,
    Trace,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SourceKind::EventLog => "EventLog",
            SourceKind::File => "File",
            SourceKind::Trace => "ETW",
        })
    }
}

/// Output rendering for event-shaped records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecordFormat {
    Xml,
    #[default]
    Line,
    Json,
}

impl FromStr for RecordFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("xml") {
            Ok(RecordFormat::Xml)
        } else if s.eq_ignore_ascii_case("line") {
            Ok(RecordFormat::Line)
        } else if s.eq_ignore_ascii_case("json") {
            Ok(RecordFormat::Json)
        } else {
            Err(ConfigError::Invalid(format!("unknown log format '{s}'")))
        }
    }
}

/// The common shape shared by event-log and trace records.
#[derive(Debug, Clone)]
pub struct EventFields {
    pub source: SourceKind,
    pub time: DateTime<Utc>,
    /// Channel name for event-log records, provider name for trace records.
    pub origin: String,
    pub level: LogLevel,
    pub event_id: u32,
    pub message: String,
    /// Raw event XML when the source API delivered one.
    pub raw_xml: Option<String>,
}

impl EventFields {
    /// Renders the record as a writable string (no trailing newline).
    ///
    /// The `multiline` flag only concerns the line format: with it off,
    /// internal line breaks in the body are collapsed to spaces so the
    /// record occupies exactly one output line. JSON escapes line breaks in
    /// its own encoding and XML carries the raw event body, so both keep the
    /// message bytes intact.
    pub fn render(&self, format: RecordFormat, multiline: bool) -> String {
        match format {
            RecordFormat::Line => {
                let message = if multiline {
                    self.message.clone()
                } else {
                    collapse_newlines(&self.message)
                };
                format!(
                    "{} {} {} {} {}",
                    format_timestamp(&self.time),
                    self.level,
                    self.origin,
                    self.event_id,
                    message,
                )
            }
            RecordFormat::Json => {
                let origin_key = match self.source {
                    SourceKind::Trace => "Provider",
                    _ => "Channel",
                };
                let mut object = serde_json::Map::new();
                object.insert("Source".to_string(), json!(self.source.to_string()));
                object.insert("TimeStamp".to_string(), json!(format_timestamp(&self.time)));
                object.insert(origin_key.to_string(), json!(self.origin));
                object.insert("Level".to_string(), json!(self.level.to_string()));
                object.insert("EventId".to_string(), json!(self.event_id));
                object.insert("Message".to_string(), json!(self.message));
                serde_json::Value::Object(object).to_string()
            }
            RecordFormat::Xml => {
                let body = match &self.raw_xml {
                    Some(xml) => xml.clone(),
                    None => format!(
                        "<Event><Provider Name=\"{}\"/><EventID>{}</EventID><Level>{}</Level><Data>{}</Data></Event>",
                        xml_escape(&self.origin),
                        self.event_id,
                        self.level.as_number(),
                        xml_escape(&self.message),
                    ),
                };
                format!(
                    "<Source={}><Time={}>{}",
                    self.source,
                    format_timestamp(&self.time),
                    body,
                )
            }
        }
    }
}

/// UTC timestamp with millisecond precision, e.g. `2024-05-01T12:30:45.123Z`.
pub fn format_timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn collapse_newlines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push(' ');
            }
            '\n' => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

fn xml_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    out
}
