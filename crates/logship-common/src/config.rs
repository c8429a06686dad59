//! Configuration document loading and normalization
//!
//! The JSON document is consumed as a read-only `serde_json::Value` tree.
//! Attribute names are matched case-insensitively and unknown fields are
//! ignored. Loading normalizes the ordered `sources` sequence into at most
//! one event-log source, at most one trace source, and an ordered list of
//! file sources; repeated event-log or trace entries merge, with
//! last-writer-wins on any flag that is actually present.

use std::collections::{BTreeSet, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::encoding::TextEncoding;
use crate::error::{ConfigError, ConfigResult};
use crate::level::LogLevel;
use crate::record::RecordFormat;

const TAG_LOG_CONFIG: &str = "LogConfig";
const TAG_SOURCES: &str = "sources";
const TAG_TYPE: &str = "type";
const TAG_CHANNELS: &str = "channels";
const TAG_PROVIDERS: &str = "providers";
const TAG_DIRECTORY: &str = "directory";
const TAG_FILTER: &str = "filter";
const TAG_INCLUDE_SUBDIRECTORIES: &str = "includeSubdirectories";
const TAG_FORMAT_MULTILINE: &str = "eventFormatMultiLine";
const TAG_START_AT_OLDEST: &str = "startAtOldestRecord";
const TAG_LOG_FORMAT: &str = "logFormat";
const TAG_NAME: &str = "name";
const TAG_LEVEL: &str = "level";
const TAG_PROVIDER_NAME: &str = "providerName";
const TAG_PROVIDER_GUID: &str = "providerGuid";
const TAG_KEYWORDS: &str = "keywords";

/// One event-log channel selector.
#[derive(Debug, Clone)]
pub struct EventChannel {
    pub name: String,
    pub level: LogLevel,
}

impl EventChannel {
    /// Identity key: case-insensitive name plus level.
    pub fn key(&self) -> (String, LogLevel) {
        (self.name.to_ascii_lowercase(), self.level)
    }
}

impl PartialEq for EventChannel {
    fn eq(&self, other: &Self) -> bool {
        self.name.eq_ignore_ascii_case(&other.name) && self.level == other.level
    }
}

impl Eq for EventChannel {}

impl Hash for EventChannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.to_ascii_lowercase().hash(state);
        self.level.hash(state);
    }
}

/// One kernel-trace provider selector.
#[derive(Debug, Clone)]
pub struct TraceProvider {
    pub name: Option<String>,
    pub guid: Option<Uuid>,
    /// The GUID exactly as spelled in the document; empty when only a name
    /// was given.
    pub guid_str: String,
    pub level: LogLevel,
    pub keywords: u64,
}

impl TraceProvider {
    /// A provider must be addressable by name or by GUID.
    pub fn is_valid(&self) -> bool {
        self.name.is_some() || self.guid.is_some()
    }

    /// Identity and ordering key: `(guid, guid-string, level, keywords)`,
    /// with the GUID string compared case-insensitively.
    pub fn sort_key(&self) -> ([u8; 16], String, u8, u64) {
        (
            self.guid.map(|g| *g.as_bytes()).unwrap_or([0; 16]),
            self.guid_str.to_ascii_lowercase(),
            self.level.as_number(),
            self.keywords,
        )
    }

    /// Name to show in records: friendly name when present, GUID otherwise.
    pub fn display_name(&self) -> String {
        match (&self.name, &self.guid) {
            (Some(name), _) => name.clone(),
            (None, Some(guid)) => guid.to_string(),
            (None, None) => String::new(),
        }
    }
}

impl PartialEq for TraceProvider {
    fn eq(&self, other: &Self) -> bool {
        self.sort_key() == other.sort_key()
    }
}

impl Eq for TraceProvider {}

impl PartialOrd for TraceProvider {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TraceProvider {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

/// Effective event-log source after merging and default resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct EventLogSourceConfig {
    pub channels: Vec<EventChannel>,
    pub multiline: bool,
    pub start_at_oldest: bool,
    pub format: RecordFormat,
}

impl EventLogSourceConfig {
    /// Channel identities as a set, for diffing.
    pub fn channel_set(&self) -> HashSet<(String, LogLevel)> {
        self.channels.iter().map(EventChannel::key).collect()
    }
}

/// Effective trace source after merging and default resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSourceConfig {
    pub providers: Vec<TraceProvider>,
    pub multiline: bool,
    pub format: RecordFormat,
}

impl TraceSourceConfig {
    /// Provider identities as an ordered set, for diffing.
    pub fn provider_set(&self) -> BTreeSet<([u8; 16], String, u8, u64)> {
        self.providers.iter().map(TraceProvider::sort_key).collect()
    }
}

/// One tailed-directory source. File sources keep their document order and
/// are identified positionally plus by this identity for diffing.
#[derive(Debug, Clone)]
pub struct FileSourceConfig {
    pub directory: PathBuf,
    pub filter: String,
    pub include_subdirectories: bool,
}

impl FileSourceConfig {
    /// Identity: normalized absolute directory, filter string, recursion flag.
    pub fn identity(&self) -> (PathBuf, String, bool) {
        (
            self.normalized_directory(),
            self.filter.clone(),
            self.include_subdirectories,
        )
    }

    /// Absolute, lexically-normalized form of `directory`. Does not touch the
    /// filesystem, so configs referring to not-yet-created directories still
    /// have a stable identity.
    pub fn normalized_directory(&self) -> PathBuf {
        let absolute = if self.directory.is_absolute() {
            self.directory.clone()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&self.directory))
                .unwrap_or_else(|_| self.directory.clone())
        };

        let mut normalized = PathBuf::new();
        for component in absolute.components() {
            match component {
                Component::CurDir => {}
                Component::ParentDir => {
                    if !normalized.pop() {
                        normalized.push(component.as_os_str());
                    }
                }
                other => normalized.push(other.as_os_str()),
            }
        }
        normalized
    }
}

impl PartialEq for FileSourceConfig {
    fn eq(&self, other: &Self) -> bool {
        self.identity() == other.identity()
    }
}

impl Eq for FileSourceConfig {}

impl Hash for FileSourceConfig {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity().hash(state);
    }
}

/// The normalized configuration tree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogConfig {
    pub event_log: Option<EventLogSourceConfig>,
    pub files: Vec<FileSourceConfig>,
    pub trace: Option<TraceSourceConfig>,
}

impl LogConfig {
    /// Reads and parses the document at `path`. The file may be UTF-8 or
    /// UTF-16 in either byte order.
    pub fn load(path: &Path) -> ConfigResult<LogConfig> {
        let bytes = std::fs::read(path).map_err(|e| ConfigError::from_read(path, e))?;
        let (_, text) = TextEncoding::decode_document(&bytes);
        Self::parse_str(&text)
    }

    /// Parses a decoded document.
    pub fn parse_str(text: &str) -> ConfigResult<LogConfig> {
        let root: Value = serde_json::from_str(text)
            .map_err(|e| ConfigError::Invalid(format!("malformed JSON: {e}")))?;
        Self::from_json(&root)
    }

    /// Normalizes a parsed JSON tree.
    pub fn from_json(root: &Value) -> ConfigResult<LogConfig> {
        let root = root
            .as_object()
            .ok_or_else(|| ConfigError::Invalid("top-level value must be an object".into()))?;

        let log_config = get_ci(root, TAG_LOG_CONFIG)
            .ok_or_else(|| ConfigError::Invalid(format!("missing '{TAG_LOG_CONFIG}' object")))?
            .as_object()
            .ok_or_else(|| ConfigError::Invalid(format!("'{TAG_LOG_CONFIG}' must be an object")))?;

        let sources = get_ci(log_config, TAG_SOURCES)
            .ok_or_else(|| ConfigError::Invalid(format!("missing '{TAG_SOURCES}' array")))?
            .as_array()
            .ok_or_else(|| ConfigError::Invalid(format!("'{TAG_SOURCES}' must be an array")))?;

        let mut event_log: Option<RawEventLogSource> = None;
        let mut trace: Option<RawTraceSource> = None;
        let mut files = Vec::new();

        for (index, source) in sources.iter().enumerate() {
            let source = source.as_object().ok_or_else(|| {
                ConfigError::Invalid(format!("source #{index} must be an object"))
            })?;
            let kind = required_str(source, TAG_TYPE, index)?;

            if kind.eq_ignore_ascii_case("EventLog") {
                let parsed = RawEventLogSource::parse(source, index)?;
                merge_event_log(&mut event_log, parsed);
            } else if kind.eq_ignore_ascii_case("File") {
                files.push(parse_file_source(source, index)?);
            } else if kind.eq_ignore_ascii_case("ETW") {
                let parsed = RawTraceSource::parse(source, index)?;
                merge_trace(&mut trace, parsed);
            } else {
                return Err(ConfigError::Invalid(format!(
                    "source #{index} has unknown type '{kind}'"
                )));
            }
        }

        Ok(LogConfig {
            event_log: event_log.map(RawEventLogSource::resolve),
            files,
            trace: trace.map(RawTraceSource::resolve),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.event_log.is_none() && self.trace.is_none() && self.files.is_empty()
    }
}

/// Event-log source with flags as written, before default resolution. Absent
/// flags must not override flags from an earlier entry during merge.
struct RawEventLogSource {
    channels: Vec<EventChannel>,
    multiline: Option<bool>,
    start_at_oldest: Option<bool>,
    format: Option<RecordFormat>,
}

impl RawEventLogSource {
    fn parse(source: &Map<String, Value>, index: usize) -> ConfigResult<Self> {
        let channels = get_ci(source, TAG_CHANNELS)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("source #{index} is missing '{TAG_CHANNELS}'"))
            })?
            .as_array()
            .ok_or_else(|| {
                ConfigError::Invalid(format!("source #{index}: '{TAG_CHANNELS}' must be an array"))
            })?
            .iter()
            .map(|c| parse_channel(c, index))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(Self {
            channels,
            multiline: optional_bool(source, TAG_FORMAT_MULTILINE, index)?,
            start_at_oldest: optional_bool(source, TAG_START_AT_OLDEST, index)?,
            format: optional_format(source, index)?,
        })
    }

    fn resolve(self) -> EventLogSourceConfig {
        EventLogSourceConfig {
            channels: self.channels,
            multiline: self.multiline.unwrap_or(true),
            start_at_oldest: self.start_at_oldest.unwrap_or(false),
            format: self.format.unwrap_or_default(),
        }
    }
}

struct RawTraceSource {
    providers: Vec<TraceProvider>,
    multiline: Option<bool>,
    format: Option<RecordFormat>,
}

impl RawTraceSource {
    fn parse(source: &Map<String, Value>, index: usize) -> ConfigResult<Self> {
        let providers = get_ci(source, TAG_PROVIDERS)
            .ok_or_else(|| {
                ConfigError::Invalid(format!("source #{index} is missing '{TAG_PROVIDERS}'"))
            })?
            .as_array()
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "source #{index}: '{TAG_PROVIDERS}' must be an array"
                ))
            })?
            .iter()
            .map(|p| parse_provider(p, index))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(Self {
            providers,
            multiline: optional_bool(source, TAG_FORMAT_MULTILINE, index)?,
            format: optional_format(source, index)?,
        })
    }

    fn resolve(self) -> TraceSourceConfig {
        TraceSourceConfig {
            providers: self.providers,
            multiline: self.multiline.unwrap_or(true),
            format: self.format.unwrap_or_default(),
        }
    }
}

fn merge_event_log(slot: &mut Option<RawEventLogSource>, mut next: RawEventLogSource) {
    match slot {
        None => *slot = Some(next),
        Some(base) => {
            base.channels.append(&mut next.channels);
            if next.multiline.is_some() {
                base.multiline = next.multiline;
            }
            if next.start_at_oldest.is_some() {
                base.start_at_oldest = next.start_at_oldest;
            }
            if next.format.is_some() {
                base.format = next.format;
            }
        }
    }
}

fn merge_trace(slot: &mut Option<RawTraceSource>, mut next: RawTraceSource) {
    match slot {
        None => *slot = Some(next),
        Some(base) => {
            base.providers.append(&mut next.providers);
            if next.multiline.is_some() {
                base.multiline = next.multiline;
            }
            if next.format.is_some() {
                base.format = next.format;
            }
        }
    }
}

fn parse_channel(value: &Value, index: usize) -> ConfigResult<EventChannel> {
    let channel = value
        .as_object()
        .ok_or_else(|| ConfigError::Invalid(format!("source #{index}: channel must be an object")))?;
    let name = required_str(channel, TAG_NAME, index)?.to_string();
    let level = match get_ci(channel, TAG_LEVEL) {
        Some(v) => parse_level(v, index)?,
        None => LogLevel::Error,
    };
    Ok(EventChannel { name, level })
}

fn parse_provider(value: &Value, index: usize) -> ConfigResult<TraceProvider> {
    let provider = value.as_object().ok_or_else(|| {
        ConfigError::Invalid(format!("source #{index}: provider must be an object"))
    })?;

    let name = get_ci(provider, TAG_PROVIDER_NAME)
        .map(|v| {
            v.as_str().map(str::to_string).ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "source #{index}: '{TAG_PROVIDER_NAME}' must be a string"
                ))
            })
        })
        .transpose()?;

    let (guid, guid_str) = match get_ci(provider, TAG_PROVIDER_GUID) {
        Some(v) => {
            let text = v.as_str().ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "source #{index}: '{TAG_PROVIDER_GUID}' must be a string"
                ))
            })?;
            let guid = Uuid::parse_str(text).map_err(|_| {
                ConfigError::Invalid(format!("source #{index}: invalid provider GUID '{text}'"))
            })?;
            (Some(guid), text.to_string())
        }
        None => (None, String::new()),
    };

    let level = match get_ci(provider, TAG_LEVEL) {
        Some(v) => parse_level(v, index)?,
        None => LogLevel::Error,
    };

    let keywords = match get_ci(provider, TAG_KEYWORDS) {
        Some(v) => v.as_u64().ok_or_else(|| {
            ConfigError::Invalid(format!(
                "source #{index}: '{TAG_KEYWORDS}' must be an unsigned integer"
            ))
        })?,
        None => 0,
    };

    let provider = TraceProvider { name, guid, guid_str, level, keywords };
    if !provider.is_valid() {
        return Err(ConfigError::Invalid(format!(
            "source #{index}: provider needs '{TAG_PROVIDER_NAME}' or '{TAG_PROVIDER_GUID}'"
        )));
    }
    Ok(provider)
}

fn parse_file_source(source: &Map<String, Value>, index: usize) -> ConfigResult<FileSourceConfig> {
    let directory = required_str(source, TAG_DIRECTORY, index)?;
    if directory.is_empty() {
        return Err(ConfigError::Invalid(format!(
            "source #{index}: '{TAG_DIRECTORY}' must not be empty"
        )));
    }

    let filter = match get_ci(source, TAG_FILTER) {
        Some(v) => v
            .as_str()
            .ok_or_else(|| {
                ConfigError::Invalid(format!("source #{index}: '{TAG_FILTER}' must be a string"))
            })?
            .to_string(),
        None => "*".to_string(),
    };

    Ok(FileSourceConfig {
        directory: PathBuf::from(directory),
        filter,
        include_subdirectories: optional_bool(source, TAG_INCLUDE_SUBDIRECTORIES, index)?
            .unwrap_or(false),
    })
}

fn parse_level(value: &Value, index: usize) -> ConfigResult<LogLevel> {
    let text = value.as_str().ok_or_else(|| {
        ConfigError::Invalid(format!("source #{index}: '{TAG_LEVEL}' must be a string"))
    })?;
    LogLevel::from_str(text)
        .map_err(|_| ConfigError::Invalid(format!("source #{index}: unknown level '{text}'")))
}

fn optional_bool(
    source: &Map<String, Value>,
    key: &str,
    index: usize,
) -> ConfigResult<Option<bool>> {
    match get_ci(source, key) {
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| ConfigError::Invalid(format!("source #{index}: '{key}' must be a boolean"))),
        None => Ok(None),
    }
}

fn optional_format(source: &Map<String, Value>, index: usize) -> ConfigResult<Option<RecordFormat>> {
    match get_ci(source, TAG_LOG_FORMAT) {
        Some(v) => {
            let text = v.as_str().ok_or_else(|| {
                ConfigError::Invalid(format!("source #{index}: '{TAG_LOG_FORMAT}' must be a string"))
            })?;
            text.parse::<RecordFormat>()
                .map(Some)
                .map_err(|_| {
                    ConfigError::Invalid(format!("source #{index}: unknown log format '{text}'"))
                })
        }
        None => Ok(None),
    }
}

fn required_str<'a>(
    source: &'a Map<String, Value>,
    key: &str,
    index: usize,
) -> ConfigResult<&'a str> {
    get_ci(source, key)
        .ok_or_else(|| ConfigError::Invalid(format!("source #{index} is missing '{key}'")))?
        .as_str()
        .ok_or_else(|| ConfigError::Invalid(format!("source #{index}: '{key}' must be a string")))
}

/// Case-insensitive attribute lookup over a JSON object.
fn get_ci<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v)
}
