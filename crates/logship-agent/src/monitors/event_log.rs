//! Event-log subscription monitor
//!
//! Subscribes to a set of host event-log channels through the [`EventStream`]
//! seam, filters by each channel's severity threshold, and renders records in
//! the configured format. The host subscription API itself is an external
//! collaborator; on hosts without one the monitor fails to start and the
//! remaining sources proceed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use logship_common::{
    EventChannel, EventFields, EventLogSourceConfig, LogLevel, MonitorError, MonitorResult,
    SourceKind,
};

use crate::monitors::SourceMonitor;
use crate::worker::{StopToken, Worker};
use crate::writer::LogWriter;

/// Result batches are capped at this many events per poll.
pub const EVENT_BATCH_SIZE: usize = 10;

const BATCH_WAIT: Duration = Duration::from_millis(500);
const STREAM_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One event as delivered by the subscription API.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub channel: String,
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub event_id: u32,
    pub message: String,
    pub xml: Option<String>,
}

/// Severity selector for a single channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSelector {
    pub channel: String,
    pub max_level: LogLevel,
}

/// The synthesized subscription query: the union of per-channel selectors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventQuery {
    pub selectors: Vec<ChannelSelector>,
}

impl EventQuery {
    /// Builds the union query, collapsing duplicate channel entries onto the
    /// most verbose requested threshold.
    pub fn from_channels(channels: &[EventChannel]) -> EventQuery {
        let mut selectors: Vec<ChannelSelector> = Vec::new();
        for channel in channels {
            match selectors
                .iter_mut()
                .find(|s| s.channel.eq_ignore_ascii_case(&channel.name))
            {
                Some(existing) => existing.max_level = existing.max_level.max(channel.level),
                None => selectors.push(ChannelSelector {
                    channel: channel.name.clone(),
                    max_level: channel.level,
                }),
            }
        }
        EventQuery { selectors }
    }

    /// Renders the query as the structured XML selector expression the
    /// subscription API consumes: one `<Select>` per channel accepting every
    /// level at or below the configured threshold.
    pub fn selector_xml(&self) -> String {
        let mut xml = String::from("<QueryList><Query Id=\"0\">");
        for selector in &self.selectors {
            let levels = (1..=selector.max_level.as_number())
                .map(|n| format!("Level={n}"))
                .collect::<Vec<_>>()
                .join(" or ");
            xml.push_str(&format!(
                "<Select Path=\"{}\">*[System[({levels})]]</Select>",
                selector.channel
            ));
        }
        xml.push_str("</Query></QueryList>");
        xml
    }
}

/// Subscription seam over the host event-log API.
pub trait EventStream: Send {
    /// Enables a disabled channel so the subscription can attach to it.
    fn enable_channel(&mut self, channel: &str) -> MonitorResult<()>;

    /// Starts the subscription, from the earliest available record or from
    /// future records only.
    fn subscribe(&mut self, query: &EventQuery, start_at_oldest: bool) -> MonitorResult<()>;

    /// Blocks up to `timeout` for the next result batch of at most `max`
    /// events; an empty batch means the wait timed out.
    fn next_batch(&mut self, max: usize, timeout: Duration) -> MonitorResult<Vec<EventRecord>>;
}

pub trait EventStreamFactory: Send + Sync {
    fn open(&self) -> MonitorResult<Box<dyn EventStream>>;
}

/// Default factory: this build carries no host event-log binding, so opening
/// reports the monitor as unsupported and the supervisor logs and moves on.
pub struct HostEventStreamFactory;

impl EventStreamFactory for HostEventStreamFactory {
    fn open(&self) -> MonitorResult<Box<dyn EventStream>> {
        Err(MonitorError::Unsupported(
            "no host event-log API on this platform".to_string(),
        ))
    }
}

/// Worker lifecycle, observable for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventMonitorState {
    Idle,
    Subscribing,
    Streaming,
    Stopping,
    Stopped,
}

pub struct EventLogMonitor {
    id: Uuid,
    config: EventLogSourceConfig,
    state: Arc<Mutex<EventMonitorState>>,
    worker: Worker,
}

impl EventLogMonitor {
    pub fn start(
        config: EventLogSourceConfig,
        writer: Arc<LogWriter>,
        factory: &dyn EventStreamFactory,
    ) -> MonitorResult<EventLogMonitor> {
        let stream = factory.open()?;
        let state = Arc::new(Mutex::new(EventMonitorState::Idle));

        let worker_state = Arc::clone(&state);
        let worker_config = config.clone();
        let worker = Worker::spawn("event-log-monitor", move |stop| {
            run(stream, worker_config, writer, worker_state, stop);
        })?;

        tracing::info!(channels = config.channels.len(), "event log monitor started");
        Ok(EventLogMonitor { id: Uuid::new_v4(), config, state, worker })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &EventLogSourceConfig {
        &self.config
    }

    pub fn state(&self) -> EventMonitorState {
        *self.state.lock()
    }
}

impl SourceMonitor for EventLogMonitor {
    fn kind(&self) -> SourceKind {
        SourceKind::EventLog
    }

    fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

fn run(
    mut stream: Box<dyn EventStream>,
    config: EventLogSourceConfig,
    writer: Arc<LogWriter>,
    state: Arc<Mutex<EventMonitorState>>,
    stop: StopToken,
) {
    *state.lock() = EventMonitorState::Subscribing;

    let query = EventQuery::from_channels(&config.channels);
    for selector in &query.selectors {
        // Best effort; a channel that is already enabled reports success.
        if let Err(e) = stream.enable_channel(&selector.channel) {
            tracing::warn!(channel = %selector.channel, error = %e, "could not enable channel");
        }
    }

    if let Err(e) = stream.subscribe(&query, config.start_at_oldest) {
        writer.trace_error(&format!("event log subscription failed: {e}"));
        *state.lock() = EventMonitorState::Stopped;
        return;
    }
    *state.lock() = EventMonitorState::Streaming;

    let thresholds: HashMap<String, LogLevel> = query
        .selectors
        .iter()
        .map(|s| (s.channel.to_ascii_lowercase(), s.max_level))
        .collect();

    while !stop.is_stopped() {
        match stream.next_batch(EVENT_BATCH_SIZE, BATCH_WAIT) {
            Ok(batch) => {
                for event in batch {
                    if !accepts(&thresholds, &event) {
                        continue;
                    }
                    let fields = EventFields {
                        source: SourceKind::EventLog,
                        time: event.time,
                        origin: event.channel,
                        level: event.level,
                        event_id: event.event_id,
                        message: event.message,
                        raw_xml: event.xml,
                    };
                    writer.write_line(&fields.render(config.format, config.multiline));
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "event stream error, backing off");
                stop.sleep(STREAM_ERROR_BACKOFF);
            }
        }
    }

    *state.lock() = EventMonitorState::Stopping;
    // The stream drops here, releasing the subscription handles.
    *state.lock() = EventMonitorState::Stopped;
}

fn accepts(thresholds: &HashMap<String, LogLevel>, event: &EventRecord) -> bool {
    thresholds
        .get(&event.channel.to_ascii_lowercase())
        .map(|max| max.accepts(event.level))
        .unwrap_or(false)
}
