//! Kernel-trace session monitor
//!
//! Owns one real-time trace session bound to the configured providers. The
//! session and the schema store are external collaborators behind
//! [`TraceBackend`]; the monitor enables providers at their requested level
//! and keyword mask, consumes events on a blocking worker, resolves schemas
//! lazily, and reports lost-event counts as warnings.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use logship_common::{
    EventFields, LogLevel, MonitorError, MonitorResult, SourceKind, TraceProvider,
    TraceSourceConfig,
};

use crate::monitors::schema::{hex_dump, render_payload, SchemaCache, SchemaResolver};
use crate::monitors::SourceMonitor;
use crate::worker::{StopToken, Worker};
use crate::writer::LogWriter;

const EVENT_WAIT: Duration = Duration::from_millis(500);
const SESSION_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// One consumed trace event.
#[derive(Debug, Clone)]
pub struct TraceEvent {
    pub provider: Uuid,
    pub provider_name: Option<String>,
    pub event_id: u16,
    pub version: u8,
    pub level: LogLevel,
    pub time: DateTime<Utc>,
    pub payload: Vec<u8>,
}

/// An open real-time trace session.
pub trait TraceSession: Send {
    /// Enables one provider at its level and keyword mask. A provider the
    /// host does not know is an error here; the monitor logs and skips it.
    fn enable(&mut self, provider: &TraceProvider) -> MonitorResult<()>;

    /// Blocks up to `timeout` for the next event; `None` means a quiet wait.
    fn next_event(&mut self, timeout: Duration) -> MonitorResult<Option<TraceEvent>>;

    /// Cumulative count of events the session reports as lost to buffer
    /// overruns.
    fn lost_events(&self) -> u64;

    /// Disables every enabled provider; called before the session closes.
    fn disable_all(&mut self) -> MonitorResult<()>;
}

/// Host seam: opens sessions and resolves event schemas.
pub trait TraceBackend: Send + Sync {
    /// Opens a session under `name`, stopping any stale session with the
    /// same name first.
    fn open_session(&self, name: &str) -> MonitorResult<Box<dyn TraceSession>>;

    fn schema_resolver(&self) -> Box<dyn SchemaResolver>;
}

/// Default backend: no host trace API in this build.
pub struct HostTraceBackend;

impl TraceBackend for HostTraceBackend {
    fn open_session(&self, _name: &str) -> MonitorResult<Box<dyn TraceSession>> {
        Err(MonitorError::Unsupported(
            "no host trace API on this platform".to_string(),
        ))
    }

    fn schema_resolver(&self) -> Box<dyn SchemaResolver> {
        Box::new(crate::monitors::schema::EmptySchemaResolver)
    }
}

/// Process-unique session name; a leftover session from a previous run of
/// the same pid is stale by definition and gets stopped by the backend.
pub fn session_name() -> String {
    format!("logship-trace-{}", std::process::id())
}

pub struct TraceMonitor {
    id: Uuid,
    config: TraceSourceConfig,
    worker: Worker,
}

impl TraceMonitor {
    pub fn start(
        config: TraceSourceConfig,
        writer: Arc<LogWriter>,
        backend: &dyn TraceBackend,
    ) -> MonitorResult<TraceMonitor> {
        let session = backend.open_session(&session_name())?;
        let schemas = SchemaCache::new(backend.schema_resolver());

        let worker_config = config.clone();
        let worker = Worker::spawn("trace-monitor", move |stop| {
            run(session, schemas, worker_config, writer, stop);
        })?;

        tracing::info!(providers = config.providers.len(), "trace monitor started");
        Ok(TraceMonitor { id: Uuid::new_v4(), config, worker })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &TraceSourceConfig {
        &self.config
    }
}

impl SourceMonitor for TraceMonitor {
    fn kind(&self) -> SourceKind {
        SourceKind::Trace
    }

    fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

fn run(
    mut session: Box<dyn TraceSession>,
    mut schemas: SchemaCache,
    config: TraceSourceConfig,
    writer: Arc<LogWriter>,
    stop: StopToken,
) {
    let mut enabled = 0usize;
    for provider in &config.providers {
        match session.enable(provider) {
            Ok(()) => enabled += 1,
            Err(e) => {
                tracing::warn!(
                    provider = %provider.display_name(),
                    error = %e,
                    "could not enable provider, skipping"
                );
            }
        }
    }
    if enabled == 0 && !config.providers.is_empty() {
        writer.trace_warn("trace session running with no enabled providers");
    }

    let mut reported_lost = 0u64;

    while !stop.is_stopped() {
        match session.next_event(EVENT_WAIT) {
            Ok(Some(event)) => {
                if !accepts(&config.providers, &event) {
                    continue;
                }
                let message = schemas
                    .resolve(event.provider, event.event_id, event.version)
                    .and_then(|schema| render_payload(&schema, &event.payload))
                    .unwrap_or_else(|| hex_dump(&event.payload));

                let fields = EventFields {
                    source: SourceKind::Trace,
                    time: event.time,
                    origin: origin_of(&config.providers, &event),
                    level: event.level,
                    event_id: event.event_id as u32,
                    message,
                    raw_xml: None,
                };
                writer.write_line(&fields.render(config.format, config.multiline));
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "trace consumer error, backing off");
                stop.sleep(SESSION_ERROR_BACKOFF);
            }
        }

        let lost = session.lost_events();
        if lost > reported_lost {
            writer.trace_warn(&format!(
                "trace session lost {} event(s) to buffer overruns",
                lost - reported_lost
            ));
            reported_lost = lost;
        }
    }

    if let Err(e) = session.disable_all() {
        tracing::warn!(error = %e, "failed disabling trace providers");
    }
    // Dropping the session closes it.
}

/// The configured selector for this event's provider, if any.
fn selector_for<'a>(
    providers: &'a [TraceProvider],
    event: &TraceEvent,
) -> Option<&'a TraceProvider> {
    providers
        .iter()
        .find(|p| p.guid == Some(event.provider))
        .or_else(|| {
            let name = event.provider_name.as_deref()?;
            providers
                .iter()
                .find(|p| p.name.as_deref().is_some_and(|n| n.eq_ignore_ascii_case(name)))
        })
}

fn accepts(providers: &[TraceProvider], event: &TraceEvent) -> bool {
    match selector_for(providers, event) {
        Some(provider) => provider.level.accepts(event.level),
        // Sessions only carry enabled providers; an unmatched guid means the
        // selector was name-only, so keep the event.
        None => true,
    }
}

fn origin_of(providers: &[TraceProvider], event: &TraceEvent) -> String {
    if let Some(name) = &event.provider_name {
        return name.clone();
    }
    match selector_for(providers, event) {
        Some(provider) => provider.display_name(),
        None => event.provider.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitors::schema::{EventSchema, PropertyDescriptor, PropertyKind};
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::io::Write;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct MockSession {
        events: VecDeque<TraceEvent>,
        lost: u64,
        enabled: Arc<Mutex<Vec<String>>>,
        fail_enable_for: Option<String>,
    }

    impl TraceSession for MockSession {
        fn enable(&mut self, provider: &TraceProvider) -> MonitorResult<()> {
            let name = provider.display_name();
            if self.fail_enable_for.as_deref() == Some(name.as_str()) {
                return Err(MonitorError::StartFailed(format!("unknown provider {name}")));
            }
            self.enabled.lock().push(name);
            Ok(())
        }

        fn next_event(&mut self, _timeout: Duration) -> MonitorResult<Option<TraceEvent>> {
            match self.events.pop_front() {
                Some(event) => Ok(Some(event)),
                None => {
                    std::thread::sleep(Duration::from_millis(10));
                    Ok(None)
                }
            }
        }

        fn lost_events(&self) -> u64 {
            self.lost
        }

        fn disable_all(&mut self) -> MonitorResult<()> {
            Ok(())
        }
    }

    struct MockBackend {
        events: Mutex<VecDeque<TraceEvent>>,
        lost: u64,
        enabled: Arc<Mutex<Vec<String>>>,
        fail_enable_for: Option<String>,
        schemas: Vec<(Uuid, u16, u8, EventSchema)>,
    }

    impl MockBackend {
        fn new(events: Vec<TraceEvent>) -> Self {
            Self {
                events: Mutex::new(events.into()),
                lost: 0,
                enabled: Arc::default(),
                fail_enable_for: None,
                schemas: Vec::new(),
            }
        }
    }

    struct FixedResolver(Vec<(Uuid, u16, u8, EventSchema)>);

    impl SchemaResolver for FixedResolver {
        fn resolve(&mut self, provider: Uuid, event_id: u16, version: u8) -> Option<EventSchema> {
            self.0
                .iter()
                .find(|(p, id, v, _)| *p == provider && *id == event_id && *v == version)
                .map(|(_, _, _, schema)| schema.clone())
        }
    }

    impl TraceBackend for MockBackend {
        fn open_session(&self, _name: &str) -> MonitorResult<Box<dyn TraceSession>> {
            Ok(Box::new(MockSession {
                events: std::mem::take(&mut self.events.lock()),
                lost: self.lost,
                enabled: Arc::clone(&self.enabled),
                fail_enable_for: self.fail_enable_for.clone(),
            }))
        }

        fn schema_resolver(&self) -> Box<dyn SchemaResolver> {
            Box::new(FixedResolver(self.schemas.clone()))
        }
    }

    fn provider(name: &str, guid: Uuid, level: LogLevel) -> TraceProvider {
        TraceProvider {
            name: Some(name.to_string()),
            guid: Some(guid),
            guid_str: guid.to_string(),
            level,
            keywords: 0,
        }
    }

    fn event(guid: Uuid, id: u16, level: LogLevel, payload: Vec<u8>) -> TraceEvent {
        TraceEvent {
            provider: guid,
            provider_name: Some("TestProvider".to_string()),
            event_id: id,
            version: 0,
            level,
            time: Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
            payload,
        }
    }

    fn config(providers: Vec<TraceProvider>) -> TraceSourceConfig {
        TraceSourceConfig {
            providers,
            multiline: false,
            format: logship_common::RecordFormat::Line,
        }
    }

    fn wait_for_output(buf: &SharedBuf, lines: usize) -> String {
        for _ in 0..100 {
            let text = String::from_utf8(buf.0.lock().clone()).unwrap();
            if text.lines().count() >= lines {
                return text;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        String::from_utf8(buf.0.lock().clone()).unwrap()
    }

    #[test]
    fn decodes_events_with_known_schema() {
        let guid = Uuid::new_v4();
        let schema = EventSchema {
            properties: vec![PropertyDescriptor {
                name: "Pid".to_string(),
                kind: PropertyKind::UInt32,
            }],
        };
        let mut backend = MockBackend::new(vec![event(
            guid,
            7,
            LogLevel::Error,
            42u32.to_le_bytes().to_vec(),
        )]);
        backend.schemas.push((guid, 7, 0, schema));

        let buf = SharedBuf::default();
        let writer = Arc::new(LogWriter::with_sink(Box::new(buf.clone())));
        let mut monitor = TraceMonitor::start(
            config(vec![provider("TestProvider", guid, LogLevel::Verbose)]),
            writer,
            &backend,
        )
        .unwrap();

        let text = wait_for_output(&buf, 1);
        monitor.shutdown();
        assert!(text.contains("Pid=42"));
        assert!(text.contains("TestProvider"));
    }

    #[test]
    fn unknown_schema_falls_back_to_hex() {
        let guid = Uuid::new_v4();
        let backend = MockBackend::new(vec![event(
            guid,
            9,
            LogLevel::Error,
            vec![0xDE, 0xAD],
        )]);

        let buf = SharedBuf::default();
        let writer = Arc::new(LogWriter::with_sink(Box::new(buf.clone())));
        let mut monitor = TraceMonitor::start(
            config(vec![provider("TestProvider", guid, LogLevel::Verbose)]),
            writer,
            &backend,
        )
        .unwrap();

        let text = wait_for_output(&buf, 1);
        monitor.shutdown();
        assert!(text.contains("DE AD"));
    }

    #[test]
    fn events_above_provider_level_are_dropped() {
        let guid = Uuid::new_v4();
        let backend = MockBackend::new(vec![
            event(guid, 1, LogLevel::Verbose, vec![0xAA]),
            event(guid, 2, LogLevel::Error, vec![0xBB]),
        ]);

        let buf = SharedBuf::default();
        let writer = Arc::new(LogWriter::with_sink(Box::new(buf.clone())));
        let mut monitor = TraceMonitor::start(
            config(vec![provider("TestProvider", guid, LogLevel::Error)]),
            writer,
            &backend,
        )
        .unwrap();

        let text = wait_for_output(&buf, 1);
        monitor.shutdown();
        assert!(text.contains("BB"));
        assert!(!text.contains("AA"));
    }

    #[test]
    fn failed_provider_is_skipped_and_rest_proceed() {
        let good = Uuid::new_v4();
        let bad = Uuid::new_v4();
        let mut backend = MockBackend::new(vec![event(good, 1, LogLevel::Error, vec![0xCD])]);
        backend.fail_enable_for = Some("BadProvider".to_string());
        let enabled = Arc::clone(&backend.enabled);

        let buf = SharedBuf::default();
        let writer = Arc::new(LogWriter::with_sink(Box::new(buf.clone())));
        let mut monitor = TraceMonitor::start(
            config(vec![
                provider("BadProvider", bad, LogLevel::Error),
                provider("TestProvider", good, LogLevel::Error),
            ]),
            writer,
            &backend,
        )
        .unwrap();

        let text = wait_for_output(&buf, 1);
        monitor.shutdown();
        assert!(text.contains("CD"));
        assert_eq!(enabled.lock().as_slice(), ["TestProvider".to_string()]);
    }

    #[test]
    fn lost_events_surface_as_warning() {
        let guid = Uuid::new_v4();
        let mut backend = MockBackend::new(Vec::new());
        backend.lost = 3;

        let buf = SharedBuf::default();
        let writer = Arc::new(LogWriter::with_sink(Box::new(buf.clone())));
        let mut monitor = TraceMonitor::start(
            config(vec![provider("TestProvider", guid, LogLevel::Error)]),
            writer,
            &backend,
        )
        .unwrap();

        let text = wait_for_output(&buf, 1);
        monitor.shutdown();
        assert!(text.contains("LOGSHIP WARNING:"));
        assert!(text.contains("lost 3 event(s)"));
    }

    #[test]
    fn unsupported_host_fails_start() {
        let writer = Arc::new(LogWriter::with_sink(Box::new(SharedBuf::default())));
        let result = TraceMonitor::start(config(Vec::new()), writer, &HostTraceBackend);
        assert!(matches!(result, Err(MonitorError::Unsupported(_))));
    }

    #[test]
    fn session_name_is_process_unique() {
        assert!(session_name().contains(&std::process::id().to_string()));
    }
}
