//! Monitor supervisor
//!
//! Owns the lifecycle of every source monitor: loads the configuration,
//! instantiates monitors, listens for config-file edits, applies the minimal
//! stop/keep/start plan on reload, and coordinates clean shutdown. The
//! supervisor is explicitly owned by `main` and all reconfiguration runs on
//! its thread; workers only ever signal it.

pub mod diff;
pub mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use uuid::Uuid;

use logship_common::{ConfigError, FileSourceConfig, LogConfig, SourceKind};

use crate::monitors::event_log::{EventStreamFactory, HostEventStreamFactory};
use crate::monitors::trace::{HostTraceBackend, TraceBackend};
use crate::monitors::{EventLogMonitor, FileLogMonitor, SourceMonitor, TraceMonitor};
use crate::supervisor::diff::{plan_reload, SlotAction};
use crate::supervisor::watch::ConfigWatcher;
use crate::worker::StopToken;
use crate::writer::LogWriter;

const IDLE_WAIT: Duration = Duration::from_millis(200);

/// The OS seams monitors are built over; swapped out in tests.
pub struct MonitorBackends {
    pub event_log: Arc<dyn EventStreamFactory>,
    pub trace: Arc<dyn TraceBackend>,
}

impl Default for MonitorBackends {
    fn default() -> Self {
        Self {
            event_log: Arc::new(HostEventStreamFactory),
            trace: Arc::new(HostTraceBackend),
        }
    }
}

pub struct Supervisor {
    config_path: PathBuf,
    writer: Arc<LogWriter>,
    backends: MonitorBackends,
    config: Option<LogConfig>,
    event_log: Option<EventLogMonitor>,
    trace: Option<TraceMonitor>,
    files: Vec<(FileSourceConfig, FileLogMonitor)>,
    reload_rx: Receiver<()>,
    watcher: Option<ConfigWatcher>,
}

impl Supervisor {
    /// Loads the configuration, starts the configured monitors, and arms the
    /// watch on the config file's directory.
    ///
    /// A missing or invalid document is logged and the supervisor comes up
    /// with no monitors: the watch still arms, so a corrected file recovers
    /// the sources, and a wrapped child is unaffected. Individual monitor
    /// start failures are logged and do not fail initialization.
    pub fn initialize(config_path: &Path, writer: Arc<LogWriter>) -> Supervisor {
        Self::initialize_with_backends(config_path, writer, MonitorBackends::default())
    }

    pub fn initialize_with_backends(
        config_path: &Path,
        writer: Arc<LogWriter>,
        backends: MonitorBackends,
    ) -> Supervisor {
        let (reload_tx, reload_rx) = unbounded();

        let watcher = match ConfigWatcher::start(config_path, reload_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::warn!(error = %e, "config watch unavailable, live reload disabled");
                None
            }
        };

        let mut supervisor = Supervisor {
            config_path: config_path.to_path_buf(),
            writer,
            backends,
            config: None,
            event_log: None,
            trace: None,
            files: Vec::new(),
            reload_rx,
            watcher,
        };

        match LogConfig::load(config_path) {
            Ok(config) => supervisor.apply(config),
            Err(e) => supervisor.report_config_error(&e),
        }
        supervisor
    }

    /// Blocks until the stop signal fires, reloading whenever the watcher
    /// reports a config-file change.
    pub fn wait_until_stopped(&mut self, stop: &StopToken) {
        while !stop.is_stopped() {
            match self.reload_rx.recv_timeout(IDLE_WAIT) {
                Ok(()) => {
                    // Bursts of notifications collapse into one reload.
                    while self.reload_rx.try_recv().is_ok() {}
                    self.reload();
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    stop.sleep(IDLE_WAIT);
                }
            }
        }
    }

    /// Re-reads the config file and applies the diff. An unreadable or
    /// invalid document leaves the running configuration untouched.
    pub fn reload(&mut self) {
        match LogConfig::load(&self.config_path) {
            Ok(config) => {
                tracing::info!(path = %self.config_path.display(), "configuration changed, reloading");
                self.apply(config);
            }
            Err(e) => self.report_config_error(&e),
        }
    }

    fn report_config_error(&self, error: &ConfigError) {
        match error {
            ConfigError::NotFound { .. } => {
                tracing::warn!(%error, "configuration unavailable; current sources unchanged")
            }
            _ => self.writer.trace_error(&format!("configuration rejected: {error}")),
        }
    }

    /// Applies the minimal stop/keep/start plan for `new`.
    fn apply(&mut self, new: LogConfig) {
        let old = self.config.take().unwrap_or_default();
        let plan = plan_reload(&old, &new);

        // Stops run first so restarted singletons release their OS handles
        // before the replacement subscribes.
        if matches!(plan.event_log, SlotAction::Stop | SlotAction::Restart) {
            if let Some(mut monitor) = self.event_log.take() {
                monitor.shutdown();
            }
        }
        if matches!(plan.trace, SlotAction::Stop | SlotAction::Restart) {
            if let Some(mut monitor) = self.trace.take() {
                monitor.shutdown();
            }
        }

        let mut old_files: Vec<Option<(FileSourceConfig, FileLogMonitor)>> =
            std::mem::take(&mut self.files).into_iter().map(Some).collect();
        for &index in &plan.stop_files {
            if let Some((_, mut monitor)) = old_files[index].take() {
                monitor.shutdown();
            }
        }

        // Rebuild the file list in new-config order, moving kept monitors
        // into place and starting the new ones.
        let mut slots: Vec<Option<(FileSourceConfig, FileLogMonitor)>> =
            (0..new.files.len()).map(|_| None).collect();
        for &(old_index, new_index) in &plan.keep_files {
            slots[new_index] = old_files[old_index].take();
        }
        for &new_index in &plan.start_files {
            let config = new.files[new_index].clone();
            match FileLogMonitor::start(config.clone(), Arc::clone(&self.writer)) {
                Ok(monitor) => slots[new_index] = Some((config, monitor)),
                Err(e) => {
                    self.writer.trace_error(&format!(
                        "file monitor for '{}' failed to start: {e}",
                        config.directory.display()
                    ));
                }
            }
        }
        self.files = slots.into_iter().flatten().collect();

        if matches!(plan.event_log, SlotAction::Start | SlotAction::Restart) {
            if let Some(config) = new.event_log.clone() {
                match EventLogMonitor::start(
                    config,
                    Arc::clone(&self.writer),
                    self.backends.event_log.as_ref(),
                ) {
                    Ok(monitor) => self.event_log = Some(monitor),
                    Err(e) => {
                        self.writer
                            .trace_error(&format!("event log monitor failed to start: {e}"));
                    }
                }
            }
        }

        if matches!(plan.trace, SlotAction::Start | SlotAction::Restart) {
            if let Some(config) = new.trace.clone() {
                match TraceMonitor::start(
                    config,
                    Arc::clone(&self.writer),
                    self.backends.trace.as_ref(),
                ) {
                    Ok(monitor) => self.trace = Some(monitor),
                    Err(e) => {
                        self.writer
                            .trace_error(&format!("trace monitor failed to start: {e}"));
                    }
                }
            }
        }

        self.config = Some(new);
    }

    /// Stops every monitor and the config watch; idempotent.
    pub fn shutdown(&mut self) {
        tracing::info!("supervisor shutting down");
        if let Some(mut watcher) = self.watcher.take() {
            watcher.shutdown();
        }

        let mut monitors: Vec<&mut dyn SourceMonitor> = Vec::new();
        if let Some(monitor) = self.event_log.as_mut() {
            monitors.push(monitor);
        }
        if let Some(monitor) = self.trace.as_mut() {
            monitors.push(monitor);
        }
        for (_, monitor) in self.files.iter_mut() {
            monitors.push(monitor);
        }
        for monitor in monitors {
            tracing::debug!(kind = %kind_name(monitor.kind()), "stopping monitor");
            monitor.shutdown();
        }

        self.event_log = None;
        self.trace = None;
        self.files.clear();
        self.config = None;
    }

    /// Effective configuration currently applied, if any.
    pub fn config(&self) -> Option<&LogConfig> {
        self.config.as_ref()
    }

    /// Instance identities of the running file monitors, in config order.
    pub fn file_monitor_ids(&self) -> Vec<(FileSourceConfig, Uuid)> {
        self.files
            .iter()
            .map(|(config, monitor)| (config.clone(), monitor.id()))
            .collect()
    }

    pub fn event_log_monitor_id(&self) -> Option<Uuid> {
        self.event_log.as_ref().map(EventLogMonitor::id)
    }

    pub fn trace_monitor_id(&self) -> Option<Uuid> {
        self.trace.as_ref().map(TraceMonitor::id)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn kind_name(kind: SourceKind) -> &'static str {
    match kind {
        SourceKind::EventLog => "event-log",
        SourceKind::File => "file",
        SourceKind::Trace => "trace",
    }
}
