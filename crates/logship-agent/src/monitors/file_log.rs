//! Directory-tailing monitor
//!
//! Watches one directory (optionally recursive) for files matching a glob
//! filter and emits each newly appended line verbatim. Files present at
//! start are tailed from their current end; files that appear later are read
//! from the beginning. Renames carry tailing state across, truncation and
//! identity changes reset it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use glob::Pattern;
use uuid::Uuid;

use logship_common::{FileSourceConfig, MonitorError, MonitorResult, SourceKind};

use crate::fswatch::{file_id, DirectoryEvents, FileAction, FileEvent, PollWatcher};
use crate::monitors::tailer::{StartPosition, TailedFile};
use crate::monitors::SourceMonitor;
use crate::worker::{StopToken, Worker};
use crate::writer::LogWriter;

const NOTIFICATION_WAIT: Duration = Duration::from_millis(200);
const SCAN_ERROR_BACKOFF: Duration = Duration::from_secs(1);

pub struct FileLogMonitor {
    id: Uuid,
    config: FileSourceConfig,
    worker: Worker,
}

impl FileLogMonitor {
    /// Opens the directory watch, enumerates the initial tailed set, and
    /// spawns the worker. An inaccessible directory fails only this monitor.
    pub fn start(config: FileSourceConfig, writer: Arc<LogWriter>) -> MonitorResult<FileLogMonitor> {
        let pattern = Pattern::new(&config.filter).map_err(|e| {
            MonitorError::StartFailed(format!("bad file filter '{}': {e}", config.filter))
        })?;

        let directory = config.normalized_directory();
        let watcher = PollWatcher::new(&directory, config.include_subdirectories)?;

        let mut tailed: HashMap<PathBuf, TailedFile> = HashMap::new();
        for path in watcher.known_files() {
            if !matches(&pattern, &path) {
                continue;
            }
            match TailedFile::open(&path, StartPosition::End) {
                Ok(tail) => {
                    tailed.insert(path, tail);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "cannot open file, skipping");
                }
            }
        }
        tracing::info!(
            directory = %directory.display(),
            filter = %config.filter,
            files = tailed.len(),
            "file monitor started"
        );

        let worker_name = format!("file-monitor:{}", directory.display());
        let worker = Worker::spawn(&worker_name, move |stop| {
            run(watcher, pattern, tailed, writer, stop);
        })?;

        Ok(FileLogMonitor { id: Uuid::new_v4(), config, worker })
    }

    /// Instance identity; survives reloads that keep this monitor.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &FileSourceConfig {
        &self.config
    }
}

impl SourceMonitor for FileLogMonitor {
    fn kind(&self) -> SourceKind {
        SourceKind::File
    }

    fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

fn matches(pattern: &Pattern, path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|name| pattern.matches(name))
        .unwrap_or(false)
}

fn run(
    mut watcher: PollWatcher,
    pattern: Pattern,
    mut tailed: HashMap<PathBuf, TailedFile>,
    writer: Arc<LogWriter>,
    stop: StopToken,
) {
    while !stop.is_stopped() {
        match watcher.wait(NOTIFICATION_WAIT) {
            Ok(events) if events.is_empty() => {}
            Ok(events) => reconcile(&events, &pattern, &mut tailed, &writer),
            Err(e) => {
                tracing::warn!(error = %e, "directory scan failed, retrying");
                stop.sleep(SCAN_ERROR_BACKOFF);
            }
        }
    }

    // Closing the tailed set emits any residual partial lines before the
    // stop is acknowledged.
    for (_, mut tail) in tailed.drain() {
        if let Some(line) = tail.flush_partial() {
            writer.write_line(&line);
        }
    }
}

/// Applies one notification batch to the tailed set.
fn reconcile(
    events: &[FileEvent],
    pattern: &Pattern,
    tailed: &mut HashMap<PathBuf, TailedFile>,
    writer: &LogWriter,
) {
    // Removals first: a rename surfaces as remove+add, and the add half needs
    // the detached state to keep the offset.
    let mut detached: HashMap<(u64, u64), TailedFile> = HashMap::new();

    for event in events {
        if event.action != FileAction::Removed {
            continue;
        }
        if let Some(tail) = tailed.remove(&event.path) {
            match tail.file_id() {
                Some(id) => {
                    detached.insert(id, tail);
                }
                None => close_tail(tail, writer),
            }
        }
    }

    for event in events {
        if event.action != FileAction::Added || !matches(pattern, &event.path) {
            continue;
        }

        let renamed_in = std::fs::metadata(&event.path)
            .ok()
            .and_then(|md| file_id(&md))
            .and_then(|id| detached.remove(&id));

        match renamed_in {
            Some(mut tail) => {
                tail.renamed_to(&event.path);
                drain_into_writer(&mut tail, writer);
                tailed.insert(event.path.clone(), tail);
            }
            None => match TailedFile::open(&event.path, StartPosition::Beginning) {
                Ok(mut tail) => {
                    drain_into_writer(&mut tail, writer);
                    tailed.insert(event.path.clone(), tail);
                }
                Err(e) => {
                    tracing::warn!(path = %event.path.display(), error = %e, "cannot open new file");
                }
            },
        }
    }

    // Whatever was renamed away without a matching add left the tailed set.
    for (_, tail) in detached.drain() {
        close_tail(tail, writer);
    }

    for event in events {
        if event.action != FileAction::Modified {
            continue;
        }
        let rotated = tailed
            .get(&event.path)
            .map(TailedFile::is_rotated)
            .unwrap_or(false);
        if rotated {
            rotate(&event.path, tailed, writer);
            continue;
        }
        match tailed.get_mut(&event.path) {
            Some(tail) => drain_into_writer(tail, writer),
            None if matches(pattern, &event.path) => {
                // Known to the watcher but never opened (an earlier open
                // failed). Join the set without replaying its backlog.
                match TailedFile::open(&event.path, StartPosition::End) {
                    Ok(tail) => {
                        tailed.insert(event.path.clone(), tail);
                    }
                    Err(e) => {
                        tracing::warn!(path = %event.path.display(), error = %e, "file still unreadable");
                    }
                }
            }
            None => {}
        }
    }
}

/// Flushes the old state and restarts the file from offset zero.
fn rotate(path: &Path, tailed: &mut HashMap<PathBuf, TailedFile>, writer: &LogWriter) {
    if let Some(tail) = tailed.remove(path) {
        tracing::debug!(path = %path.display(), "file rotated, restarting from the top");
        close_tail(tail, writer);
    }
    match TailedFile::open(path, StartPosition::Beginning) {
        Ok(mut tail) => {
            drain_into_writer(&mut tail, writer);
            tailed.insert(path.to_path_buf(), tail);
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot reopen rotated file");
        }
    }
}

fn drain_into_writer(tail: &mut TailedFile, writer: &LogWriter) {
    match tail.drain_lines() {
        Ok(lines) => {
            for line in lines {
                writer.write_line(&line);
            }
        }
        Err(e) => {
            tracing::warn!(path = %tail.path().display(), error = %e, "read failed, retrying on next notification");
        }
    }
}

fn close_tail(mut tail: TailedFile, writer: &LogWriter) {
    if let Some(line) = tail.flush_partial() {
        writer.write_line(&line);
    }
}
