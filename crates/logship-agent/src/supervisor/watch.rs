//! Configuration file watch
//!
//! Watches the config file's *enclosing directory*, because the file itself
//! may be replaced atomically. A notification triggers a reload only when it
//! names the configured file, under its long or its alternate (8.3-style)
//! name; the alternate name is refreshed when the file is re-created. The
//! reload itself runs on the supervisor thread: the watcher only signals.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crossbeam_channel::Sender;

use logship_common::{MonitorError, MonitorResult};

use crate::fswatch::{DirectoryEvents, FileAction, PollWatcher};
use crate::worker::{StopToken, Worker};

const NOTIFICATION_WAIT: Duration = Duration::from_millis(200);
const SCAN_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Decides whether a notification's file name refers to the config file.
#[derive(Debug, Clone)]
pub struct ConfigNameMatcher {
    long_name: String,
    alternate_name: Option<String>,
}

impl ConfigNameMatcher {
    pub fn new(config_path: &Path) -> MonitorResult<ConfigNameMatcher> {
        let long_name = config_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| {
                MonitorError::StartFailed(format!(
                    "config path '{}' has no file name",
                    config_path.display()
                ))
            })?;
        let mut matcher = ConfigNameMatcher { long_name, alternate_name: None };
        matcher.refresh_alternate(config_path);
        Ok(matcher)
    }

    pub fn matches(&self, name: &str) -> bool {
        name == self.long_name
            || self.alternate_name.as_deref().is_some_and(|alt| name == alt)
    }

    /// Re-derives the alternate name after the file is created or renamed
    /// into place. Hosts without alternate (8.3-style) file names keep
    /// `None`.
    pub fn refresh_alternate(&mut self, config_path: &Path) {
        self.alternate_name = alternate_file_name(config_path);
    }
}

/// Alternate short name of a file, on hosts that have one. This build has no
/// such API, so the long name is the only spelling notifications can use.
fn alternate_file_name(_path: &Path) -> Option<String> {
    None
}

/// Worker that turns matching directory notifications into reload signals.
pub struct ConfigWatcher {
    worker: Worker,
}

impl ConfigWatcher {
    /// Arms the watch over the directory containing `config_path`. Fails if
    /// that directory cannot be enumerated.
    pub fn start(config_path: &Path, reload_tx: Sender<()>) -> MonitorResult<ConfigWatcher> {
        let directory = config_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let matcher = ConfigNameMatcher::new(config_path)?;
        let watcher = PollWatcher::new(&directory, false)?;
        let config_path = config_path.to_path_buf();

        let worker = Worker::spawn("config-watcher", move |stop| {
            run(watcher, matcher, config_path, reload_tx, stop);
        })?;

        tracing::debug!(directory = %directory.display(), "config watch armed");
        Ok(ConfigWatcher { worker })
    }

    pub fn shutdown(&mut self) {
        self.worker.shutdown();
    }
}

fn run(
    mut watcher: PollWatcher,
    mut matcher: ConfigNameMatcher,
    config_path: PathBuf,
    reload_tx: Sender<()>,
    stop: StopToken,
) {
    while !stop.is_stopped() {
        let events = match watcher.wait(NOTIFICATION_WAIT) {
            Ok(events) => events,
            Err(e) => {
                tracing::warn!(error = %e, "config directory scan failed, retrying");
                stop.sleep(SCAN_ERROR_BACKOFF);
                continue;
            }
        };

        let mut changed = false;
        for event in &events {
            let Some(name) = event.file_name() else { continue };
            if event.action == FileAction::Added {
                // The file was created or renamed into place; its alternate
                // name may have changed with it.
                matcher.refresh_alternate(&config_path);
            }
            if matcher.matches(name) {
                changed = true;
            }
        }

        if changed && reload_tx.send(()).is_err() {
            // The supervisor is gone; nothing left to signal.
            return;
        }
    }
}
