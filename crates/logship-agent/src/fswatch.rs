//! Directory change notification seam
//!
//! The OS notification API is an external collaborator; the agent programs
//! against [`DirectoryEvents`] and ships a metadata-polling implementation.
//! Notifications arrive in batches, the watcher re-arms after every batch,
//! and a rename surfaces as a remove of the old name plus an add of the new
//! one.

use std::collections::BTreeMap;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use logship_common::{MonitorError, MonitorResult};

/// What happened to a file inside the watched directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub action: FileAction,
    /// Absolute path of the affected file.
    pub path: PathBuf,
}

impl FileEvent {
    /// Final path component, the name the notification refers to.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Blocking source of change notifications for one directory.
pub trait DirectoryEvents: Send {
    /// Waits up to `timeout` for the next batch; an empty batch means the
    /// timeout elapsed quietly.
    fn wait(&mut self, timeout: Duration) -> MonitorResult<Vec<FileEvent>>;
}

/// Stable identity of a file on disk, used to detect rotation and to track a
/// file across a rename.
#[cfg(unix)]
pub fn file_id(metadata: &Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((metadata.dev(), metadata.ino()))
}

#[cfg(not(unix))]
pub fn file_id(_metadata: &Metadata) -> Option<(u64, u64)> {
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
    id: Option<(u64, u64)>,
}

impl FileStamp {
    fn of(metadata: &Metadata) -> FileStamp {
        FileStamp {
            len: metadata.len(),
            modified: metadata.modified().ok(),
            id: file_id(metadata),
        }
    }
}

/// Polling implementation of [`DirectoryEvents`].
pub struct PollWatcher {
    root: PathBuf,
    recursive: bool,
    poll_interval: Duration,
    snapshot: BTreeMap<PathBuf, FileStamp>,
}

impl PollWatcher {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Arms a watch over `root`. Fails when the directory cannot be
    /// enumerated, which callers treat as a startup failure of their own.
    pub fn new(root: &Path, recursive: bool) -> MonitorResult<PollWatcher> {
        let mut watcher = PollWatcher {
            root: root.to_path_buf(),
            recursive,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            snapshot: BTreeMap::new(),
        };
        watcher.snapshot = watcher.scan().map_err(MonitorError::Os)?;
        Ok(watcher)
    }

    #[cfg(test)]
    pub fn with_poll_interval(mut self, interval: Duration) -> PollWatcher {
        self.poll_interval = interval;
        self
    }

    /// Files currently known under the watch; the initial tailed-set
    /// enumeration for file monitors.
    pub fn known_files(&self) -> Vec<PathBuf> {
        self.snapshot.keys().cloned().collect()
    }

    fn scan(&self) -> std::io::Result<BTreeMap<PathBuf, FileStamp>> {
        let mut files = BTreeMap::new();
        self.scan_dir(&self.root, &mut files)?;
        Ok(files)
    }

    fn scan_dir(
        &self,
        dir: &Path,
        files: &mut BTreeMap<PathBuf, FileStamp>,
    ) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            let path = entry.path();
            let metadata = match entry.metadata() {
                Ok(metadata) => metadata,
                // Raced with deletion; the next poll settles it.
                Err(_) => continue,
            };
            if metadata.is_dir() {
                if self.recursive {
                    // A subdirectory torn down mid-scan is not an error.
                    let _ = self.scan_dir(&path, files);
                }
            } else {
                files.insert(path, FileStamp::of(&metadata));
            }
        }
        Ok(())
    }

    fn diff(&self, next: &BTreeMap<PathBuf, FileStamp>) -> Vec<FileEvent> {
        let mut events = Vec::new();

        for (path, stamp) in next {
            match self.snapshot.get(path) {
                None => events.push(FileEvent { action: FileAction::Added, path: path.clone() }),
                Some(previous) if previous != stamp => {
                    events.push(FileEvent { action: FileAction::Modified, path: path.clone() })
                }
                Some(_) => {}
            }
        }
        for path in self.snapshot.keys() {
            if !next.contains_key(path) {
                events.push(FileEvent { action: FileAction::Removed, path: path.clone() });
            }
        }
        events
    }
}

impl DirectoryEvents for PollWatcher {
    fn wait(&mut self, timeout: Duration) -> MonitorResult<Vec<FileEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            std::thread::sleep(self.poll_interval.min(deadline - now));

            let next = match self.scan() {
                Ok(next) => next,
                Err(e) => {
                    return Err(MonitorError::Transient(format!(
                        "cannot enumerate '{}': {e}",
                        self.root.display()
                    )))
                }
            };
            let events = self.diff(&next);
            if !events.is_empty() {
                self.snapshot = next;
                return Ok(events);
            }
            self.snapshot = next;
        }
    }
}
