//! Reload planning
//!
//! Computes the minimal stop/keep/start plan between two configurations.
//! Event-log and trace sources are singleton slots with coarse granularity:
//! any change to their channel/provider set or flags restarts the monitor,
//! equality keeps it running. File sources diff by identity so unchanged
//! monitors keep their in-flight tailing state across a reload.

use logship_common::LogConfig;

/// What happens to a singleton monitor slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotAction {
    /// Not configured before or after.
    Absent,
    /// Newly configured.
    Start,
    /// No longer configured.
    Stop,
    /// Configured before and after with a material difference.
    Restart,
    /// Configured before and after, identical: the instance is preserved.
    Keep,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadPlan {
    pub event_log: SlotAction,
    pub trace: SlotAction,
    /// Indices into the old file list to stop.
    pub stop_files: Vec<usize>,
    /// Pairs of (old index, new index) whose monitors are kept in place.
    pub keep_files: Vec<(usize, usize)>,
    /// Indices into the new file list to start, in new-config order.
    pub start_files: Vec<usize>,
}

pub fn plan_reload(old: &LogConfig, new: &LogConfig) -> ReloadPlan {
    let event_log = match (&old.event_log, &new.event_log) {
        (None, None) => SlotAction::Absent,
        (None, Some(_)) => SlotAction::Start,
        (Some(_), None) => SlotAction::Stop,
        (Some(before), Some(after)) => {
            let unchanged = before.multiline == after.multiline
                && before.start_at_oldest == after.start_at_oldest
                && before.format == after.format
                && before.channel_set() == after.channel_set();
            if unchanged {
                SlotAction::Keep
            } else {
                SlotAction::Restart
            }
        }
    };

    let trace = match (&old.trace, &new.trace) {
        (None, None) => SlotAction::Absent,
        (None, Some(_)) => SlotAction::Start,
        (Some(_), None) => SlotAction::Stop,
        (Some(before), Some(after)) => {
            let unchanged = before.multiline == after.multiline
                && before.format == after.format
                && before.provider_set() == after.provider_set();
            if unchanged {
                SlotAction::Keep
            } else {
                SlotAction::Restart
            }
        }
    };

    let mut used = vec![false; new.files.len()];
    let mut stop_files = Vec::new();
    let mut keep_files = Vec::new();

    for (old_index, old_file) in old.files.iter().enumerate() {
        let matched = new
            .files
            .iter()
            .enumerate()
            .position(|(new_index, new_file)| !used[new_index] && new_file == old_file);
        match matched {
            Some(new_index) => {
                used[new_index] = true;
                keep_files.push((old_index, new_index));
            }
            None => stop_files.push(old_index),
        }
    }

    let start_files = (0..new.files.len()).filter(|&i| !used[i]).collect();

    ReloadPlan { event_log, trace, stop_files, keep_files, start_files }
}
