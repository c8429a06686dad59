//! Property tests for the reload planner and the line decoder

use std::path::PathBuf;

use proptest::prelude::*;

use logship_agent::supervisor::diff::{plan_reload, SlotAction};
use logship_common::encoding::{LineDecoder, TextEncoding};
use logship_common::{FileSourceConfig, LogConfig};

// ============================================================================
// Strategy Generators
// ============================================================================

/// File sources drawn from a small pool so old and new configs overlap.
fn file_source_strategy() -> impl Strategy<Value = FileSourceConfig> {
    (0..6u8, prop::bool::ANY).prop_map(|(dir, recursive)| FileSourceConfig {
        directory: PathBuf::from(format!("/var/log/pool{dir}")),
        filter: "*.log".to_string(),
        include_subdirectories: recursive,
    })
}

fn file_config_strategy() -> impl Strategy<Value = LogConfig> {
    prop::collection::vec(file_source_strategy(), 0..6).prop_map(|files| LogConfig {
        files,
        ..Default::default()
    })
}

/// Lines without terminators, so the terminator placement is the test's.
fn line_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9 .:_-]{0,40}").expect("valid regex")
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    /// After applying a plan, the live monitor set equals the set induced by
    /// the new configuration: every new index is exactly one of kept or
    /// started, every old index exactly one of kept or stopped.
    #[test]
    fn plan_covers_old_and_new_exactly_once(
        old in file_config_strategy(),
        new in file_config_strategy()
    ) {
        let plan = plan_reload(&old, &new);

        let mut new_seen = vec![0usize; new.files.len()];
        for &(_, new_index) in &plan.keep_files {
            new_seen[new_index] += 1;
        }
        for &new_index in &plan.start_files {
            new_seen[new_index] += 1;
        }
        prop_assert!(new_seen.iter().all(|&n| n == 1));

        let mut old_seen = vec![0usize; old.files.len()];
        for &(old_index, _) in &plan.keep_files {
            old_seen[old_index] += 1;
        }
        for &old_index in &plan.stop_files {
            old_seen[old_index] += 1;
        }
        prop_assert!(old_seen.iter().all(|&n| n == 1));
    }

    /// Kept pairs really are the same source identity.
    #[test]
    fn kept_pairs_have_equal_identity(
        old in file_config_strategy(),
        new in file_config_strategy()
    ) {
        let plan = plan_reload(&old, &new);
        for &(old_index, new_index) in &plan.keep_files {
            prop_assert_eq!(&old.files[old_index], &new.files[new_index]);
        }
    }

    /// Planning a configuration against itself never touches anything.
    #[test]
    fn self_plan_is_identity(config in file_config_strategy()) {
        let plan = plan_reload(&config, &config.clone());
        prop_assert!(plan.stop_files.is_empty());
        prop_assert!(plan.start_files.is_empty());
        prop_assert_eq!(plan.keep_files.len(), config.files.len());
        prop_assert_eq!(plan.event_log, SlotAction::Absent);
        prop_assert_eq!(plan.trace, SlotAction::Absent);
    }

    /// For any chunking of terminated lines, the decoder emits exactly the
    /// appended lines, in append order.
    #[test]
    fn chunked_lines_decode_in_append_order(
        lines in prop::collection::vec(line_strategy(), 1..20),
        splits in prop::collection::vec(1..16usize, 0..8)
    ) {
        let mut stream: Vec<u8> = Vec::new();
        for line in &lines {
            stream.extend_from_slice(line.as_bytes());
            stream.push(b'\n');
        }

        // Cut the byte stream at arbitrary points and feed it piecewise.
        let decoder = LineDecoder::new(TextEncoding::Utf8);
        let mut buf = Vec::new();
        let mut emitted = Vec::new();
        let mut rest = stream.as_slice();
        for split in splits {
            let cut = split.min(rest.len());
            let (head, tail) = rest.split_at(cut);
            buf.extend_from_slice(head);
            emitted.extend(decoder.drain_lines(&mut buf));
            rest = tail;
        }
        buf.extend_from_slice(rest);
        emitted.extend(decoder.drain_lines(&mut buf));
        if let Some(residual) = decoder.flush(&mut buf) {
            emitted.push(residual);
        }

        prop_assert_eq!(emitted, lines);
    }
}
