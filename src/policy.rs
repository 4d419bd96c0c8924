//! Flush policy selector.
//!
//! A pure function deciding which buffered messages leave now and which
//! remain, given a named policy. No I/O, no clock, no state; the coordinator
//! feeds it the authoritative message list read just before flushing.

use crate::config::FlushPattern;
use crate::state::BufferedMessage;
use std::cmp::Reverse;

/// Result of applying a flush policy.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushSelection {
    /// Messages leaving the buffer.
    pub flushed: Vec<BufferedMessage>,
    /// Messages staying behind, in their original relative order.
    pub retained: Vec<BufferedMessage>,
}

/// Partition `messages` into flushed and retained sets under `pattern`.
///
/// - `collect_send`: everything flushes.
/// - `throttle`: the first `min(len, max_size)` flush in arrival order, the
///   remainder stays; oldest messages drain first and nothing is reordered.
/// - `batch`: a fixed `ceil(max_size / 2)` chunk flushes regardless of total
///   volume.
/// - `priority`: messages with `priority >= priority_levels - 1` flush,
///   sorted descending by priority (stable, so arrival order survives within
///   one level); the rest stay in original relative order.
///
/// An empty input yields two empty sets, never an error.
pub fn select_for_flush(
    pattern: FlushPattern,
    messages: Vec<BufferedMessage>,
    max_size: usize,
    priority_levels: u32,
) -> FlushSelection {
    if messages.is_empty() {
        return FlushSelection {
            flushed: Vec::new(),
            retained: Vec::new(),
        };
    }

    match pattern {
        FlushPattern::CollectSend => FlushSelection {
            flushed: messages,
            retained: Vec::new(),
        },
        FlushPattern::Throttle => split_front(messages, max_size),
        FlushPattern::Batch => split_front(messages, max_size.div_ceil(2)),
        FlushPattern::Priority => {
            let threshold = priority_levels.saturating_sub(1);
            let (mut flushed, retained): (Vec<_>, Vec<_>) = messages
                .into_iter()
                .partition(|m| m.priority >= threshold);
            flushed.sort_by_key(|m| Reverse(m.priority));
            FlushSelection { flushed, retained }
        }
    }
}

/// Drain the first `count` messages, keep the rest in order.
fn split_front(mut messages: Vec<BufferedMessage>, count: usize) -> FlushSelection {
    let count = count.min(messages.len());
    let retained = messages.split_off(count);
    FlushSelection {
        flushed: messages,
        retained,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MessagePayload;

    fn message(content: &str, priority: u32) -> BufferedMessage {
        MessagePayload::new(content)
            .priority(priority)
            .into_message()
    }

    fn contents(messages: &[BufferedMessage]) -> Vec<&str> {
        messages.iter().map(|m| m.content.as_str()).collect()
    }

    #[test]
    fn test_empty_input_yields_empty_selection() {
        for pattern in [
            FlushPattern::CollectSend,
            FlushPattern::Throttle,
            FlushPattern::Batch,
            FlushPattern::Priority,
        ] {
            let selection = select_for_flush(pattern, vec![], 10, 3);
            assert!(selection.flushed.is_empty());
            assert!(selection.retained.is_empty());
        }
    }

    #[test]
    fn test_collect_send_flushes_everything() {
        let messages = vec![message("a", 0), message("b", 5), message("c", 0)];
        let selection = select_for_flush(FlushPattern::CollectSend, messages, 2, 3);
        assert_eq!(contents(&selection.flushed), vec!["a", "b", "c"]);
        assert!(selection.retained.is_empty());
    }

    #[test]
    fn test_throttle_drains_oldest_first() {
        // max_size = K, M > K buffered: flushed K, retained M - K, and
        // flushed ++ retained reconstructs the original order.
        let messages: Vec<_> = (0..7).map(|i| message(&format!("m{}", i), 0)).collect();
        let originals = messages.clone();
        let original = contents(&originals);

        let selection = select_for_flush(FlushPattern::Throttle, messages, 4, 3);
        assert_eq!(selection.flushed.len(), 4);
        assert_eq!(selection.retained.len(), 3);

        let mut reconstructed = contents(&selection.flushed);
        reconstructed.extend(contents(&selection.retained));
        assert_eq!(reconstructed, original);
    }

    #[test]
    fn test_throttle_under_capacity_flushes_all() {
        let messages = vec![message("a", 0), message("b", 0)];
        let selection = select_for_flush(FlushPattern::Throttle, messages, 5, 3);
        assert_eq!(selection.flushed.len(), 2);
        assert!(selection.retained.is_empty());
    }

    #[test]
    fn test_batch_takes_half_capacity_chunk() {
        // max_size = 4, 3 buffered: ceil(4 / 2) = 2 flushed, 1 retained.
        let messages = vec![message("a", 0), message("b", 0), message("c", 0)];
        let selection = select_for_flush(FlushPattern::Batch, messages, 4, 3);
        assert_eq!(contents(&selection.flushed), vec!["a", "b"]);
        assert_eq!(contents(&selection.retained), vec!["c"]);
    }

    #[test]
    fn test_batch_odd_capacity_rounds_up() {
        let messages: Vec<_> = (0..6).map(|i| message(&format!("m{}", i), 0)).collect();
        let selection = select_for_flush(FlushPattern::Batch, messages, 5, 3);
        assert_eq!(selection.flushed.len(), 3); // ceil(5 / 2)
        assert_eq!(selection.retained.len(), 3);
    }

    #[test]
    fn test_priority_partitions_at_threshold() {
        // priority_levels = 3, threshold = 2.
        let messages = vec![
            message("low", 0),
            message("urgent", 4),
            message("mid", 1),
            message("at-threshold", 2),
            message("high", 3),
        ];
        let selection = select_for_flush(FlushPattern::Priority, messages, 10, 3);

        assert!(selection.flushed.iter().all(|m| m.priority >= 2));
        assert!(selection.retained.iter().all(|m| m.priority < 2));
        // Flushed sorted descending by priority.
        assert_eq!(contents(&selection.flushed), vec!["urgent", "high", "at-threshold"]);
        // Retained keeps original relative order.
        assert_eq!(contents(&selection.retained), vec!["low", "mid"]);
    }

    #[test]
    fn test_priority_stable_within_level() {
        let messages = vec![
            message("first", 2),
            message("second", 2),
            message("third", 2),
        ];
        let selection = select_for_flush(FlushPattern::Priority, messages, 10, 3);
        assert_eq!(contents(&selection.flushed), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_priority_single_level_flushes_everything() {
        // priority_levels = 1 puts the threshold at 0, so every message
        // qualifies.
        let messages = vec![message("a", 0), message("b", 0)];
        let selection = select_for_flush(FlushPattern::Priority, messages, 10, 1);
        assert_eq!(selection.flushed.len(), 2);
        assert!(selection.retained.is_empty());
    }
}
