//! History & LoopDetector (C5, §4.5): an append-only record of actions and
//! results, with the two predicates that switch the Orchestrator between
//! normal / loop-recovery / failure-recovery prompts.
//!
//! Structurally grounded on `stuck.rs` (enum-shaped status, `VecDeque`
//! sliding window, colocated test module) but the thresholds and
//! predicates themselves are the spec's exact rules, not the base crate's
//! screen-hash/drift heuristics.

use crate::types::ActionRecord;
use std::collections::VecDeque;

const PROMPT_WINDOW: usize = 8;
const REPETITION_WINDOW: usize = 6;
const REPETITION_THRESHOLD: usize = 3;

/// Append-only action/result log with the sliding window LoopDetector
/// operates over.
#[derive(Debug, Default)]
pub struct History {
    records: VecDeque<ActionRecord>,
}

impl History {
    pub fn new() -> Self {
        Self { records: VecDeque::new() }
    }

    pub fn push(&mut self, record: ActionRecord) {
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last(&self) -> Option<&ActionRecord> {
        self.records.back()
    }

    /// `Step N: action "target" OK|FAILED -> result`, last 8 records.
    pub fn format_for_prompt(&self) -> String {
        self.records
            .iter()
            .rev()
            .take(PROMPT_WINDOW)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|r| {
                let target = r.target.as_deref().unwrap_or("-");
                let status = if r.success { "OK" } else { "FAILED" };
                let result = r.result.as_deref().unwrap_or("");
                format!("Step {}: {} \"{}\" {} -> {}", r.step, r.action, target, status, result)
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// One-liner describing the immediately prior record, if any.
    pub fn last_action_result(&self) -> Option<String> {
        self.last().map(|r| {
            let target = r.target.as_deref().unwrap_or("-");
            let status = if r.success { "OK" } else { "FAILED" };
            format!("{} \"{}\" {} -> {}", r.action, target, status, r.result.as_deref().unwrap_or(""))
        })
    }

    fn tail(&self, n: usize) -> Vec<&ActionRecord> {
        let len = self.records.len();
        let start = len.saturating_sub(n);
        self.records.iter().skip(start).collect()
    }
}

/// Detects non-progress from the action/result history. Holds no state of
/// its own beyond the `History` it is asked to inspect on each call —
/// every predicate is a pure function of the current record window.
#[derive(Debug, Default)]
pub struct LoopDetector;

impl LoopDetector {
    pub fn new() -> Self {
        Self
    }

    /// True when any of:
    /// 1. the last 2 records equal `(action, target)`.
    /// 2. the last 4 records form an A→B→A→B alternation.
    /// 3. `(action, target)` occurs ≥ 3 times in the last 6 records.
    pub fn is_repetitive(&self, history: &History, action: &str, target: Option<&str>) -> bool {
        let last2 = history.tail(2);
        if last2.len() == 2 && last2.iter().all(|r| matches(r, action, target)) {
            return true;
        }

        let last4 = history.tail(4);
        if last4.len() == 4 {
            let keys: Vec<(String, Option<String>)> =
                last4.iter().map(|r| (r.action.clone(), r.target.clone())).collect();
            if keys[0] == keys[2] && keys[1] == keys[3] && keys[0] != keys[1] {
                return true;
            }
        }

        let last6 = history.tail(REPETITION_WINDOW);
        let count = last6.iter().filter(|r| matches(r, action, target)).count();
        count >= REPETITION_THRESHOLD
    }

    /// True when either of the last 2 records has `success=false`.
    pub fn had_recent_failure(&self, history: &History) -> bool {
        history.tail(2).iter().any(|r| !r.success)
    }
}

fn matches(record: &ActionRecord, action: &str, target: Option<&str>) -> bool {
    record.action == action && record.target.as_deref() == target
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(step: u32, action: &str, target: Option<&str>, success: bool) -> ActionRecord {
        ActionRecord {
            step,
            action: action.to_string(),
            target: target.map(|s| s.to_string()),
            result: Some("ok".to_string()),
            success,
        }
    }

    #[test]
    fn last_two_identical_is_repetitive() {
        let mut h = History::new();
        h.push(record(1, "tap", Some("5"), true));
        h.push(record(2, "tap", Some("5"), true));
        let d = LoopDetector::new();
        assert!(d.is_repetitive(&h, "tap", Some("5")));
    }

    #[test]
    fn abab_alternation_over_last_four_is_repetitive() {
        let mut h = History::new();
        h.push(record(1, "tap", Some("a"), true));
        h.push(record(2, "back", None, true));
        h.push(record(3, "tap", Some("a"), true));
        h.push(record(4, "back", None, true));
        let d = LoopDetector::new();
        assert!(d.is_repetitive(&h, "back", None));
    }

    #[test]
    fn three_occurrences_in_last_six_is_repetitive() {
        let mut h = History::new();
        h.push(record(1, "swipe", Some("u"), true));
        h.push(record(2, "wait", None, true));
        h.push(record(3, "swipe", Some("u"), true));
        h.push(record(4, "wait", None, true));
        h.push(record(5, "swipe", Some("u"), true));
        h.push(record(6, "tap", Some("9"), true));
        let d = LoopDetector::new();
        assert!(!d.is_repetitive(&h, "tap", Some("9")));
        assert!(d.is_repetitive(&h, "swipe", Some("u")));
    }

    #[test]
    fn distinct_actions_are_not_repetitive() {
        let mut h = History::new();
        h.push(record(1, "tap", Some("1"), true));
        h.push(record(2, "tap", Some("2"), true));
        h.push(record(3, "tap", Some("3"), true));
        let d = LoopDetector::new();
        assert!(!d.is_repetitive(&h, "tap", Some("4")));
    }

    #[test]
    fn recent_failure_detected_within_last_two() {
        let mut h = History::new();
        h.push(record(1, "tap", Some("1"), true));
        h.push(record(2, "tap", Some("2"), false));
        let d = LoopDetector::new();
        assert!(d.had_recent_failure(&h));
    }

    #[test]
    fn older_failure_outside_window_not_detected() {
        let mut h = History::new();
        h.push(record(1, "tap", Some("1"), false));
        h.push(record(2, "tap", Some("2"), true));
        h.push(record(3, "tap", Some("3"), true));
        let d = LoopDetector::new();
        assert!(!d.had_recent_failure(&h));
    }

    #[test]
    fn format_for_prompt_caps_at_eight_records() {
        let mut h = History::new();
        for i in 1..=10u32 {
            h.push(record(i, "wait", None, true));
        }
        let formatted = h.format_for_prompt();
        assert_eq!(formatted.lines().count(), 8);
        assert!(formatted.starts_with("Step 3:"));
    }
}
