//! Progress tracking and stuck/loop detection.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};

use crate::backend::InputCommand;
use crate::config::DetectionSettings;

/// Per-run progress state. Owned exclusively by the loop controller and
/// mutated once per iteration; no locking needed.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    pub last_screen_hash: Option<u64>,
    pub unchanged_screens: u32,
    pub last_action_hash: Option<u64>,
    pub last_action_type: Option<String>,
    pub repeated_actions: u32,
    pub last_coordinate: Option<(i32, i32)>,
}

impl ProgressTracker {
    pub fn record_screen(&mut self, hash: u64, changed: bool) {
        if changed {
            self.unchanged_screens = 0;
        } else {
            self.unchanged_screens += 1;
        }
        self.last_screen_hash = Some(hash);
    }

    pub fn record_action(&mut self, command: &InputCommand) {
        let hash = action_hash(command);
        if self.last_action_hash == Some(hash) {
            self.repeated_actions += 1;
        } else {
            self.repeated_actions = 1;
        }
        self.last_action_hash = Some(hash);
        self.last_action_type = Some(command.kind().to_string());
        if let Some(coord) = command.coordinate() {
            self.last_coordinate = Some(coord);
        }
    }
}

/// Hash over action type plus target coordinate: two clicks count as the
/// same action only when they hit the same point.
pub fn action_hash(command: &InputCommand) -> u64 {
    let mut hasher = DefaultHasher::new();
    command.kind().hash(&mut hasher);
    command.coordinate().hash(&mut hasher);
    if let InputCommand::TypeText { text } = command {
        text.hash(&mut hasher);
    }
    if let InputCommand::Key { keys } = command {
        keys.hash(&mut hasher);
    }
    hasher.finish()
}

/// Flags the agent as stuck when it keeps issuing the same action against a
/// screen that is not changing. Both conditions are required: repeating an
/// action on a genuinely static screen (e.g. polling for a slow dialog) is
/// legitimate until the screen also stops responding for long enough.
pub struct StuckDetector {
    repeat_threshold: u32,
    unchanged_threshold: u32,
    window: VecDeque<u64>,
    window_cap: usize,
}

impl StuckDetector {
    pub fn new(settings: &DetectionSettings) -> Self {
        Self {
            repeat_threshold: settings.repeat_action_threshold,
            unchanged_threshold: settings.unchanged_screen_threshold,
            window: VecDeque::new(),
            window_cap: settings.action_window.max(1),
        }
    }

    pub fn record_action(&mut self, command: &InputCommand) {
        if self.window.len() == self.window_cap {
            self.window.pop_front();
        }
        self.window.push_back(action_hash(command));
    }

    /// True when the trailing run of identical actions reaches the repeat
    /// threshold while the screenshot has stayed unchanged past its own
    /// threshold.
    pub fn detect_loop(&self, tracker: &ProgressTracker) -> bool {
        let Some(&last) = self.window.back() else {
            return false;
        };
        let trailing_repeats = self
            .window
            .iter()
            .rev()
            .take_while(|&&h| h == last)
            .count() as u32;

        trailing_repeats >= self.repeat_threshold
            && tracker.unchanged_screens >= self.unchanged_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> DetectionSettings {
        DetectionSettings::default()
    }

    fn click(x: i32, y: i32) -> InputCommand {
        InputCommand::LeftClick { x, y }
    }

    #[test]
    fn identical_actions_alone_do_not_trip_detection() {
        let mut detector = StuckDetector::new(&settings());
        let mut tracker = ProgressTracker::default();
        for _ in 0..6 {
            detector.record_action(&click(10, 10));
            tracker.record_action(&click(10, 10));
            // Screen keeps changing between the clicks.
            tracker.record_screen(1, true);
        }
        assert!(!detector.detect_loop(&tracker));
    }

    #[test]
    fn unchanged_screens_alone_do_not_trip_detection() {
        let mut detector = StuckDetector::new(&settings());
        let mut tracker = ProgressTracker::default();
        for i in 0..8 {
            // Different coordinate every time: not a repeated action.
            detector.record_action(&click(i, i));
            tracker.record_action(&click(i, i));
            tracker.record_screen(1, false);
        }
        assert!(!detector.detect_loop(&tracker));
    }

    #[test]
    fn repeats_plus_static_screen_trip_detection() {
        let mut detector = StuckDetector::new(&settings());
        let mut tracker = ProgressTracker::default();
        for _ in 0..5 {
            detector.record_action(&click(10, 10));
            tracker.record_action(&click(10, 10));
            tracker.record_screen(1, false);
        }
        assert!(detector.detect_loop(&tracker));
    }

    #[test]
    fn interleaved_action_resets_trailing_run() {
        let mut detector = StuckDetector::new(&settings());
        let mut tracker = ProgressTracker::default();
        for _ in 0..4 {
            detector.record_action(&click(10, 10));
            tracker.record_action(&click(10, 10));
            tracker.record_screen(1, false);
        }
        detector.record_action(&click(99, 99));
        tracker.record_action(&click(99, 99));
        tracker.record_screen(1, false);
        assert!(!detector.detect_loop(&tracker));
    }

    #[test]
    fn same_type_different_coordinate_is_a_different_action() {
        assert_ne!(action_hash(&click(10, 10)), action_hash(&click(11, 10)));
        assert_ne!(
            action_hash(&InputCommand::TypeText { text: "a".into() }),
            action_hash(&InputCommand::TypeText { text: "b".into() })
        );
    }

    #[test]
    fn tracker_counts_repeats_and_resets() {
        let mut tracker = ProgressTracker::default();
        tracker.record_action(&click(5, 5));
        tracker.record_action(&click(5, 5));
        assert_eq!(tracker.repeated_actions, 2);
        tracker.record_action(&click(6, 6));
        assert_eq!(tracker.repeated_actions, 1);
        assert_eq!(tracker.last_coordinate, Some((6, 6)));
    }
}
