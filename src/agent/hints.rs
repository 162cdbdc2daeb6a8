//! Hint-image matching state and the per-iteration retry policy.

use crate::backend::{AutomationBackend, MatchRequest, MatchResult, TemplateImage};
use crate::types::HintImage;

/// Last known match state for one hint image. `last == None` means the
/// image has never produced a result (first iteration, or every match call
/// so far failed outright).
#[derive(Debug, Clone)]
pub struct HintState {
    pub image: HintImage,
    pub last: Option<MatchResult>,
}

/// Tracks all hint images for one run, in author-declared order, and decides
/// which of them are re-submitted to the template matcher each iteration.
pub struct HintTracker {
    states: Vec<HintState>,
    confidence_threshold: f32,
}

impl HintTracker {
    pub fn new(mut images: Vec<HintImage>, confidence_threshold: f32) -> Self {
        // Author-declared order is significant everywhere downstream.
        images.sort_by_key(|i| i.display_order);
        Self {
            states: images
                .into_iter()
                .map(|image| HintState { image, last: None })
                .collect(),
            confidence_threshold,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &[HintState] {
        &self.states
    }

    /// Candidate rule, evaluated per image independently:
    /// - never matched -> candidate
    /// - not found, no error -> candidate (element simply not visible yet)
    /// - permanent error -> never a candidate again
    /// - transient / size-related error -> candidate only after a
    ///   significant screen change (resolution or layout may have changed)
    /// - found -> candidate only after a significant screen change
    ///   (coordinates may have shifted; otherwise the known coordinates are
    ///   reused without re-matching)
    pub fn candidates(&self, screen_changed: bool) -> Vec<usize> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, state)| match &state.last {
                None => true,
                Some(result) => {
                    if let Some(code) = result.error_code {
                        if code.is_permanent() {
                            false
                        } else {
                            screen_changed
                        }
                    } else if result.error.is_some() {
                        screen_changed
                    } else if result.found {
                        screen_changed
                    } else {
                        true
                    }
                }
            })
            .map(|(i, _)| i)
            .collect()
    }

    /// Submits the current candidate set to the template matcher and folds
    /// the results back in. Non-candidates keep their previous result
    /// verbatim, coordinates included. A failed match call leaves every
    /// candidate in its prior state; the loop continues without updated
    /// coordinates.
    pub async fn refresh(
        &mut self,
        backend: &dyn AutomationBackend,
        screenshot_base64: &str,
        scale_factor: f64,
        screen_changed: bool,
    ) {
        if self.states.is_empty() {
            return;
        }
        let candidates = self.candidates(screen_changed);
        if candidates.is_empty() {
            tracing::debug!("no hint-image candidates this iteration");
            return;
        }

        // Requests and results are correlated strictly by array position.
        // File names are display labels only and may collide.
        let template_images: Vec<TemplateImage> = candidates
            .iter()
            .map(|&i| TemplateImage {
                image_data: self.states[i].image.data.clone(),
                file_name: self.states[i].image.file_name.clone(),
            })
            .collect();

        let request = MatchRequest {
            screenshot_base64: screenshot_base64.to_string(),
            template_images,
            scale_factor,
            confidence_threshold: self.confidence_threshold,
        };

        match backend.match_hint_images(request).await {
            Ok(results) => {
                for result in results {
                    match candidates.get(result.index) {
                        Some(&state_idx) => {
                            self.states[state_idx].last = Some(result.match_result);
                        }
                        None => {
                            tracing::warn!(
                                index = result.index,
                                "match result index out of candidate range, dropping"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "hint match call failed; keeping previous hint state");
            }
        }
    }

    /// Text summary of successfully located hint images, one line per image
    /// in author order: `image<N>(<fileName>): <x>,<y>`. Images without a
    /// found result are not listed.
    pub fn coordinates_summary(&self) -> Option<String> {
        let lines: Vec<String> = self
            .states
            .iter()
            .enumerate()
            .filter_map(|(i, state)| {
                let result = state.last.as_ref()?;
                if !result.found {
                    return None;
                }
                let (x, y) = (result.center_x?, result.center_y?);
                Some(format!("image{}({}): {},{}", i + 1, state.image.file_name, x, y))
            })
            .collect();

        if lines.is_empty() {
            None
        } else {
            Some(lines.join("\n"))
        }
    }

    /// Hint images still pending classification: not yet found and not ruled
    /// out by a permanent error. These stay attached to the prompt so the
    /// model can locate them visually even while template matching has not.
    pub fn pending_attachments(&self) -> Vec<&HintImage> {
        self.states
            .iter()
            .filter(|state| match &state.last {
                None => true,
                Some(result) => {
                    !result.found
                        && !result
                            .error_code
                            .map(|code| code.is_permanent())
                            .unwrap_or(false)
                }
            })
            .map(|state| &state.image)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{
        CaptureResult, HintImageMatchResult, InputCommand, MatchErrorCode,
    };
    use crate::errors::{PilotError, PilotResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    fn hint(id: &str, file_name: &str, order: u32) -> HintImage {
        HintImage {
            id: id.into(),
            scenario_id: "s1".into(),
            file_name: file_name.into(),
            data: format!("payload-{id}"),
            media_type: "image/png".into(),
            display_order: order,
        }
    }

    fn found_at(x: i32, y: i32) -> MatchResult {
        MatchResult {
            found: true,
            center_x: Some(x),
            center_y: Some(y),
            confidence: Some(0.92),
            template_width: 40,
            template_height: 20,
            error: None,
            error_code: None,
        }
    }

    fn not_found() -> MatchResult {
        MatchResult {
            found: false,
            center_x: None,
            center_y: None,
            confidence: Some(0.3),
            template_width: 40,
            template_height: 20,
            error: None,
            error_code: None,
        }
    }

    fn errored(code: MatchErrorCode, message: &str) -> MatchResult {
        MatchResult {
            found: false,
            center_x: None,
            center_y: None,
            confidence: None,
            template_width: 0,
            template_height: 0,
            error: Some(message.into()),
            error_code: Some(code),
        }
    }

    /// Backend fake that answers match requests from a queue and records
    /// every request it saw.
    struct MatchingBackend {
        requests: Mutex<Vec<MatchRequest>>,
        responses: Mutex<Vec<PilotResult<Vec<HintImageMatchResult>>>>,
    }

    impl MatchingBackend {
        fn new(responses: Vec<PilotResult<Vec<HintImageMatchResult>>>) -> Self {
            Self {
                requests: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl AutomationBackend for MatchingBackend {
        async fn capture_screen(&self) -> PilotResult<CaptureResult> {
            unimplemented!("not used in hint tests")
        }

        async fn match_hint_images(
            &self,
            request: MatchRequest,
        ) -> PilotResult<Vec<HintImageMatchResult>> {
            self.requests.lock().unwrap().push(request);
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                responses.remove(0)
            }
        }

        async fn is_stop_requested(&self) -> PilotResult<bool> {
            Ok(false)
        }

        async fn dispatch(&self, _command: InputCommand) -> PilotResult<()> {
            Ok(())
        }
    }

    fn match_entry(index: usize, file_name: &str, result: MatchResult) -> HintImageMatchResult {
        HintImageMatchResult {
            index,
            file_name: file_name.into(),
            match_result: result,
        }
    }

    #[test]
    fn first_iteration_everything_is_a_candidate() {
        let tracker = HintTracker::new(vec![hint("a", "a.png", 0), hint("b", "b.png", 1)], 0.7);
        assert_eq!(tracker.candidates(false), vec![0, 1]);
    }

    #[test]
    fn permanent_error_is_never_retried() {
        let mut tracker = HintTracker::new(vec![hint("a", "a.png", 0)], 0.7);
        tracker.states[0].last = Some(errored(
            MatchErrorCode::NonFiniteConfidence,
            "insufficient variance",
        ));
        assert!(tracker.candidates(false).is_empty());
        assert!(tracker.candidates(true).is_empty());

        tracker.states[0].last = Some(errored(
            MatchErrorCode::InsufficientOpacity,
            "too transparent",
        ));
        assert!(tracker.candidates(true).is_empty());
    }

    #[test]
    fn transient_errors_retry_only_on_screen_change() {
        let mut tracker = HintTracker::new(vec![hint("a", "a.png", 0)], 0.7);
        for code in [
            MatchErrorCode::TemplateTooLarge,
            MatchErrorCode::ScreenshotDecodeError,
            MatchErrorCode::TemplateBase64DecodeError,
        ] {
            tracker.states[0].last = Some(errored(code, "boom"));
            assert!(tracker.candidates(false).is_empty(), "{code:?} retried without change");
            assert_eq!(tracker.candidates(true), vec![0], "{code:?} not retried on change");
        }
    }

    #[test]
    fn found_image_is_rematched_only_on_screen_change() {
        let mut tracker = HintTracker::new(vec![hint("a", "a.png", 0)], 0.7);
        tracker.states[0].last = Some(found_at(200, 150));
        assert!(tracker.candidates(false).is_empty());
        assert_eq!(tracker.candidates(true), vec![0]);
    }

    #[test]
    fn not_found_without_error_is_always_a_candidate() {
        let mut tracker = HintTracker::new(vec![hint("a", "a.png", 0)], 0.7);
        tracker.states[0].last = Some(not_found());
        assert_eq!(tracker.candidates(false), vec![0]);
    }

    #[tokio::test]
    async fn positional_mapping_with_duplicate_file_names() {
        // Three images named btn.png with distinct payloads; the middle one
        // is excluded from the candidate set by a prior found result.
        let mut tracker = HintTracker::new(
            vec![hint("a", "btn.png", 0), hint("b", "btn.png", 1), hint("c", "btn.png", 2)],
            0.7,
        );
        tracker.states[1].last = Some(found_at(10, 10));

        let backend = MatchingBackend::new(vec![Ok(vec![
            match_entry(0, "btn.png", found_at(100, 100)),
            match_entry(1, "btn.png", found_at(300, 300)),
        ])]);

        tracker.refresh(&backend, "screen", 1.0, false).await;

        // Request carried exactly the two candidates, in order, with their
        // own payloads.
        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        let sent = &requests[0].template_images;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].image_data, "payload-a");
        assert_eq!(sent[1].image_data, "payload-c");

        // Result index 0 -> first candidate (state 0), index 1 -> state 2.
        assert_eq!(tracker.states[0].last.as_ref().unwrap().center_x, Some(100));
        assert_eq!(tracker.states[1].last.as_ref().unwrap().center_x, Some(10));
        assert_eq!(tracker.states[2].last.as_ref().unwrap().center_x, Some(300));
    }

    #[tokio::test]
    async fn failed_match_call_keeps_previous_state() {
        let mut tracker = HintTracker::new(vec![hint("a", "a.png", 0)], 0.7);
        let backend = MatchingBackend::new(vec![Err(PilotError::Backend("ipc down".into()))]);

        tracker.refresh(&backend, "screen", 1.0, false).await;

        assert!(tracker.states[0].last.is_none());
        assert!(tracker.coordinates_summary().is_none());
        // Still a candidate next time around.
        assert_eq!(tracker.candidates(false), vec![0]);
    }

    #[tokio::test]
    async fn transient_decode_error_then_retry_produces_summary_line() {
        let mut tracker = HintTracker::new(vec![hint("a", "btn.png", 0)], 0.7);

        let backend = MatchingBackend::new(vec![
            Ok(vec![match_entry(
                0,
                "btn.png",
                errored(MatchErrorCode::TemplateBase64DecodeError, "Base64 decode error: bad data"),
            )]),
            Ok(vec![match_entry(0, "btn.png", found_at(200, 150))]),
        ]);

        // Iteration 1: decode error recorded.
        tracker.refresh(&backend, "screen1", 1.0, false).await;
        assert!(tracker.coordinates_summary().is_none());
        // No screen change: nothing resubmitted.
        tracker.refresh(&backend, "screen1", 1.0, false).await;
        assert_eq!(backend.requests.lock().unwrap().len(), 1);

        // Screen changed: retried and found.
        tracker.refresh(&backend, "screen2", 1.0, true).await;
        assert_eq!(tracker.coordinates_summary().unwrap(), "image1(btn.png): 200,150");
    }

    #[test]
    fn summary_preserves_author_order_and_skips_unfound() {
        let mut tracker = HintTracker::new(
            vec![hint("a", "first.png", 0), hint("b", "second.png", 1), hint("c", "third.png", 2)],
            0.7,
        );
        tracker.states[0].last = Some(found_at(1, 2));
        tracker.states[1].last = Some(not_found());
        tracker.states[2].last = Some(found_at(30, 40));

        assert_eq!(
            tracker.coordinates_summary().unwrap(),
            "image1(first.png): 1,2\nimage3(third.png): 30,40"
        );
    }

    #[test]
    fn pending_attachments_exclude_found_and_permanent() {
        let mut tracker = HintTracker::new(
            vec![hint("a", "a.png", 0), hint("b", "b.png", 1), hint("c", "c.png", 2)],
            0.7,
        );
        tracker.states[0].last = Some(found_at(1, 1));
        tracker.states[1].last = Some(errored(MatchErrorCode::InsufficientOpacity, "clear"));

        let pending = tracker.pending_attachments();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, "c");
    }
}
