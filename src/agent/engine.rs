//! The iterate-until-done loop controller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::agent::expected::{self, ValidationOutcome};
use crate::agent::hints::HintTracker;
use crate::agent::history::{purge_old_images, HistoryEntry, SessionHistory};
use crate::agent::judge::{self, ResultParams, ScreenDiff};
use crate::agent::loop_control::{ProgressTracker, StuckDetector};
use crate::agent::scaler::CoordinateScaler;
use crate::backend::{AutomationBackend, CaptureResult, InputCommand};
use crate::config::AgentConfig;
use crate::llm::provider::ReasoningModel;
use crate::llm::tools::load_builtin_tools;
use crate::llm::types::{ChatMessage, ContentPart, ImageSource, ToolUse};
use crate::types::{
    ExecutedAction, FailureReason, HintImage, LoopOutcome, Scenario, TestStatus,
};

const SYSTEM_PROMPT: &str = "\
You are ScreenPilot, an automated UI-testing agent.

You receive a test scenario and screenshots of a {width}x{height} display. \
On every turn, decide the single next input action and request it via a tool \
call, using coordinates from the screenshot you were shown.

Rules:
- Perform exactly one action per turn.
- If hint image coordinates are listed, prefer them over visual estimation.
- When the scenario is finished, or cannot proceed, do NOT call a tool. \
Instead reply with a JSON object: {\"status\": \"success\"|\"failure\"|\"in_progress\", \
\"message\": string, \"failureReason\": string|null, \"currentStep\": number|null, \
\"nextExpectedAction\": string|null}.
- Reason step-by-step before every tool call.";

/// How a run terminated. Folded into the single `TestResult` at the one
/// exit point of [`AgentEngine::run`].
struct RunEnd {
    status: TestStatus,
    failure_reason: Option<FailureReason>,
    failure_details: Option<String>,
}

impl RunEnd {
    fn new(
        status: TestStatus,
        failure_reason: Option<FailureReason>,
        failure_details: impl Into<Option<String>>,
    ) -> Self {
        Self {
            status,
            failure_reason,
            failure_details: failure_details.into(),
        }
    }
}

/// Drives one scenario to completion. Both collaborators are injected, so
/// tests run the full loop against in-memory fakes.
pub struct AgentEngine {
    backend: Arc<dyn AutomationBackend>,
    model: Arc<dyn ReasoningModel>,
    config: AgentConfig,
}

impl AgentEngine {
    pub fn new(
        backend: Arc<dyn AutomationBackend>,
        model: Arc<dyn ReasoningModel>,
        config: AgentConfig,
    ) -> Self {
        Self { backend, model, config }
    }

    /// Runs the perception-reasoning-action loop for one scenario.
    ///
    /// Each iteration performs exactly one screenshot capture and at most
    /// one hint re-match request; the executed-action log grows only when an
    /// action is actually dispatched to the backend. Cancellation (the
    /// caller's flag or the backend's polled stop flag) takes effect no
    /// later than the start of the next iteration.
    pub async fn run(
        &self,
        scenario: &Scenario,
        hint_images: Vec<HintImage>,
        cancel: Arc<AtomicBool>,
    ) -> LoopOutcome {
        let started_at = Utc::now();
        let mut history = SessionHistory::new();
        history.push(HistoryEntry {
            ts: started_at.timestamp_millis(),
            role: "user".into(),
            content: Some(scenario.description.clone()),
            action: None,
        });
        let _ = history.flush();

        tracing::info!(
            scenario = %scenario.id,
            title = %scenario.title,
            hints = hint_images.len(),
            session = %history.session_id,
            "agent loop starting"
        );

        let tools = load_builtin_tools().unwrap_or_default();
        let mut checklist = expected::derive_checklist(self.model.as_ref(), scenario).await;
        let mut hints = HintTracker::new(hint_images, self.config.run.confidence_threshold);
        let diff = ScreenDiff::new(&self.config.detection);
        let mut tracker = ProgressTracker::default();
        let mut stuck = StuckDetector::new(&self.config.detection);

        let mut transcript: Vec<ChatMessage> = Vec::new();
        let mut executed: Vec<ExecutedAction> = Vec::new();
        let mut iterations: u32 = 0;
        let mut last_analysis = String::new();
        let mut system_prompt: Option<String> = None;
        let mut previous_frame: Option<Vec<u8>> = None;

        let end: RunEnd = loop {
            if iterations >= self.config.run.max_iterations {
                break RunEnd::new(
                    TestStatus::Timeout,
                    Some(FailureReason::MaxIterations),
                    format!(
                        "Scenario did not complete within {} iterations",
                        self.config.run.max_iterations
                    ),
                );
            }
            iterations += 1;

            // Cooperative cancellation: caller signal plus polled backend
            // flag, both checked at the top of every iteration.
            if cancel.load(Ordering::SeqCst) {
                tracing::info!(iteration = iterations, "caller cancelled the run");
                break RunEnd::new(
                    TestStatus::Stopped,
                    Some(FailureReason::Aborted),
                    "Run aborted by caller".to_string(),
                );
            }
            match self.backend.is_stop_requested().await {
                Ok(true) => {
                    tracing::info!(iteration = iterations, "stop requested via backend");
                    break RunEnd::new(
                        TestStatus::Stopped,
                        Some(FailureReason::UserStopped),
                        "Stop requested by user".to_string(),
                    );
                }
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "stop-flag poll failed, assuming not stopped");
                }
            }

            let capture = match self.backend.capture_screen().await {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(error = %e, iteration = iterations, "screenshot capture failed");
                    break RunEnd::new(
                        TestStatus::Error,
                        Some(FailureReason::Unknown),
                        format!("Screenshot capture failed: {e}"),
                    );
                }
            };

            // Screen-change significance feeds both the hint retry policy
            // and stuck detection. The first frame counts as changed.
            let frame = ScreenDiff::decode_payload(&capture.image_base64);
            let significant = match previous_frame.as_deref() {
                Some(prev) => {
                    let change = diff.compare(prev, &frame);
                    tracing::debug!(
                        iteration = iterations,
                        ratio = change.diff_ratio,
                        changed = change.changed,
                        noise = change.is_noise,
                        "screen compared"
                    );
                    change.changed && !change.is_noise
                }
                None => true,
            };
            tracker.record_screen(ScreenDiff::frame_hash(&frame), significant);
            previous_frame = Some(frame);

            hints
                .refresh(
                    self.backend.as_ref(),
                    &capture.image_base64,
                    capture.scale_factor,
                    significant,
                )
                .await;

            let system = system_prompt
                .get_or_insert_with(|| format_system_prompt(&capture))
                .clone();
            transcript.push(build_user_turn(scenario, &capture, &hints, iterations));
            purge_old_images(&mut transcript, self.config.run.history_image_turns);

            let reply = match self.model.complete(&system, &transcript, &tools).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, iteration = iterations, "model call failed");
                    break RunEnd::new(
                        TestStatus::Error,
                        Some(FailureReason::ApiError),
                        format!("Reasoning model call failed: {e}"),
                    );
                }
            };
            if !reply.text.is_empty() {
                last_analysis = reply.text.clone();
            }

            let mut assistant_parts = Vec::new();
            if !reply.text.is_empty() {
                assistant_parts.push(ContentPart::Text { text: reply.text.clone() });
            }
            if let Some(tool_use) = &reply.tool_use {
                assistant_parts.push(ContentPart::ToolUse {
                    id: tool_use.id.clone(),
                    name: tool_use.name.clone(),
                    input: tool_use.input.clone(),
                });
            }
            if assistant_parts.is_empty() {
                assistant_parts.push(ContentPart::Text { text: "(empty reply)".into() });
            }
            transcript.push(ChatMessage::assistant_parts(assistant_parts));

            let Some(tool_use) = reply.tool_use.clone() else {
                // Completion verdict: no tool call means the model considers
                // the scenario finished one way or the other.
                let analysis = judge::analyze_response(&reply, checklist.all_complete());
                last_analysis = analysis.analysis.clone();
                if analysis.is_success {
                    tracing::info!(
                        iteration = iterations,
                        by_progress = analysis.success_by_progress,
                        "scenario completed successfully"
                    );
                    break RunEnd::new(TestStatus::Success, None, None);
                }
                let reason = analysis
                    .structured
                    .as_ref()
                    .and_then(|s| s.failure_reason)
                    .unwrap_or(if checklist.is_empty() || checklist.all_complete() {
                        FailureReason::Unknown
                    } else {
                        FailureReason::IncompleteActions
                    });
                tracing::info!(iteration = iterations, reason = ?reason, "scenario failed");
                break RunEnd::new(
                    TestStatus::Failure,
                    Some(reason),
                    analysis.analysis.clone(),
                );
            };

            let command = match parse_tool_use(&tool_use) {
                Ok(c) => c,
                Err(msg) => {
                    tracing::warn!(tool = %tool_use.name, "unparseable tool call");
                    transcript.push(tool_result_turn(&tool_use.id, msg));
                    continue;
                }
            };

            let scaler = CoordinateScaler::from_capture(&capture);
            let screen_command = scaler.scale_command(command.clone());
            let description = screen_command.describe();
            tracing::info!(iteration = iterations, action = %description, "dispatching action");

            let dispatch_result = self.backend.dispatch(screen_command).await;
            let success = dispatch_result.is_ok();
            let action = ExecutedAction {
                index: executed.len(),
                action_type: command.kind().to_string(),
                description: description.clone(),
                success,
                timestamp: Utc::now(),
            };
            history.push(HistoryEntry {
                ts: action.timestamp.timestamp_millis(),
                role: "tool".into(),
                content: None,
                action: serde_json::to_value(&action).ok(),
            });
            let _ = history.flush();
            executed.push(action);

            let result_text = match &dispatch_result {
                Ok(()) => format!("Executed {description}"),
                Err(e) => {
                    tracing::warn!(error = %e, action = %description, "action dispatch failed");
                    format!("Action failed: {e}")
                }
            };
            transcript.push(tool_result_turn(&tool_use.id, result_text));

            tracker.record_action(&command);
            stuck.record_action(&command);

            if success {
                if let Some(current) = checklist.current().cloned() {
                    match expected::validate_action(&current, &command, &reply.text) {
                        ValidationOutcome::Matched => checklist.mark_current_complete(),
                        ValidationOutcome::Ambiguous => {
                            match expected::confirm_with_model(
                                self.model.as_ref(),
                                &current,
                                &command,
                                &reply.text,
                            )
                            .await
                            {
                                Ok(true) => checklist.mark_current_complete(),
                                Ok(false) => {}
                                Err(e) => {
                                    tracing::warn!(error = %e, "action confirmation call failed");
                                }
                            }
                        }
                        ValidationOutcome::Unrelated => {}
                    }
                }
            }

            if stuck.detect_loop(&tracker) {
                tracing::warn!(
                    iteration = iterations,
                    unchanged_screens = tracker.unchanged_screens,
                    repeated_actions = tracker.repeated_actions,
                    "loop detected, terminating"
                );
                break RunEnd::new(
                    TestStatus::Failure,
                    Some(FailureReason::StuckInLoop),
                    format!(
                        "Same action repeated {} times with {} unchanged screenshots",
                        tracker.repeated_actions, tracker.unchanged_screens
                    ),
                );
            }

            if let Some(stop) = self.wait_between_iterations(&cancel).await {
                break stop;
            }
        };

        let completed_steps = checklist.completed_count();
        let test_result = judge::create_test_result(ResultParams {
            status: end.status,
            failure_reason: end.failure_reason,
            failure_details: end.failure_details,
            completed_steps,
            last_action: executed.last().map(|a| a.description.clone()),
            analysis: last_analysis,
            started_at,
        });

        history.push(HistoryEntry {
            ts: test_result.finished_at.timestamp_millis(),
            role: "result".into(),
            content: Some(format!("{:?}", test_result.status)),
            action: serde_json::to_value(&test_result).ok(),
        });
        let _ = history.flush();

        tracing::info!(
            scenario = %scenario.id,
            status = ?test_result.status,
            iterations,
            actions = executed.len(),
            "agent loop finished"
        );

        let error = if test_result.status == TestStatus::Error {
            test_result.failure_details.clone()
        } else {
            None
        };
        LoopOutcome {
            success: test_result.status == TestStatus::Success,
            error,
            failed_at_action: executed.iter().rev().find(|a| !a.success).map(|a| a.index),
            last_successful_action: executed
                .iter()
                .rev()
                .find(|a| a.success)
                .map(|a| a.description.clone()),
            completed_action_count: Some(completed_steps),
            executed_actions: executed,
            iterations,
            test_result,
        }
    }

    /// Cancellable pause between iterations, polling both stop triggers at
    /// the configured granularity. Actions already dispatched are never
    /// interrupted; this only delays the next iteration.
    async fn wait_between_iterations(&self, cancel: &AtomicBool) -> Option<RunEnd> {
        let total = Duration::from_millis(self.config.run.iteration_wait_ms);
        let interval = Duration::from_millis(self.config.run.poll_interval_ms.max(1));
        let mut elapsed = Duration::ZERO;

        while elapsed < total {
            if cancel.load(Ordering::SeqCst) {
                return Some(RunEnd::new(
                    TestStatus::Stopped,
                    Some(FailureReason::Aborted),
                    "Run aborted by caller".to_string(),
                ));
            }
            if let Ok(true) = self.backend.is_stop_requested().await {
                return Some(RunEnd::new(
                    TestStatus::Stopped,
                    Some(FailureReason::UserStopped),
                    "Stop requested by user".to_string(),
                ));
            }
            let sleep = interval.min(total - elapsed);
            tokio::time::sleep(sleep).await;
            elapsed += sleep;
        }
        None
    }
}

fn format_system_prompt(capture: &CaptureResult) -> String {
    SYSTEM_PROMPT
        .replace("{width}", &capture.resized_width.to_string())
        .replace("{height}", &capture.resized_height.to_string())
}

/// Builds the multimodal user turn: screenshot, scenario text, and — only
/// when hint images were supplied — the hint block with still-pending
/// attachments and the located-coordinates summary.
fn build_user_turn(
    scenario: &Scenario,
    capture: &CaptureResult,
    hints: &HintTracker,
    iteration: u32,
) -> ChatMessage {
    let mut parts = vec![ContentPart::Image {
        source: ImageSource::base64("image/png", capture.image_base64.clone()),
    }];

    let mut text = if iteration == 1 {
        format!("Test scenario: {}\n{}", scenario.title, scenario.description)
    } else {
        format!("Current screen after the previous action (iteration {iteration}).")
    };

    if !hints.is_empty() {
        text.push_str("\n\nHint images mark UI elements relevant to this scenario.");
        if let Some(summary) = hints.coordinates_summary() {
            text.push_str("\nLocated hint image coordinates (screenshot pixels):\n");
            text.push_str(&summary);
        }
        let pending = hints.pending_attachments();
        if !pending.is_empty() {
            text.push_str(&format!(
                "\n{} hint image(s) not located yet are attached after the screenshot.",
                pending.len()
            ));
            for image in pending {
                parts.push(ContentPart::Image {
                    source: ImageSource::base64(&image.media_type, image.data.clone()),
                });
            }
        }
    }

    parts.push(ContentPart::Text { text });
    ChatMessage::user_parts(parts)
}

fn tool_result_turn(tool_use_id: &str, content: String) -> ChatMessage {
    ChatMessage::user_parts(vec![ContentPart::ToolResult {
        tool_use_id: tool_use_id.to_string(),
        content,
    }])
}

fn parse_tool_use(tool_use: &ToolUse) -> Result<InputCommand, String> {
    let args = &tool_use.input;
    let int = |key: &str| args[key].as_i64().unwrap_or(0) as i32;
    let text = |key: &str| args[key].as_str().unwrap_or("").to_string();

    match tool_use.name.as_str() {
        "mouse_move" => Ok(InputCommand::MouseMove { x: int("x"), y: int("y") }),
        "left_click" => Ok(InputCommand::LeftClick { x: int("x"), y: int("y") }),
        "right_click" => Ok(InputCommand::RightClick { x: int("x"), y: int("y") }),
        "middle_click" => Ok(InputCommand::MiddleClick { x: int("x"), y: int("y") }),
        "double_click" => Ok(InputCommand::DoubleClick { x: int("x"), y: int("y") }),
        "triple_click" => Ok(InputCommand::TripleClick { x: int("x"), y: int("y") }),
        "left_click_drag" => Ok(InputCommand::LeftClickDrag {
            start_x: int("start_x"),
            start_y: int("start_y"),
            end_x: int("end_x"),
            end_y: int("end_y"),
        }),
        "scroll" => Ok(InputCommand::Scroll {
            x: int("x"),
            y: int("y"),
            direction: {
                let d = text("direction");
                if d.is_empty() { "down".to_string() } else { d }
            },
            amount: args["amount"].as_i64().unwrap_or(3) as i32,
        }),
        "type_text" => Ok(InputCommand::TypeText { text: text("text") }),
        "key" => Ok(InputCommand::Key { keys: text("keys") }),
        "hold_key" => Ok(InputCommand::HoldKey {
            key: text("key"),
            hold: args["hold"].as_bool().unwrap_or(true),
        }),
        other => Err(format!("Unknown tool: {other}")),
    }
}
