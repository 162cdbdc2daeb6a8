//! Interpretation of model output and screen-change significance.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use regex::Regex;

use crate::config::DetectionSettings;
use crate::llm::types::{ModelReply, ResultStatus, StructuredResult};
use crate::types::{FailureReason, TestResult, TestStatus};

/// Outcome of comparing two consecutive screenshots.
#[derive(Debug, Clone, Copy)]
pub struct ScreenChange {
    /// Ratio exceeded the significance threshold.
    pub changed: bool,
    pub diff_ratio: f64,
    /// Tiny non-zero difference attributable to cursor blink / clock ticks;
    /// treated as unchanged by the retry policy and stuck detection.
    pub is_noise: bool,
}

/// Deterministic sampled byte-difference metric between screenshot payloads.
///
/// Roughly a thousand evenly spaced bytes are sampled from each decoded
/// payload; a sampled position counts as different when the byte delta
/// exceeds 10. The ratio of differing samples is compared against the
/// configured thresholds. Not a perceptual hash, but deterministic, cheap,
/// and sufficient to separate "same screen" from "new screen".
pub struct ScreenDiff {
    change_threshold: f64,
    noise_threshold: f64,
}

const SAMPLE_TARGET: usize = 1000;
const BYTE_DELTA: i32 = 10;

impl ScreenDiff {
    pub fn new(settings: &DetectionSettings) -> Self {
        Self {
            change_threshold: settings.change_threshold,
            noise_threshold: settings.noise_threshold,
        }
    }

    pub fn decode_payload(image_base64: &str) -> Vec<u8> {
        base64::engine::general_purpose::STANDARD
            .decode(image_base64)
            .unwrap_or_else(|_| image_base64.as_bytes().to_vec())
    }

    pub fn frame_hash(frame: &[u8]) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        let sample_step = (frame.len() / SAMPLE_TARGET).max(1);
        for i in (0..frame.len()).step_by(sample_step) {
            frame[i].hash(&mut hasher);
        }
        hasher.finish()
    }

    pub fn diff_ratio(frame1: &[u8], frame2: &[u8]) -> f64 {
        if frame1.is_empty() || frame2.is_empty() {
            return 1.0;
        }
        if frame1.len() != frame2.len() {
            // Resolution change or re-encode; always significant.
            return 1.0;
        }

        let sample_step = (frame1.len() / SAMPLE_TARGET).max(1);
        let mut diff_count = 0usize;
        let mut total_samples = 0usize;

        for i in (0..frame1.len()).step_by(sample_step) {
            if (frame1[i] as i32 - frame2[i] as i32).abs() > BYTE_DELTA {
                diff_count += 1;
            }
            total_samples += 1;
        }

        if total_samples == 0 {
            return 0.0;
        }
        diff_count as f64 / total_samples as f64
    }

    pub fn compare(&self, previous: &[u8], current: &[u8]) -> ScreenChange {
        let ratio = Self::diff_ratio(previous, current);
        let is_noise = ratio > 0.0 && ratio <= self.noise_threshold;
        ScreenChange {
            changed: ratio > self.change_threshold,
            diff_ratio: ratio,
            is_noise,
        }
    }
}

/// Classification of a completion turn (a model reply without a tool call).
#[derive(Debug, Clone)]
pub struct ResponseAnalysis {
    pub is_complete: bool,
    pub is_success: bool,
    /// Success was granted because every expected action completed, even
    /// though the model never declared a clean terminal success.
    pub success_by_progress: bool,
    pub analysis: String,
    pub structured: Option<StructuredResult>,
}

/// Combines the model's structured verdict with the expected-action
/// checklist. An explicit model-declared failure always stands; the
/// "success by progress" signal only upgrades a missing or in-progress
/// declaration (guards against models that perform the task but fail to
/// emit a clean terminal message).
pub fn analyze_response(reply: &ModelReply, all_expected_complete: bool) -> ResponseAnalysis {
    let is_complete = reply.tool_use.is_none();
    let structured = parse_structured_result(&reply.text);

    let (is_success, success_by_progress) = match structured.as_ref().map(|s| s.status) {
        Some(ResultStatus::Success) => (true, false),
        Some(ResultStatus::Failure) => (false, false),
        Some(ResultStatus::InProgress) | None => (all_expected_complete, all_expected_complete),
    };

    let analysis = structured
        .as_ref()
        .filter(|s| !s.message.is_empty())
        .map(|s| s.message.clone())
        .unwrap_or_else(|| reply.text.clone());

    ResponseAnalysis {
        is_complete,
        is_success,
        success_by_progress,
        analysis,
        structured,
    }
}

/// Pulls a structured verdict out of the model's terminal text. Accepts the
/// bare JSON object, a fenced ```json block, or an object embedded in prose.
pub fn parse_structured_result(text: &str) -> Option<StructuredResult> {
    let trimmed = text.trim();
    if let Ok(parsed) = serde_json::from_str::<StructuredResult>(trimmed) {
        return Some(parsed);
    }

    let fence = Regex::new(r"```(?:json)?\s*([\s\S]*?)```").ok()?;
    if let Some(captures) = fence.captures(trimmed) {
        if let Ok(parsed) = serde_json::from_str::<StructuredResult>(captures[1].trim()) {
            return Some(parsed);
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        serde_json::from_str::<StructuredResult>(&trimmed[start..=end]).ok()
    } else {
        None
    }
}

/// Inputs for the single terminal-record construction.
pub struct ResultParams {
    pub status: TestStatus,
    pub failure_reason: Option<FailureReason>,
    pub failure_details: Option<String>,
    pub completed_steps: u32,
    pub last_action: Option<String>,
    pub analysis: String,
    pub started_at: DateTime<Utc>,
}

/// Builds the terminal record. Non-success results always carry a
/// human-readable failure description so callers can render a message
/// without inspecting internals.
pub fn create_test_result(params: ResultParams) -> TestResult {
    let finished_at = Utc::now();
    let failure_details = if params.status == TestStatus::Success {
        None
    } else {
        Some(params.failure_details.unwrap_or_else(|| {
            params
                .failure_reason
                .map(|r| format!("Run ended with {r:?}"))
                .unwrap_or_else(|| "Run did not complete successfully".into())
        }))
    };

    TestResult {
        status: params.status,
        failure_reason: params.failure_reason,
        failure_details,
        completed_steps: params.completed_steps,
        last_action: params.last_action,
        analysis: params.analysis,
        started_at: params.started_at,
        finished_at,
        duration_ms: (finished_at - params.started_at).num_milliseconds(),
    }
}
