//! Core data model for scenario runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A natural-language test scenario. Immutable during a run except for the
/// status/result fields, which only the loop controller mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    pub id: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub status: ScenarioStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
    Skipped,
}

/// A reference image supplied by the test author marking a UI element the
/// agent should locate via template matching. Read-only input to the loop;
/// display order is significant and must be preserved in prompts and in
/// match-request arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintImage {
    pub id: String,
    pub scenario_id: String,
    pub file_name: String,
    /// Base64-encoded image payload.
    pub data: String,
    /// Declared media type, e.g. `image/png`. The non-standard `image/jpg`
    /// alias is normalized before any model call.
    pub media_type: String,
    pub display_order: u32,
}

/// A checklist item derived from the scenario description, used to validate
/// that the agent is performing the intended steps. `completed` is monotonic:
/// once set it is never cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpectedAction {
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub target_elements: Option<Vec<String>>,
    /// Expected tool-action type, e.g. `left_click` or `type_text`.
    #[serde(default)]
    pub action_type: Option<String>,
    #[serde(default)]
    pub verification: Option<String>,
    #[serde(default)]
    pub completed: bool,
}

/// Append-only audit-trail entry. The log length equals the number of
/// actions actually dispatched to the automation backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutedAction {
    pub index: usize,
    pub action_type: String,
    pub description: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Success,
    Failure,
    Timeout,
    Stopped,
    Error,
}

/// Closed enumeration of terminal failure causes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    ElementNotFound,
    ActionNoEffect,
    ActionExecutionError,
    StuckInLoop,
    UnexpectedState,
    ActionMismatch,
    IncompleteActions,
    VerificationFailed,
    ExtractionFailed,
    InvalidResultFormat,
    MaxIterations,
    ApiError,
    UserStopped,
    Aborted,
    Unknown,
}

/// Terminal record of a scenario run. Created exactly once, at loop
/// termination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub status: TestStatus,
    pub failure_reason: Option<FailureReason>,
    /// Human-readable failure description, always present on non-success.
    pub failure_details: Option<String>,
    pub completed_steps: u32,
    pub last_action: Option<String>,
    /// The model's own explanation of the final state.
    pub analysis: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

/// Result of a full loop invocation, returned to the batch runner / UI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopOutcome {
    pub success: bool,
    pub error: Option<String>,
    pub executed_actions: Vec<ExecutedAction>,
    pub iterations: u32,
    pub test_result: TestResult,
    pub failed_at_action: Option<usize>,
    pub last_successful_action: Option<String>,
    pub completed_action_count: Option<u32>,
}
