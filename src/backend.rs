//! Command interface to the native automation backend.
//!
//! The backend owns screen capture, OS input injection and image template
//! matching. This crate only talks to it through [`AutomationBackend`] and
//! never reimplements any of it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PilotResult;

/// Screenshot capture result. The image is resized for the model; the
/// metadata is what the coordinate scaler needs to map model coordinates
/// back to the screen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureResult {
    pub original_width: u32,
    pub original_height: u32,
    pub resized_width: u32,
    pub resized_height: u32,
    /// Resize factor applied to the capture (e.g. 0.6 means 60% of original).
    pub scale_factor: f64,
    pub image_base64: String,
    pub monitor_id: u32,
    /// Ratio of physical pixels to logical points (2.0 on Retina displays).
    pub display_scale_factor: f64,
}

/// One hint image submitted for template matching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateImage {
    /// Base64 encoded image data (original size).
    pub image_data: String,
    /// Display name. Not unique: multiple hint images may share a name, so
    /// results must be mapped back by array position, never by name.
    pub file_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub screenshot_base64: String,
    pub template_images: Vec<TemplateImage>,
    pub scale_factor: f64,
    pub confidence_threshold: f32,
}

/// Error classification for a failed template match. Decides whether a
/// later screenshot could plausibly make the image match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchErrorCode {
    /// Screenshot could not be decoded; a different capture may work.
    ScreenshotDecodeError,
    /// Template base64 payload could not be decoded.
    TemplateBase64DecodeError,
    /// Template image could not be decoded.
    TemplateImageDecodeError,
    /// Template is too transparent to match reliably.
    InsufficientOpacity,
    /// Matching produced a non-finite confidence (template lacks variance).
    NonFiniteConfidence,
    /// Template is larger than the screenshot; may resolve when the screen
    /// resolution or layout changes.
    TemplateTooLarge,
}

impl MatchErrorCode {
    /// Permanent errors never resolve, no matter how the screen changes.
    /// Everything else is worth retrying once a significant screen change
    /// is observed.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            MatchErrorCode::InsufficientOpacity | MatchErrorCode::NonFiniteConfidence
        )
    }
}

/// Per-image, per-iteration template-match result. Ephemeral: recomputed
/// every iteration and never persisted beyond the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub found: bool,
    /// Center point in resized-screenshot coordinates.
    pub center_x: Option<i32>,
    pub center_y: Option<i32>,
    pub confidence: Option<f32>,
    pub template_width: u32,
    pub template_height: u32,
    pub error: Option<String>,
    pub error_code: Option<MatchErrorCode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HintImageMatchResult {
    /// Index into the request's `template_images` array.
    pub index: usize,
    pub file_name: String,
    pub match_result: MatchResult,
}

/// An input primitive understood by the automation backend. Coordinates are
/// physical screen coordinates; the engine scales model output before
/// constructing one of these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputCommand {
    MouseMove { x: i32, y: i32 },
    LeftClick { x: i32, y: i32 },
    RightClick { x: i32, y: i32 },
    MiddleClick { x: i32, y: i32 },
    DoubleClick { x: i32, y: i32 },
    TripleClick { x: i32, y: i32 },
    LeftClickDrag { start_x: i32, start_y: i32, end_x: i32, end_y: i32 },
    Scroll { x: i32, y: i32, direction: String, amount: i32 },
    TypeText { text: String },
    Key { keys: String },
    HoldKey { key: String, hold: bool },
}

impl InputCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            InputCommand::MouseMove { .. } => "mouse_move",
            InputCommand::LeftClick { .. } => "left_click",
            InputCommand::RightClick { .. } => "right_click",
            InputCommand::MiddleClick { .. } => "middle_click",
            InputCommand::DoubleClick { .. } => "double_click",
            InputCommand::TripleClick { .. } => "triple_click",
            InputCommand::LeftClickDrag { .. } => "left_click_drag",
            InputCommand::Scroll { .. } => "scroll",
            InputCommand::TypeText { .. } => "type_text",
            InputCommand::Key { .. } => "key",
            InputCommand::HoldKey { .. } => "hold_key",
        }
    }

    /// The primary coordinate this command interacts with, if any.
    pub fn coordinate(&self) -> Option<(i32, i32)> {
        match *self {
            InputCommand::MouseMove { x, y }
            | InputCommand::LeftClick { x, y }
            | InputCommand::RightClick { x, y }
            | InputCommand::MiddleClick { x, y }
            | InputCommand::DoubleClick { x, y }
            | InputCommand::TripleClick { x, y }
            | InputCommand::Scroll { x, y, .. } => Some((x, y)),
            InputCommand::LeftClickDrag { start_x, start_y, .. } => Some((start_x, start_y)),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            InputCommand::TypeText { text } => format!("type_text: {text}"),
            InputCommand::Key { keys } => format!("key: {keys}"),
            InputCommand::HoldKey { key, hold } => format!("hold_key: {key} (hold={hold})"),
            InputCommand::Scroll { x, y, direction, amount } => {
                format!("scroll {direction} x{amount} at ({x},{y})")
            }
            InputCommand::LeftClickDrag { start_x, start_y, end_x, end_y } => {
                format!("left_click_drag ({start_x},{start_y}) -> ({end_x},{end_y})")
            }
            other => match other.coordinate() {
                Some((x, y)) => format!("{} at ({x},{y})", other.kind()),
                None => other.kind().to_string(),
            },
        }
    }
}

/// Request/response contract with the automation backend. Implementations
/// are injected through the engine constructor, which keeps the loop fully
/// testable with in-memory fakes.
#[async_trait]
pub trait AutomationBackend: Send + Sync {
    async fn capture_screen(&self) -> PilotResult<CaptureResult>;

    /// Match a batch of hint images against a screenshot. Per-image failures
    /// are reported inside the results; an `Err` means the call itself
    /// failed and no result applies.
    async fn match_hint_images(&self, request: MatchRequest) -> PilotResult<Vec<HintImageMatchResult>>;

    /// Polled "stop requested" flag (e.g. a global hotkey on the backend
    /// side). Checked at the top of every iteration.
    async fn is_stop_requested(&self) -> PilotResult<bool>;

    /// Dispatch one input primitive. Fire-and-forget; fails by returning an
    /// error.
    async fn dispatch(&self, command: InputCommand) -> PilotResult<()>;
}
