//! Maps model pixel coordinates back to screen coordinates.
//!
//! The model sees a resized screenshot (`scale_factor` applied by the
//! capture side) while input injection expects logical screen coordinates,
//! which on HiDPI displays additionally differ from physical pixels by
//! `display_scale_factor`.

use crate::backend::{CaptureResult, InputCommand};

#[derive(Debug, Clone, Copy)]
pub struct CoordinateScaler {
    scale_factor: f64,
    display_scale_factor: f64,
}

impl CoordinateScaler {
    pub fn new(scale_factor: f64, display_scale_factor: f64) -> Self {
        // Degenerate metadata (zero/negative factor) must not produce
        // division blow-ups; treat it as unscaled.
        let sanitize = |f: f64| if f.is_finite() && f > 0.0 { f } else { 1.0 };
        Self {
            scale_factor: sanitize(scale_factor),
            display_scale_factor: sanitize(display_scale_factor),
        }
    }

    pub fn from_capture(capture: &CaptureResult) -> Self {
        Self::new(capture.scale_factor, capture.display_scale_factor)
    }

    /// Resized-screenshot coordinate -> logical screen coordinate.
    pub fn to_screen(&self, x: i32, y: i32) -> (i32, i32) {
        let sx = (x as f64 / self.scale_factor / self.display_scale_factor).round() as i32;
        let sy = (y as f64 / self.scale_factor / self.display_scale_factor).round() as i32;
        (sx, sy)
    }

    /// Rewrites every coordinate a command carries into screen space.
    pub fn scale_command(&self, command: InputCommand) -> InputCommand {
        match command {
            InputCommand::MouseMove { x, y } => {
                let (x, y) = self.to_screen(x, y);
                InputCommand::MouseMove { x, y }
            }
            InputCommand::LeftClick { x, y } => {
                let (x, y) = self.to_screen(x, y);
                InputCommand::LeftClick { x, y }
            }
            InputCommand::RightClick { x, y } => {
                let (x, y) = self.to_screen(x, y);
                InputCommand::RightClick { x, y }
            }
            InputCommand::MiddleClick { x, y } => {
                let (x, y) = self.to_screen(x, y);
                InputCommand::MiddleClick { x, y }
            }
            InputCommand::DoubleClick { x, y } => {
                let (x, y) = self.to_screen(x, y);
                InputCommand::DoubleClick { x, y }
            }
            InputCommand::TripleClick { x, y } => {
                let (x, y) = self.to_screen(x, y);
                InputCommand::TripleClick { x, y }
            }
            InputCommand::LeftClickDrag { start_x, start_y, end_x, end_y } => {
                let (start_x, start_y) = self.to_screen(start_x, start_y);
                let (end_x, end_y) = self.to_screen(end_x, end_y);
                InputCommand::LeftClickDrag { start_x, start_y, end_x, end_y }
            }
            InputCommand::Scroll { x, y, direction, amount } => {
                let (x, y) = self.to_screen(x, y);
                InputCommand::Scroll { x, y, direction, amount }
            }
            other => other,
        }
    }
}
