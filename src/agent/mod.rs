pub mod engine;
pub mod expected;
pub mod hints;
pub mod history;
pub mod judge;
pub mod loop_control;
pub mod scaler;
