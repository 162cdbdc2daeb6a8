//! ScreenPilot: an automated UI-testing agent core.
//!
//! Given a natural-language scenario (plus optional hint reference images),
//! the engine repeatedly captures the screen, asks a vision-capable
//! reasoning model for the next input action, dispatches it through an
//! [`backend::AutomationBackend`], and classifies the terminal outcome.
//! Screen capture, input injection and template matching stay on the
//! backend side; the model seam is [`llm::provider::ReasoningModel`]. Both
//! are injected, so the whole loop runs against in-memory fakes in tests.

pub mod agent;
pub mod backend;
pub mod config;
pub mod errors;
pub mod llm;
pub mod types;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

pub use agent::engine::AgentEngine;
pub use backend::AutomationBackend;
pub use config::{load_config, save_config, AgentConfig};
pub use errors::{PilotError, PilotResult};
pub use llm::provider::ReasoningModel;
pub use llm::providers::anthropic_compatible::AnthropicCompatibleProvider;
pub use types::{FailureReason, HintImage, LoopOutcome, Scenario, TestResult, TestStatus};

/// Installs the default tracing subscriber. Respects `RUST_LOG`; defaults to
/// `info` when unset. Call once, early.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// One-call entry point: runs a scenario to completion and returns the
/// outcome. Set `cancel` from another task to stop the run; it takes effect
/// no later than the start of the next iteration.
pub async fn run_agent_loop(
    backend: Arc<dyn AutomationBackend>,
    model: Arc<dyn ReasoningModel>,
    config: AgentConfig,
    scenario: &Scenario,
    hint_images: Vec<HintImage>,
    cancel: Arc<AtomicBool>,
) -> LoopOutcome {
    AgentEngine::new(backend, model, config)
        .run(scenario, hint_images, cancel)
        .await
}
