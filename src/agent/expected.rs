//! Expected-action checklist: derivation, validation, confirmation.

use regex::Regex;

use crate::backend::InputCommand;
use crate::errors::PilotResult;
use crate::llm::provider::ReasoningModel;
use crate::llm::types::ChatMessage;
use crate::types::{ExpectedAction, Scenario};

const DERIVE_PROMPT: &str = "\
Break the following UI test scenario into the concrete actions a tester \
would perform, in order. Reply with ONLY a JSON array, one object per step: \
{\"description\": string, \"keywords\": [string], \"actionType\": one of \
mouse_move/left_click/right_click/middle_click/double_click/triple_click/\
left_click_drag/scroll/type_text/key/hold_key or null, \
\"targetElements\": [string] or null, \"verification\": string or null}.

Scenario:
";

/// Ordered checklist with a cursor at the first incomplete item. Completed
/// flags are monotonic: items are never un-completed.
#[derive(Debug, Default)]
pub struct Checklist {
    items: Vec<ExpectedAction>,
    cursor: usize,
}

impl Checklist {
    pub fn new(items: Vec<ExpectedAction>) -> Self {
        Self { items, cursor: 0 }
    }

    pub fn items(&self) -> &[ExpectedAction] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current(&self) -> Option<&ExpectedAction> {
        self.items.get(self.cursor)
    }

    pub fn mark_current_complete(&mut self) {
        if let Some(item) = self.items.get_mut(self.cursor) {
            item.completed = true;
        }
        while self.cursor < self.items.len() && self.items[self.cursor].completed {
            self.cursor += 1;
        }
    }

    pub fn completed_count(&self) -> u32 {
        self.items.iter().filter(|i| i.completed).count() as u32
    }

    /// True only for a non-empty checklist whose every item completed.
    pub fn all_complete(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.completed)
    }
}

/// Derives the checklist from the scenario description via the reasoning
/// model, falling back to the keyword heuristic when the call or the parse
/// fails. Derivation happens once, at scenario start.
pub async fn derive_checklist(model: &dyn ReasoningModel, scenario: &Scenario) -> Checklist {
    let prompt = format!("{DERIVE_PROMPT}{}\n{}", scenario.title, scenario.description);
    let messages = [ChatMessage::user_text(prompt)];

    match model.complete("", &messages, &[]).await {
        Ok(reply) => match parse_checklist_json(&reply.text) {
            Some(items) if !items.is_empty() => {
                tracing::info!(steps = items.len(), "checklist derived from model");
                Checklist::new(items)
            }
            _ => {
                tracing::warn!("model checklist unparseable, using heuristic");
                Checklist::new(heuristic_checklist(&scenario.description))
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "checklist derivation call failed, using heuristic");
            Checklist::new(heuristic_checklist(&scenario.description))
        }
    }
}

fn parse_checklist_json(text: &str) -> Option<Vec<ExpectedAction>> {
    let trimmed = text.trim();
    if let Ok(items) = serde_json::from_str::<Vec<ExpectedAction>>(trimmed) {
        return Some(items);
    }
    let start = trimmed.find('[')?;
    let end = trimmed.rfind(']')?;
    if end > start {
        serde_json::from_str::<Vec<ExpectedAction>>(&trimmed[start..=end]).ok()
    } else {
        None
    }
}

const STOPWORDS: &[&str] = &[
    "the", "and", "then", "that", "this", "with", "from", "into", "should", "after", "before",
    "when", "where", "which", "will", "been", "have", "has", "are", "is", "was", "for", "you",
];

/// Line/sentence-based fallback when no model-derived checklist is
/// available. Each step keeps its alphanumeric keywords and a guessed
/// action type from common verbs.
pub fn heuristic_checklist(description: &str) -> Vec<ExpectedAction> {
    let step_prefix = Regex::new(r"^\s*(?:\d+[.)]\s*|[-*]\s*)").expect("static regex");
    let word = Regex::new(r"[A-Za-z0-9]{3,}").expect("static regex");

    let mut steps: Vec<&str> = description
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect();
    if steps.is_empty() {
        steps.push(description.trim());
    }

    steps
        .into_iter()
        .filter(|s| !s.is_empty())
        .map(|raw| {
            let text = step_prefix.replace(raw, "").to_string();
            let lower = text.to_lowercase();
            let keywords: Vec<String> = word
                .find_iter(&lower)
                .map(|m| m.as_str().to_string())
                .filter(|w| !STOPWORDS.contains(&w.as_str()))
                .collect();

            ExpectedAction {
                description: text,
                keywords,
                target_elements: None,
                action_type: guess_action_type(&lower),
                verification: None,
                completed: false,
            }
        })
        .collect()
}

fn guess_action_type(step: &str) -> Option<String> {
    if step.contains("double-click") || step.contains("double click") {
        Some("double_click".into())
    } else if step.contains("right-click") || step.contains("right click") {
        Some("right_click".into())
    } else if step.contains("drag") {
        Some("left_click_drag".into())
    } else if step.contains("scroll") {
        Some("scroll".into())
    } else if step.contains("type") || step.contains("enter ") || step.contains("input ") {
        Some("type_text".into())
    } else if step.contains("press") || step.contains("shortcut") {
        Some("key".into())
    } else if step.contains("click") || step.contains("select") || step.contains("open") {
        Some("left_click".into())
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The dispatched action clearly advances the current expected step.
    Matched,
    /// Partial evidence; ask the model before advancing the checklist.
    Ambiguous,
    /// The action does not relate to the current step.
    Unrelated,
}

/// Cross-checks a dispatched action against the current expected step using
/// its declared type and the keywords in the model's narration. A clean
/// double match advances; a half match is ambiguous and needs confirmation
/// rather than speculative advancement.
pub fn validate_action(
    expected: &ExpectedAction,
    command: &InputCommand,
    narration: &str,
) -> ValidationOutcome {
    let type_match = expected
        .action_type
        .as_deref()
        .map(|t| t == command.kind());

    let haystack = {
        let mut h = narration.to_lowercase();
        if let InputCommand::TypeText { text } = command {
            h.push(' ');
            h.push_str(&text.to_lowercase());
        }
        h
    };
    let keyword_match = !expected.keywords.is_empty()
        && expected.keywords.iter().any(|k| haystack.contains(&k.to_lowercase()));
    let target_match = expected
        .target_elements
        .as_ref()
        .map(|targets| targets.iter().any(|t| haystack.contains(&t.to_lowercase())))
        .unwrap_or(false);

    match (type_match, keyword_match || target_match) {
        (Some(true), true) => ValidationOutcome::Matched,
        (None, true) => ValidationOutcome::Matched,
        (Some(true), false) => ValidationOutcome::Ambiguous,
        (Some(false), true) => ValidationOutcome::Ambiguous,
        _ => ValidationOutcome::Unrelated,
    }
}

/// Asks the model whether the executed action completed the expected step.
/// Used for ambiguous validation outcomes instead of advancing the
/// checklist speculatively.
pub async fn confirm_with_model(
    model: &dyn ReasoningModel,
    expected: &ExpectedAction,
    command: &InputCommand,
    narration: &str,
) -> PilotResult<bool> {
    let prompt = format!(
        "An automated UI test expected this step: \"{}\".\n\
         The agent executed: {} and explained: \"{}\".\n\
         Did the executed action accomplish the expected step? Answer only \"yes\" or \"no\".",
        expected.description,
        command.describe(),
        narration,
    );
    let messages = [ChatMessage::user_text(prompt)];
    let reply = model.complete("", &messages, &[]).await?;
    let answer = reply.text.trim().to_lowercase();
    Ok(answer.starts_with("yes") || answer.contains("\"yes\""))
}
