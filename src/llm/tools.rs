use crate::errors::{PilotError, PilotResult};
use crate::llm::types::ToolDef;

/// Loads the automation-primitive tool definitions from
/// prompts/tools/builtin.json. The JSON is embedded at compile time via
/// include_str!.
pub fn load_builtin_tools() -> PilotResult<Vec<ToolDef>> {
    let json = include_str!("../../prompts/tools/builtin.json");
    serde_json::from_str(json)
        .map_err(|e| PilotError::Config(format!("Failed to parse builtin tools: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_tools_cover_all_input_primitives() {
        let tools = load_builtin_tools().unwrap();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        for expected in [
            "mouse_move",
            "left_click",
            "right_click",
            "middle_click",
            "double_click",
            "triple_click",
            "left_click_drag",
            "scroll",
            "type_text",
            "key",
            "hold_key",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
    }
}
