use async_trait::async_trait;

use crate::config::ModelConfig;
use crate::errors::{PilotError, PilotResult};
use crate::llm::provider::ReasoningModel;
use crate::llm::types::{ChatMessage, ModelReply, ToolDef, ToolUse};

/// Non-streaming client for Anthropic-style `/v1/messages` endpoints.
pub struct AnthropicCompatibleProvider {
    api_base: String,
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u32,
    client: reqwest::Client,
}

impl AnthropicCompatibleProvider {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            api_key: config.resolve_api_key(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ReasoningModel for AnthropicCompatibleProvider {
    async fn complete(
        &self,
        system: &str,
        messages: &[ChatMessage],
        tools: &[ToolDef],
    ) -> PilotResult<ModelReply> {
        let mut body = serde_json::json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "system": system,
            "messages": messages,
        });

        if !tools.is_empty() {
            body["tools"] = serde_json::to_value(tools)?;
        }

        tracing::debug!(
            model = %self.model,
            messages = messages.len(),
            tools = tools.len(),
            "sending model request"
        );
        tracing::trace!(
            body = %sanitized_body_for_log(&body),
            "request body (sanitized, base64 omitted)"
        );

        let response = self
            .client
            .post(format!("{}/v1/messages", self.api_base))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(PilotError::Model(format!("{status}: {err_body}")));
        }

        let json: serde_json::Value = response.json().await?;
        Ok(parse_reply(&json))
    }
}

/// Extracts accumulated text and the first tool_use block from a messages
/// API response.
fn parse_reply(json: &serde_json::Value) -> ModelReply {
    let mut text = String::new();
    let mut tool_use = None;

    if let Some(blocks) = json["content"].as_array() {
        for block in blocks {
            match block["type"].as_str() {
                Some("text") => {
                    text.push_str(block["text"].as_str().unwrap_or(""));
                }
                Some("tool_use") if tool_use.is_none() => {
                    tool_use = Some(ToolUse {
                        id: block["id"].as_str().unwrap_or("").to_string(),
                        name: block["name"].as_str().unwrap_or("").to_string(),
                        input: block["input"].clone(),
                    });
                }
                _ => {}
            }
        }
    }

    tracing::info!(
        text_len = text.len(),
        tool = tool_use.as_ref().map(|t| t.name.as_str()).unwrap_or("none"),
        "model reply received"
    );

    ModelReply { text, tool_use }
}

/// Clone the body and blank out base64 image payloads so the real request
/// still carries them but logs stay readable.
fn sanitized_body_for_log(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            if let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) {
                for part in parts {
                    if part.get("type").and_then(|t| t.as_str()) == Some("image") {
                        if let Some(data) = part.pointer_mut("/source/data") {
                            *data = serde_json::Value::String("<omitted_base64_image>".into());
                        }
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reply_collects_text_and_first_tool_use() {
        let json = serde_json::json!({
            "content": [
                { "type": "text", "text": "clicking the button" },
                { "type": "tool_use", "id": "tu_1", "name": "left_click", "input": { "x": 10, "y": 20 } },
                { "type": "tool_use", "id": "tu_2", "name": "scroll", "input": {} }
            ]
        });
        let reply = parse_reply(&json);
        assert_eq!(reply.text, "clicking the button");
        let tool = reply.tool_use.unwrap();
        assert_eq!(tool.name, "left_click");
        assert_eq!(tool.id, "tu_1");
    }

    #[test]
    fn sanitizer_strips_image_payloads_only() {
        let body = serde_json::json!({
            "messages": [{
                "role": "user",
                "content": [
                    { "type": "text", "text": "hello" },
                    { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "AAAA" } }
                ]
            }]
        });
        let logged = sanitized_body_for_log(&body);
        assert!(logged.contains("<omitted_base64_image>"));
        assert!(!logged.contains("AAAA"));
        assert!(logged.contains("hello"));
    }
}
