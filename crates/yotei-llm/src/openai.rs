use reqwest::Client;
use serde_json::json;
use yotei_core::error::{AgentError, Result};
use yotei_core::types::{ChatRequest, ChatResponse, ToolDefinition, ToolInvocation, Usage};

use crate::provider::{decision_from_args, LlmProvider, REVIEW_DECISION_TOOL_NAME};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// OpenAI-compatible chat completion provider. With a custom base URL this
/// also fronts Gemini, Groq and local gateways that speak the same wire
/// format.
pub struct OpenAiLlm {
    client: Client,
    api_key: String,
    model: String,
    chat_url: String,
}

impl OpenAiLlm {
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, "")
    }

    /// `base_url` is the API root (e.g. "https://api.groq.com/openai/v1");
    /// empty selects the OpenAI default.
    pub fn with_base_url(api_key: String, model: String, base_url: &str) -> Self {
        let chat_url = if base_url.is_empty() {
            OPENAI_CHAT_URL.to_string()
        } else {
            format!("{}/chat/completions", base_url.trim_end_matches('/'))
        };
        Self {
            client: Client::new(),
            api_key,
            model,
            chat_url,
        }
    }

    fn build_body(&self, request: &ChatRequest) -> serde_json::Value {
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| {
                json!({
                    "role": m.role,
                    "content": m.content,
                })
            })
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });

        if let Some(max_tokens) = request.max_tokens {
            body.as_object_mut()
                .unwrap()
                .insert("max_tokens".to_string(), json!(max_tokens));
        }
        if let Some(temp) = request.temperature {
            body.as_object_mut()
                .unwrap()
                .insert("temperature".to_string(), json!(temp));
        }

        body
    }

    async fn send(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| AgentError::Llm {
                provider: "openai".to_string(),
                message: format!("request failed: {e}"),
            })?;

        let status = response.status().as_u16();
        let response_text = response.text().await.map_err(|e| AgentError::Llm {
            provider: "openai".to_string(),
            message: format!("failed to read response body: {e}"),
        })?;

        if !(200..300).contains(&status) {
            return Err(AgentError::Http {
                status,
                body: response_text,
            });
        }

        serde_json::from_str(&response_text).map_err(|e| AgentError::Llm {
            provider: "openai".to_string(),
            message: format!("failed to parse response JSON: {e}"),
        })
    }

    fn parse_response(parsed: &serde_json::Value) -> ChatResponse {
        let message = &parsed["choices"][0]["message"];
        let content = content_to_text(&message["content"]);

        let mut tool_calls = Vec::new();
        let mut decision = None;
        if let Some(calls) = message["tool_calls"].as_array() {
            for call in calls {
                let name = call["function"]["name"].as_str().unwrap_or("").to_string();
                if name.is_empty() {
                    continue;
                }
                let arguments = decode_arguments(&call["function"]["arguments"]);
                if name == REVIEW_DECISION_TOOL_NAME {
                    decision = Some(decision_from_args(&arguments));
                    continue;
                }
                tool_calls.push(ToolInvocation { name, arguments });
            }
        }

        let usage = match (
            parsed["usage"]["prompt_tokens"].as_u64(),
            parsed["usage"]["completion_tokens"].as_u64(),
        ) {
            (Some(input), Some(output)) => Some(Usage {
                input_tokens: input as u32,
                output_tokens: output as u32,
            }),
            _ => None,
        };

        ChatResponse {
            content,
            tool_calls,
            decision,
            usage,
        }
    }
}

/// Normalize chat completion content into a plain string. Some gateways
/// return an array of typed parts instead of one string.
fn content_to_text(content: &serde_json::Value) -> String {
    if let Some(text) = content.as_str() {
        return text.to_string();
    }
    if let Some(parts) = content.as_array() {
        let joined: Vec<&str> = parts
            .iter()
            .filter_map(|part| {
                part.as_str()
                    .or_else(|| part["text"].as_str())
                    .or_else(|| part["content"].as_str())
            })
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        return joined.join("\n");
    }
    String::new()
}

/// Tool-call `arguments` arrive as a JSON-encoded string on this wire
/// format; tolerate an already-decoded object too.
fn decode_arguments(raw: &serde_json::Value) -> serde_json::Value {
    if raw.is_object() {
        return raw.clone();
    }
    raw.as_str()
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        .filter(|v| v.is_object())
        .unwrap_or_else(|| json!({}))
}

impl LlmProvider for OpenAiLlm {
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        let body = self.build_body(&request);
        let parsed = self.send(&body).await?;
        Ok(Self::parse_response(&parsed))
    }

    async fn chat_with_tools(
        &self,
        request: ChatRequest,
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Result<ChatResponse> {
        let mut body = self.build_body(&request);

        let openai_tools: Vec<serde_json::Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();

        let obj = body.as_object_mut().unwrap();
        obj.insert("tools".to_string(), json!(openai_tools));
        obj.insert("tool_choice".to_string(), json!(tool_choice));

        let parsed = self.send(&body).await?;
        Ok(Self::parse_response(&parsed))
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_arguments() {
        let parsed = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "function": {
                            "name": "create_custom_task",
                            "arguments": "{\"name\":\"買い物\",\"time\":\"10:00\"}"
                        }
                    }]
                }
            }]
        });
        let response = OpenAiLlm::parse_response(&parsed);
        assert_eq!(response.content, "");
        assert_eq!(response.tool_calls.len(), 1);
        assert_eq!(response.tool_calls[0].arguments["time"], "10:00");
    }

    #[test]
    fn test_content_parts_are_joined() {
        let content = json!([
            { "type": "text", "text": "一行目" },
            { "type": "text", "text": " 二行目 " },
        ]);
        assert_eq!(content_to_text(&content), "一行目\n二行目");
    }

    #[test]
    fn test_malformed_arguments_become_empty_object() {
        let decoded = decode_arguments(&json!("not json"));
        assert!(decoded.as_object().unwrap().is_empty());
    }

    #[test]
    fn test_custom_base_url_join() {
        let provider =
            OpenAiLlm::with_base_url("k".into(), "m".into(), "https://api.groq.com/openai/v1/");
        assert_eq!(
            provider.chat_url,
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }
}
