use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ModelClient, ModelRequest, ModelResponse, ToolExecutor, ToolKind};
use crate::config::{ModelSettings, USER_AGENT};
use crate::error::PipelineError;
use crate::runtime::runner::bounded_call;

/// Client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiClient {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl OpenAiClient {
    pub fn new(settings: &ModelSettings) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .context("failed to build model http client")?;
        Ok(Self {
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.clone(),
            api_key: settings.api_key.clone(),
            client,
        })
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Value],
    temperature: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Deserialize, Serialize, Clone)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    kind: String,
    function: ChatFunctionCall,
}

#[derive(Deserialize, Serialize, Clone)]
struct ChatFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn function_type() -> String {
    "function".to_string()
}

impl OpenAiClient {
    async fn post(&self, body: &ChatRequest<'_>) -> Result<ChatMessage, PipelineError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                PipelineError::network(format!("model endpoint unreachable: {err}"))
            } else {
                PipelineError::network(format!("model request failed: {err}"))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            let detail = crate::util::truncate_chars(&detail, 300);
            if status.is_server_error() || status.as_u16() == 429 {
                return Err(PipelineError::network(format!(
                    "model endpoint returned {status}: {detail}"
                )));
            }
            return Err(PipelineError::Pipeline(format!(
                "model endpoint returned {status}: {detail}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| PipelineError::Schema(format!("model response parse failed: {err}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| PipelineError::Schema("model response had no choices".to_string()))
    }

    async fn run_conversation(
        &self,
        request: &ModelRequest,
        tools: Option<&dyn ToolExecutor>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, PipelineError> {
        let mut messages = vec![
            json!({"role": "system", "content": request.system}),
            json!({"role": "user", "content": request.prompt}),
        ];
        let tool_defs = match tools {
            Some(_) => request.tools.iter().map(|tool| tool.definition()).collect(),
            None => Vec::new(),
        };
        let response_format = request.json_schema.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": {"name": request.purpose.replace('-', "_"), "schema": schema}
            })
        });

        let mut tool_calls = 0_usize;
        let mut iterations = 0_usize;
        loop {
            let tools_exhausted = iterations >= request.max_tool_iterations;
            let body = ChatRequest {
                model: &self.model,
                messages: &messages,
                temperature: request.temperature,
                tools: tool_defs.clone(),
                tool_choice: (!tool_defs.is_empty() && tools_exhausted).then_some("none"),
                response_format: response_format.clone(),
            };
            let message = self.post(&body).await?;

            let executor = match tools {
                Some(executor) if !message.tool_calls.is_empty() && !tools_exhausted => executor,
                _ => {
                    let text = message.content.unwrap_or_default();
                    let structured = request
                        .json_schema
                        .as_ref()
                        .and_then(|_| serde_json::from_str::<Value>(text.trim()).ok());
                    return Ok(ModelResponse {
                        text,
                        structured,
                        tool_calls,
                    });
                }
            };

            iterations += 1;
            messages.push(json!({
                "role": "assistant",
                "content": message.content,
                "tool_calls": message.tool_calls,
            }));
            for call in &message.tool_calls {
                tool_calls += 1;
                let arguments = serde_json::from_str::<Value>(&call.function.arguments)
                    .unwrap_or_else(|_| Value::String(call.function.arguments.clone()));
                let output = match ToolKind::from_name(&call.function.name) {
                    Some(tool) => match executor.call(tool, &arguments, cancel).await {
                        Ok(output) => output,
                        Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
                        Err(err) => {
                            warn!(tool = %call.function.name, error = %err, "tool call failed");
                            json!({"error": err.to_string()}).to_string()
                        }
                    },
                    None => json!({"error": format!("unknown tool {}", call.function.name)})
                        .to_string(),
                };
                debug!(tool = %call.function.name, bytes = output.len(), "tool call completed");
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": call.id,
                    "content": output,
                }));
            }
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn generate(
        &self,
        request: &ModelRequest,
        tools: Option<&dyn ToolExecutor>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, PipelineError> {
        bounded_call(
            cancel,
            request.timeout,
            request.purpose,
            self.run_conversation(request, tools, cancel),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_omits_empty_tools_and_format() {
        let messages = vec![json!({"role": "user", "content": "hi"})];
        let body = ChatRequest {
            model: "m",
            messages: &messages,
            temperature: 0.0,
            tools: Vec::new(),
            tool_choice: None,
            response_format: None,
        };
        let value = serde_json::to_value(&body).unwrap();
        assert!(value.get("tools").is_none());
        assert!(value.get("response_format").is_none());
        assert_eq!(value["model"], "m");
    }

    #[test]
    fn tool_call_messages_parse_with_default_type() {
        let raw = r#"{"choices":[{"message":{"content":null,"tool_calls":[
            {"id":"c1","function":{"name":"web_search","arguments":"{\"query\":\"gomi\"}"}}
        ]}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let call = &parsed.choices[0].message.tool_calls[0];
        assert_eq!(call.kind, "function");
        assert_eq!(ToolKind::from_name(&call.function.name), Some(ToolKind::WebSearch));
    }

    #[test]
    fn tool_definitions_name_their_argument() {
        let def = ToolKind::FetchPage.definition();
        assert_eq!(def["function"]["name"], "fetch_page");
        assert_eq!(def["function"]["parameters"]["required"][0], "url");
    }
}
