pub mod json;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use crate::error::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    WebSearch,
    FetchPage,
}

impl ToolKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::WebSearch => "web_search",
            Self::FetchPage => "fetch_page",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "web_search" => Some(Self::WebSearch),
            "fetch_page" => Some(Self::FetchPage),
            _ => None,
        }
    }

    pub fn definition(self) -> Value {
        let (description, property, property_description) = match self {
            Self::WebSearch => (
                "Search the web and return ranked result URLs with titles and snippets.",
                "query",
                "Search query. Japanese municipal terms work best.",
            ),
            Self::FetchPage => (
                "Fetch a URL and return its content type plus a text preview.",
                "url",
                "Absolute http(s) URL to fetch.",
            ),
        };
        let mut properties = serde_json::Map::new();
        properties.insert(
            property.to_string(),
            json!({"type": "string", "description": property_description}),
        );
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": description,
                "parameters": {
                    "type": "object",
                    "properties": properties,
                    "required": [property]
                }
            }
        })
    }
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub purpose: &'static str,
    pub system: String,
    pub prompt: String,
    pub tools: Vec<ToolKind>,
    pub json_schema: Option<Value>,
    pub temperature: f64,
    pub timeout: Duration,
    pub max_tool_iterations: usize,
}

impl ModelRequest {
    pub fn new(purpose: &'static str, system: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            purpose,
            system: system.into(),
            prompt: prompt.into(),
            tools: Vec::new(),
            json_schema: None,
            temperature: 0.0,
            timeout: Duration::from_secs(60),
            max_tool_iterations: 0,
        }
    }

    pub fn with_tools(mut self, tools: &[ToolKind], max_iterations: usize) -> Self {
        self.tools = tools.to_vec();
        self.max_tool_iterations = max_iterations;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.json_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub text: String,
    pub structured: Option<Value>,
    pub tool_calls: usize,
}

/// Executes tool calls the model asks for. The discover step owns the implementation so
/// every query and fetch goes through its policy and budgets.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn call(
        &self,
        tool: ToolKind,
        arguments: &Value,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError>;
}

/// Opaque text/structured-generation backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn generate(
        &self,
        request: &ModelRequest,
        tools: Option<&dyn ToolExecutor>,
        cancel: &CancellationToken,
    ) -> Result<ModelResponse, PipelineError>;
}

#[cfg(test)]
pub mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    pub enum Reply {
        Text(String),
        Structured(Value),
        /// Asks the executor for one tool call, then answers with the text.
        ToolThenText(ToolKind, Value, String),
        Fail(PipelineError),
        Hang,
    }

    /// Replays canned replies in order; records every prompt it receives.
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<Reply>>,
        pub prompts: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<Reply>) -> Self {
            Self {
                replies: Mutex::new(replies.into_iter().collect()),
                prompts: Mutex::new(Vec::new()),
            }
        }

        pub fn calls(&self) -> usize {
            self.prompts.lock().map(|list| list.len()).unwrap_or(0)
        }

        pub fn prompts_for(&self, purpose: &str) -> Vec<String> {
            self.prompts
                .lock()
                .map(|list| {
                    list.iter()
                        .filter(|(kind, _)| kind == purpose)
                        .map(|(_, prompt)| prompt.clone())
                        .collect()
                })
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModelClient for ScriptedModel {
        async fn generate(
            &self,
            request: &ModelRequest,
            tools: Option<&dyn ToolExecutor>,
            cancel: &CancellationToken,
        ) -> Result<ModelResponse, PipelineError> {
            if let Ok(mut list) = self.prompts.lock() {
                list.push((request.purpose.to_string(), request.prompt.clone()));
            }
            let next = self
                .replies
                .lock()
                .ok()
                .and_then(|mut queue| queue.pop_front());
            match next {
                Some(Reply::Text(text)) => Ok(ModelResponse {
                    text,
                    ..ModelResponse::default()
                }),
                Some(Reply::Structured(value)) => Ok(ModelResponse {
                    text: value.to_string(),
                    structured: Some(value),
                    tool_calls: 0,
                }),
                Some(Reply::ToolThenText(tool, arguments, text)) => {
                    let mut tool_calls = 0;
                    if let Some(executor) = tools {
                        executor.call(tool, &arguments, cancel).await?;
                        tool_calls = 1;
                    }
                    Ok(ModelResponse {
                        text,
                        structured: None,
                        tool_calls,
                    })
                }
                Some(Reply::Fail(err)) => Err(err),
                Some(Reply::Hang) => {
                    cancel.cancelled().await;
                    Err(PipelineError::Cancelled)
                }
                None => Err(PipelineError::network("scripted model has no replies left")),
            }
        }
    }
}
