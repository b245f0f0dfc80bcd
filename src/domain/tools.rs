//! Reference tool handlers
//!
//! `tools/call` answers every call with one fixed text block; `tools/list`
//! advertises that single tool.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::errors::HandlerError;
use crate::mcp::dispatcher::Handler;

pub const ECHO_TOOL_NAME: &str = "echo";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text { text: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CallToolResult {
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

#[derive(Debug, Clone)]
pub struct EchoTool {
    text: String,
}

impl EchoTool {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn result(&self) -> CallToolResult {
        CallToolResult {
            content: vec![ContentBlock::Text {
                text: self.text.clone(),
            }],
        }
    }
}

#[async_trait]
impl Handler for EchoTool {
    async fn call(&self, _params: Option<Value>) -> Result<Value, HandlerError> {
        serde_json::to_value(self.result())
            .map_err(|err| HandlerError::internal(format!("tool result serialization: {err}")))
    }
}

pub fn build_tools_list() -> Vec<ToolDescriptor> {
    vec![ToolDescriptor {
        name: ECHO_TOOL_NAME,
        description: "Reply with a fixed text message",
        input_schema: json!({"type": "object"}),
    }]
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ListTools;

#[async_trait]
impl Handler for ListTools {
    async fn call(&self, _params: Option<Value>) -> Result<Value, HandlerError> {
        serde_json::to_value(build_tools_list())
            .map(|tools| json!({ "tools": tools }))
            .map_err(|err| HandlerError::internal(format!("tools list serialization: {err}")))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Ping;

#[async_trait]
impl Handler for Ping {
    async fn call(&self, _params: Option<Value>) -> Result<Value, HandlerError> {
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_tool_ignores_params() {
        let tool = EchoTool::new("Hello from simple MCP!");
        let expected = json!({"content": [{"type": "text", "text": "Hello from simple MCP!"}]});

        assert_eq!(tool.call(None).await.expect("call"), expected);
        assert_eq!(
            tool.call(Some(json!({"name": "anything", "arguments": {"x": 1}})))
                .await
                .expect("call"),
            expected
        );
    }

    #[tokio::test]
    async fn tools_list_names_the_echo_tool() {
        let listed = ListTools.call(None).await.expect("list");
        assert_eq!(listed["tools"][0]["name"], json!("echo"));
        assert_eq!(listed["tools"][0]["inputSchema"], json!({"type": "object"}));
    }
}
