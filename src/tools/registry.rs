//! 工具注册表
//!
//! 所有工具实现 Tool trait（name / description / 参数 schema / 副作用标记 / 费用估计 / execute）。
//! ToolRegistry 是执行器面对的外部接口（list_tools / invoke），LocalToolRegistry 是进程内实现，按名注册与查找。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{MissionError, Result};

/// 证据引用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub source_id: String,
    pub confidence: f64,
    #[serde(default)]
    pub snippet: String,
}

/// 工具执行的原始产出
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub value: Value,
    pub citations: Vec<Citation>,
}

impl ToolOutput {
    pub fn new(value: Value) -> Self {
        Self {
            value,
            citations: Vec::new(),
        }
    }

    pub fn with_citation(mut self, citation: Citation) -> Self {
        self.citations.push(citation);
        self
    }
}

/// 注册表对外暴露的工具描述
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub id: String,
    pub description: String,
    pub parameters: Value,
    /// 有外部副作用的工具执行前需要 tool_execution_approval
    pub side_effecting: bool,
    /// 调用前用于预算预授权
    pub cost_estimate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_id: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_id: String,
    pub output: Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub latency_ms: u64,
    pub cost: f64,
    #[serde(default)]
    pub citations: Vec<Citation>,
}

impl ToolResult {
    pub fn failed(tool_id: impl Into<String>, error: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            tool_id: tool_id.into(),
            output: Value::Null,
            success: false,
            error: Some(error.into()),
            latency_ms,
            cost: 0.0,
            citations: Vec::new(),
        }
    }
}

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（计划 JSON 中的 "tool" 字段）
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    fn side_effecting(&self) -> bool {
        false
    }

    fn cost_estimate(&self) -> f64 {
        0.0
    }

    async fn execute(&self, args: Value) -> std::result::Result<ToolOutput, String>;
}

/// 执行器依赖的外部工具注册表接口
#[async_trait]
pub trait ToolRegistry: Send + Sync {
    fn list_tools(&self) -> Vec<ToolDescriptor>;

    /// 未知工具返回 ToolNotFound，工具自身失败返回 ToolExecutionFailed
    async fn invoke(&self, tool_id: &str, params: Value) -> Result<ToolResult>;

    fn descriptor(&self, tool_id: &str) -> Option<ToolDescriptor> {
        self.list_tools().into_iter().find(|d| d.id == tool_id)
    }
}

/// 进程内注册表：按名称存储 Arc<dyn Tool>
#[derive(Default, Clone)]
pub struct LocalToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl LocalToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn with_tool(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }
}

fn describe(tool: &dyn Tool) -> ToolDescriptor {
    ToolDescriptor {
        id: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
        side_effecting: tool.side_effecting(),
        cost_estimate: tool.cost_estimate(),
    }
}

#[async_trait]
impl ToolRegistry for LocalToolRegistry {
    fn list_tools(&self) -> Vec<ToolDescriptor> {
        self.tools.values().map(|t| describe(t.as_ref())).collect()
    }

    fn descriptor(&self, tool_id: &str) -> Option<ToolDescriptor> {
        self.tools.get(tool_id).map(|t| describe(t.as_ref()))
    }

    async fn invoke(&self, tool_id: &str, params: Value) -> Result<ToolResult> {
        let tool = self
            .tools
            .get(tool_id)
            .ok_or_else(|| MissionError::ToolNotFound(tool_id.to_string()))?;
        let start = Instant::now();
        let output = tool
            .execute(params)
            .await
            .map_err(MissionError::ToolExecutionFailed)?;
        Ok(ToolResult {
            tool_id: tool_id.to_string(),
            output: output.value,
            success: true,
            error: None,
            latency_ms: start.elapsed().as_millis() as u64,
            cost: tool.cost_estimate(),
            citations: output.citations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::EchoTool;
    use serde_json::json;

    #[tokio::test]
    async fn test_invoke_and_unknown_tool() {
        let registry = LocalToolRegistry::new().with_tool(EchoTool);
        let result = registry.invoke("echo", json!({"text": "hi"})).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output["text"], "hi");

        let err = registry.invoke("nope", json!({})).await.unwrap_err();
        assert!(matches!(err, MissionError::ToolNotFound(_)));
    }

    #[test]
    fn test_list_tools_sorted_with_descriptors() {
        let registry = LocalToolRegistry::new().with_tool(EchoTool);
        let tools = registry.list_tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].id, "echo");
        assert!(!tools[0].side_effecting);
        assert!(registry.descriptor("echo").is_some());
    }
}
