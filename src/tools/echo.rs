//! Echo 工具：原样返回参数（本地运行与测试用）

use async_trait::async_trait;
use serde_json::Value;

use crate::tools::{Tool, ToolOutput};

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Echo the given arguments back. Args: {\"text\": \"message\"}"
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let args = match args {
            Value::Object(_) => args,
            Value::Null => serde_json::json!({ "text": "(empty)" }),
            other => serde_json::json!({ "text": other }),
        };
        Ok(ToolOutput::new(args))
    }
}
