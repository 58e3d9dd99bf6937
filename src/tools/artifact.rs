//! write_artifact：把任务产出写入工作目录（有外部副作用，执行前需审批）
//!
//! 路径必须是工作目录下的相对路径，禁止绝对路径与 `..` 逃逸。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::tools::{Citation, Tool, ToolOutput};

const MAX_ARTIFACT_BYTES: usize = 1024 * 1024;

pub struct WriteArtifactTool {
    root_dir: PathBuf,
}

impl WriteArtifactTool {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        Self {
            root_dir: root_dir.as_ref().to_path_buf(),
        }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let relative = Path::new(path.trim_start_matches("./"));
        if path.trim().is_empty() {
            return Err("path is required".to_string());
        }
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(format!("Access denied: path '{path}' is outside the workspace"));
        }
        Ok(self.root_dir.join(relative))
    }
}

#[async_trait]
impl Tool for WriteArtifactTool {
    fn name(&self) -> &str {
        "write_artifact"
    }

    fn description(&self) -> &str {
        "Write a text artifact into the mission workspace. Args: {\"path\": \"relative path\", \"content\": \"text\"}"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    fn side_effecting(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        let path = args.get("path").and_then(|v| v.as_str()).unwrap_or("");
        let content = match args.get("content") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => return Err("content is required".to_string()),
        };
        if content.len() > MAX_ARTIFACT_BYTES {
            return Err(format!("artifact larger than {MAX_ARTIFACT_BYTES} bytes"));
        }
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Failed to create parent directory: {e}"))?;
        }
        tokio::fs::write(&target, content.as_bytes())
            .await
            .map_err(|e| format!("Write failed: {e}"))?;
        tracing::info!(path = %target.display(), bytes = content.len(), "artifact written");

        Ok(ToolOutput::new(json!({ "path": path, "bytes": content.len() })).with_citation(
            Citation {
                source_id: format!("artifact:{path}"),
                confidence: 1.0,
                snippet: content.chars().take(80).collect(),
            },
        ))
    }
}
