//! 从 LLM 文本中提取 JSON
//!
//! 兼容 ```json 代码块、前后夹杂说明文字的回复以及纯 JSON。

use serde::de::DeserializeOwned;

use crate::core::{MissionError, Result};

/// 提取第一个 JSON 片段；找不到 `{` 时返回 None
pub fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// 提取并反序列化；失败返回 JsonParse（携带原文片段，便于纠正提示）
pub fn parse_json<T: DeserializeOwned>(output: &str) -> Result<T> {
    let json_str = extract_json(output)
        .ok_or_else(|| MissionError::JsonParse(format!("no JSON object in: {}", preview(output))))?;
    serde_json::from_str(json_str)
        .map_err(|e| MissionError::JsonParse(format!("{}: {}", e, preview(json_str))))
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}
