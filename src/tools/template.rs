//! 工具链输入模板
//!
//! 步骤输入是 JSON，其中的字符串可引用前序步骤输出：`{{step1.output}}`、`{{step2.output.items.0.id}}`、
//! `{{prev.output.text}}`。整串即占位符时保留原类型，否则按文本插值。无法解析的引用替换为 null / 空串并报告。

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*(?:step(\d+)|(prev))\.output((?:\.[A-Za-z0-9_\-]+)*)\s*\}\}")
            .unwrap_or_else(|e| panic!("invalid placeholder regex: {e}"))
    })
}

/// 模板解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedInput {
    pub value: Value,
    /// 无法解析的占位符原文
    pub unresolved: Vec<String>,
}

/// outputs[i] 为第 i + 1 步的输出（失败或未执行为 None）；current 为当前步骤序号（从 1 开始）
pub fn resolve_input(input: &Value, outputs: &[Option<Value>], current: usize) -> ResolvedInput {
    let mut unresolved = Vec::new();
    let value = resolve_value(input, outputs, current, &mut unresolved);
    ResolvedInput { value, unresolved }
}

fn resolve_value(
    value: &Value,
    outputs: &[Option<Value>],
    current: usize,
    unresolved: &mut Vec<String>,
) -> Value {
    match value {
        Value::String(s) => resolve_string(s, outputs, current, unresolved),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| resolve_value(v, outputs, current, unresolved))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, outputs, current, unresolved)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn lookup(caps: &Captures<'_>, outputs: &[Option<Value>], current: usize) -> Option<Value> {
    // 只能引用当前步骤之前的输出
    let step = match (caps.get(1), caps.get(2)) {
        (Some(n), _) => n.as_str().parse::<usize>().ok()?,
        (None, Some(_)) => current.checked_sub(1)?,
        _ => return None,
    };
    if step == 0 || step >= current {
        return None;
    }
    let mut node = outputs.get(step - 1)?.as_ref()?;
    let path = caps.get(3).map(|m| m.as_str()).unwrap_or("");
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        node = match node {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node.clone())
}

fn resolve_string(
    s: &str,
    outputs: &[Option<Value>],
    current: usize,
    unresolved: &mut Vec<String>,
) -> Value {
    let re = placeholder_re();
    if let Some(caps) = re.captures(s) {
        let whole = caps.get(0).is_some_and(|m| m.start() == 0 && m.end() == s.len());
        if whole {
            return lookup(&caps, outputs, current).unwrap_or_else(|| {
                unresolved.push(s.to_string());
                Value::Null
            });
        }
    } else {
        return Value::String(s.to_string());
    }

    let replaced = re.replace_all(s, |caps: &Captures<'_>| {
        match lookup(caps, outputs, current) {
            Some(Value::String(text)) => text,
            Some(Value::Null) => String::new(),
            Some(other) => other.to_string(),
            None => {
                unresolved.push(caps[0].to_string());
                String::new()
            }
        }
    });
    Value::String(replaced.into_owned())
}
