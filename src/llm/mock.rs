//! Mock / 脚本化 LLM 客户端（用于测试与无 API Key 的本地运行）
//!
//! MockLlmClient 按阶段给出确定性输出：Thought 直接回答、Plan 调用 echo、Reflection 给出满分置信度。
//! ScriptedLlmClient 为每个阶段维护一个回复队列，队列耗尽后回落到 MockLlmClient，并记录所有调用。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{LlmClient, Message, Role, Stage};

fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| matches!(m.role, Role::User))
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)")
}

/// Mock 客户端：无需 API，按阶段回显
#[derive(Debug, Default, Clone, Copy)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let input = last_user(messages);
        let first_line = input.lines().next().unwrap_or_default().trim().to_string();
        let reply = match Stage::detect(messages) {
            Some(Stage::Thought) => json!({
                "thought": "The goal can be answered directly.",
                "action": "answer",
                "answer": format!("Mock answer: {first_line}"),
            }),
            Some(Stage::Plan) => json!({
                "steps": [{ "tool": "echo", "input": { "text": first_line } }]
            }),
            Some(Stage::Synthesis) => json!({ "answer": format!("Synthesized: {first_line}") }),
            Some(Stage::Reflection) => json!({
                "critique": "Mock reflection: no issues found.",
                "confidence": 1.0,
                "issues": [],
            }),
            None => return Ok(format!("Echo from Mock: {input}")),
        };
        Ok(reply.to_string())
    }
}

/// 脚本化回复
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    Error(String),
}

/// 一次被记录的调用
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub stage: Option<Stage>,
    pub messages: Vec<Message>,
}

/// 按阶段脚本化的客户端
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    scripts: Mutex<HashMap<Stage, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<RecordedCall>>,
    fallback: MockLlmClient,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(self, stage: Stage, text: impl Into<String>) -> Self {
        self.enqueue(stage, ScriptedReply::Text(text.into()));
        self
    }

    pub fn push_json(self, stage: Stage, value: serde_json::Value) -> Self {
        self.push(stage, value.to_string())
    }

    pub fn push_error(self, stage: Stage, message: impl Into<String>) -> Self {
        self.enqueue(stage, ScriptedReply::Error(message.into()));
        self
    }

    pub fn enqueue(&self, stage: Stage, reply: ScriptedReply) {
        self.scripts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(stage)
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self, stage: Stage) -> Vec<RecordedCall> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.stage == Some(stage))
            .cloned()
            .collect()
    }

    pub fn call_count(&self, stage: Stage) -> usize {
        self.calls(stage).len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let stage = Stage::detect(messages);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(RecordedCall {
                stage,
                messages: messages.to_vec(),
            });

        let scripted = stage.and_then(|s| {
            self.scripts
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get_mut(&s)
                .and_then(|q| q.pop_front())
        });
        match scripted {
            Some(ScriptedReply::Text(text)) => Ok(text),
            Some(ScriptedReply::Error(err)) => Err(err),
            None => self.fallback.complete(messages).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_replies_then_fallback() {
        let llm = ScriptedLlmClient::new()
            .push(Stage::Thought, "first")
            .push_error(Stage::Thought, "provider down");
        let messages = vec![Stage::Thought.system_message("t"), Message::user("goal")];
        assert_eq!(llm.complete(&messages).await.unwrap(), "first");
        assert_eq!(llm.complete(&messages).await.unwrap_err(), "provider down");
        let fallback = llm.complete(&messages).await.unwrap();
        assert!(fallback.contains("Mock answer: goal"));
        assert_eq!(llm.call_count(Stage::Thought), 3);
        assert_eq!(llm.call_count(Stage::Plan), 0);
    }

    #[tokio::test]
    async fn test_mock_plan_uses_echo() {
        let messages = vec![Stage::Plan.system_message("p"), Message::user("find x")];
        let out = MockLlmClient.complete(&messages).await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["steps"][0]["tool"], "echo");
    }
}
