//! Thought：让 LLM 决定下一步动作
//!
//! 输出是结构化 JSON：{"thought": "...", "action": "use_tools" | "answer" | "delegate", ...，"critical": bool}。
//! 第一次输出不是合法 JSON 时，按恢复引擎的 RetryWithPrompt 附加纠正提示重新请求一次；
//! 第二次仍不合法则把原文当作直接回答。

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{MissionError, RecoveryAction, RecoveryEngine, ResiliencePolicy, Result};
use crate::llm::{complete_stage, parse_json, LlmClient, Stage};
use crate::tools::StepHooks;

const THOUGHT_PROMPT: &str = "You drive an autonomous mission. Decide the single next action.\n\
Reply with JSON only, one of:\n\
{\"thought\": \"...\", \"action\": \"use_tools\", \"objective\": \"what the tools should achieve\"}\n\
{\"thought\": \"...\", \"action\": \"answer\", \"answer\": \"the answer to the goal\"}\n\
{\"thought\": \"...\", \"action\": \"delegate\", \"task\": \"sub-task\", \"level\": 3}\n\
Add \"critical\": true when the decision is irreversible or high impact.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ThoughtDecision {
    #[serde(alias = "tools", alias = "tool")]
    UseTools {
        #[serde(default)]
        objective: String,
    },
    #[serde(alias = "respond", alias = "final_answer")]
    Answer {
        #[serde(default)]
        answer: String,
    },
    Delegate {
        #[serde(default)]
        task: String,
        #[serde(default)]
        level: Option<u8>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thought {
    #[serde(default, alias = "reasoning")]
    pub thought: String,
    #[serde(flatten)]
    pub decision: ThoughtDecision,
    #[serde(default)]
    pub critical: bool,
}

impl Thought {
    pub fn direct_answer(text: &str) -> Self {
        Self {
            thought: "unstructured reply treated as a direct answer".to_string(),
            decision: ThoughtDecision::Answer {
                answer: text.trim().to_string(),
            },
            critical: false,
        }
    }

    /// 审核者修改后的决策；不是合法 Thought 时返回校验错误
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value.clone()).map_err(|e| {
            MissionError::Validation(format!("modified decision is not a valid thought ({e}): {value}"))
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn summary(&self) -> String {
        let action = match &self.decision {
            ThoughtDecision::UseTools { objective } => format!("use tools: {objective}"),
            ThoughtDecision::Answer { answer } => format!("answer: {answer}"),
            ThoughtDecision::Delegate { task, level } => match level {
                Some(l) => format!("delegate to L{l}: {task}"),
                None => format!("delegate: {task}"),
            },
        };
        if self.thought.is_empty() {
            action
        } else {
            format!("{} -> {}", self.thought, action)
        }
    }
}

pub fn parse_thought(raw: &str) -> Result<Thought> {
    parse_json(raw)
}

/// Thought 阶段的 LLM 调用方
#[derive(Clone)]
pub struct ThoughtPlanner {
    llm: Arc<dyn LlmClient>,
    policy: ResiliencePolicy,
    recovery: RecoveryEngine,
    call_cost: f64,
}

impl ThoughtPlanner {
    pub fn new(llm: Arc<dyn LlmClient>, policy: ResiliencePolicy, call_cost: f64) -> Self {
        Self {
            llm,
            policy,
            recovery: RecoveryEngine::new(),
            call_cost,
        }
    }

    /// context 的第一行必须是任务目标
    pub async fn think(&self, context: &str, hooks: &dyn StepHooks) -> Result<Thought> {
        hooks.spend("llm", self.call_cost).await?;
        let raw = self.ask(context).await?;
        let err = match parse_thought(&raw) {
            Ok(thought) => return Ok(thought),
            Err(e) => e,
        };

        let RecoveryAction::RetryWithPrompt(correction) = self.recovery.handle(&err) else {
            return Err(err);
        };
        tracing::warn!(error = %err, "thought was not valid JSON, asking again");
        hooks.spend("llm", self.call_cost).await?;
        let retry = self.ask(&format!("{context}\n\n{correction}")).await?;
        match parse_thought(&retry) {
            Ok(thought) => Ok(thought),
            Err(MissionError::JsonParse(e)) => {
                tracing::warn!(error = %e, "thought still malformed, using it as a direct answer");
                Ok(Thought::direct_answer(&retry))
            }
            Err(e) => Err(e),
        }
    }

    async fn ask(&self, context: &str) -> Result<String> {
        complete_stage(
            self.llm.as_ref(),
            &self.policy,
            Stage::Thought,
            THOUGHT_PROMPT,
            context,
        )
        .await
    }
}
