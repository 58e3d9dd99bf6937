//! Reflection：对本轮候选答案做自我评估，给出置信度与问题列表
//!
//! 提供方错误经 ResiliencePolicy 重试，耗尽后上抛（任务失败）；输出无法解析时置信度记为 0，不视为错误。

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::core::{ResiliencePolicy, Result};
use crate::llm::{complete_stage, parse_json, LlmClient, Stage};
use crate::tools::StepHooks;

const REFLECTION_PROMPT: &str = "You review progress on a mission goal. Judge whether the candidate \
answer fully and correctly achieves the goal given the observation.\n\
Reply with JSON only: {\"critique\": \"...\", \"confidence\": 0.0-1.0, \"issues\": [\"...\"]}";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    #[serde(default)]
    pub critique: String,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl Reflection {
    fn normalized(mut self) -> Self {
        self.confidence = if self.confidence.is_finite() {
            self.confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn summary(&self) -> String {
        if self.issues.is_empty() {
            format!("confidence {:.2}: {}", self.confidence, self.critique)
        } else {
            format!(
                "confidence {:.2}: {} (issues: {})",
                self.confidence,
                self.critique,
                self.issues.join("; ")
            )
        }
    }
}

#[derive(Clone)]
pub struct Critic {
    llm: Arc<dyn LlmClient>,
    policy: ResiliencePolicy,
    call_cost: f64,
}

impl Critic {
    pub fn new(llm: Arc<dyn LlmClient>, policy: ResiliencePolicy, call_cost: f64) -> Self {
        Self {
            llm,
            policy,
            call_cost,
        }
    }

    pub async fn reflect(
        &self,
        goal: &str,
        candidate: Option<&str>,
        observation: &str,
        hooks: &dyn StepHooks,
    ) -> Result<Reflection> {
        let user = format!(
            "{goal}\n\nCandidate answer:\n{}\n\nObservation:\n{observation}",
            candidate.unwrap_or("(none)")
        );
        hooks.spend("llm", self.call_cost).await?;
        let raw = complete_stage(
            self.llm.as_ref(),
            &self.policy,
            Stage::Reflection,
            REFLECTION_PROMPT,
            &user,
        )
        .await?;
        match parse_json::<Reflection>(&raw) {
            Ok(reflection) => Ok(reflection.normalized()),
            Err(e) => {
                tracing::warn!(error = %e, "reflection output malformed, confidence set to 0");
                Ok(Reflection {
                    critique: raw.trim().to_string(),
                    confidence: 0.0,
                    issues: vec!["unstructured reflection".to_string()],
                })
            }
        }
    }
}
