//! ReAct 状态机与推理步骤
//!
//! goal_understood → planning → thinking → acting → observing → reflecting → reassessing
//! → {thinking | goal_achieved | iteration_limit_reached | failed}。非法转换返回 InvalidTransition。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{MissionError, Result};
use crate::tools::ToolCall;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReactState {
    #[default]
    GoalUnderstood,
    Planning,
    Thinking,
    Acting,
    Observing,
    Reflecting,
    Reassessing,
    GoalAchieved,
    IterationLimitReached,
    Failed,
}

impl ReactState {
    pub fn name(&self) -> &'static str {
        match self {
            ReactState::GoalUnderstood => "goal_understood",
            ReactState::Planning => "planning",
            ReactState::Thinking => "thinking",
            ReactState::Acting => "acting",
            ReactState::Observing => "observing",
            ReactState::Reflecting => "reflecting",
            ReactState::Reassessing => "reassessing",
            ReactState::GoalAchieved => "goal_achieved",
            ReactState::IterationLimitReached => "iteration_limit_reached",
            ReactState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReactState::GoalAchieved | ReactState::IterationLimitReached | ReactState::Failed
        )
    }

    pub fn can_transition(&self, to: ReactState) -> bool {
        use ReactState::*;
        match (self, to) {
            (GoalUnderstood, Planning) => true,
            (Planning, Thinking) => true,
            (Thinking, Acting) => true,
            (Acting, Observing) => true,
            (Observing, Reflecting) => true,
            (Reflecting, Reassessing) => true,
            (Reassessing, Thinking | GoalAchieved | IterationLimitReached) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn transition(self, to: ReactState) -> Result<ReactState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(MissionError::InvalidTransition {
                from: self.name().to_string(),
                to: to.name().to_string(),
            })
        }
    }
}

impl fmt::Display for ReactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 任务完成方式；达到迭代上限也算完成而非失败
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionOutcome {
    GoalAchieved,
    IterationLimitReached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Thought,
    Action,
    Observation,
    Reflection,
}

/// 推理步骤：只追加，sequence 在任务内单调递增
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningStep {
    pub sequence: u64,
    /// 所属迭代（从 1 开始）
    pub iteration: u32,
    pub kind: StepKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    pub created_at: DateTime<Utc>,
}
