//! 任务错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 MissionError 决定 Retry / RetryWithPrompt / SkipStep / FailMission / Abort。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hitl::CheckpointKind;

pub type Result<T, E = MissionError> = std::result::Result<T, E>;

/// 任务执行过程中可能出现的错误（校验、依赖、熔断、检查点、预算、生命周期等）
#[derive(Error, Debug, Clone)]
pub enum MissionError {
    /// 输入不合法（如融合权重为负），立即拒绝，不重试
    #[error("Validation error: {0}")]
    Validation(String),

    /// 依赖暂时不可用（超时、限流），按重试策略重试
    #[error("Transient failure in {dependency}: {message}")]
    TransientDependency { dependency: String, message: String },

    /// 依赖返回了不可重试的错误
    #[error("Dependency {dependency} failed: {message}")]
    DependencyFailed { dependency: String, message: String },

    #[error("Dependency {dependency} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        dependency: String,
        attempts: u32,
        last_error: String,
    },

    /// 熔断器打开：不发起调用，直接失败
    #[error("Circuit open for {dependency}")]
    CircuitOpen { dependency: String },

    #[error("Checkpoint {checkpoint_id} ({kind}) rejected")]
    CheckpointRejected {
        kind: CheckpointKind,
        checkpoint_id: String,
    },

    #[error("Mission {mission_id} already has pending checkpoint {checkpoint_id}")]
    CheckpointAlreadyPending {
        mission_id: String,
        checkpoint_id: String,
    },

    #[error("Checkpoint not found: {0}")]
    CheckpointNotFound(String),

    #[error("Budget exceeded on {line}: limit {limit:.4}, spent {spent:.4}, requested {requested:.4}")]
    BudgetExceeded {
        line: String,
        limit: f64,
        spent: f64,
        requested: f64,
    },

    #[error("Mission cancelled")]
    Cancelled,

    #[error("Mission not found: {0}")]
    MissionNotFound(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),
}

impl MissionError {
    pub fn transient(dependency: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientDependency {
            dependency: dependency.into(),
            message: message.into(),
        }
    }

    /// 仅瞬时依赖错误可重试；工具超时时调用可能已部分生效，不再重放
    pub fn is_retryable(&self) -> bool {
        matches!(self, MissionError::TransientDependency { .. })
    }

    /// 该错误是否应计入熔断器的连续失败次数
    pub fn counts_as_dependency_failure(&self) -> bool {
        matches!(
            self,
            MissionError::TransientDependency { .. }
                | MissionError::DependencyFailed { .. }
                | MissionError::ToolTimeout(_)
                | MissionError::ToolExecutionFailed(_)
        )
    }
}

impl From<rusqlite::Error> for MissionError {
    fn from(e: rusqlite::Error) -> Self {
        MissionError::Persistence(e.to_string())
    }
}

impl From<std::io::Error> for MissionError {
    fn from(e: std::io::Error) -> Self {
        MissionError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for MissionError {
    fn from(e: serde_json::Error) -> Self {
        MissionError::JsonParse(e.to_string())
    }
}

/// 任务失败原因：失败快照中必须能说明「哪个检查点 / 哪个依赖 / 哪条预算」
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    PlanRejected { checkpoint_id: String },
    BudgetExceeded {
        line: String,
        limit: f64,
        spent: f64,
        requested: f64,
    },
    DependencyExhausted { dependency: String, error: String },
    CircuitOpen { dependency: String },
    Internal { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::PlanRejected { .. } => write!(f, "plan rejected by reviewer"),
            FailureReason::BudgetExceeded { .. } => write!(f, "budget exceeded"),
            FailureReason::DependencyExhausted { dependency, .. } => {
                write!(f, "dependency {dependency} unavailable")
            }
            FailureReason::CircuitOpen { dependency } => {
                write!(f, "circuit open for {dependency}")
            }
            FailureReason::Internal { message } => write!(f, "{message}"),
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 按重试策略再次调用依赖
    Retry,
    /// 将提示注入下一次调用，让 LLM 重新输出（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 记录为单步失败，继续后续步骤
    SkipStep(String),
    /// 任务级失败
    FailMission(FailureReason),
    /// 终止当前任务（取消）
    Abort,
}
