//! 错误恢复引擎
//!
//! 根据 MissionError 类型返回 RecoveryAction，供重试策略、工具链与 ReAct 循环决定是重试、跳过、失败还是终止。

use crate::core::{FailureReason, MissionError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    /// 根据错误类型返回建议的恢复动作
    pub fn handle(&self, err: &MissionError) -> RecoveryAction {
        match err {
            MissionError::JsonParse(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output was not valid JSON ({raw}). \
                 Reply with exactly one JSON object and nothing else."
            )),
            MissionError::TransientDependency { .. } => RecoveryAction::Retry,
            MissionError::ToolTimeout(tool) => {
                RecoveryAction::SkipStep(format!("tool {tool} timed out"))
            }
            MissionError::ToolExecutionFailed(msg) => RecoveryAction::SkipStep(msg.clone()),
            MissionError::ToolNotFound(name) => {
                RecoveryAction::SkipStep(format!("unknown tool {name}"))
            }
            MissionError::CheckpointRejected {
                kind,
                checkpoint_id,
            } => match kind {
                crate::hitl::CheckpointKind::PlanApproval => {
                    RecoveryAction::FailMission(FailureReason::PlanRejected {
                        checkpoint_id: checkpoint_id.clone(),
                    })
                }
                _ => RecoveryAction::SkipStep(format!("{kind} rejected by reviewer")),
            },
            MissionError::BudgetExceeded {
                line,
                limit,
                spent,
                requested,
            } => RecoveryAction::FailMission(FailureReason::BudgetExceeded {
                line: line.clone(),
                limit: *limit,
                spent: *spent,
                requested: *requested,
            }),
            MissionError::RetriesExhausted {
                dependency,
                last_error,
                ..
            } => RecoveryAction::FailMission(FailureReason::DependencyExhausted {
                dependency: dependency.clone(),
                error: last_error.clone(),
            }),
            MissionError::DependencyFailed {
                dependency,
                message,
            } => RecoveryAction::FailMission(FailureReason::DependencyExhausted {
                dependency: dependency.clone(),
                error: message.clone(),
            }),
            MissionError::CircuitOpen { dependency } => {
                RecoveryAction::FailMission(FailureReason::CircuitOpen {
                    dependency: dependency.clone(),
                })
            }
            MissionError::Cancelled => RecoveryAction::Abort,
            other => RecoveryAction::FailMission(FailureReason::Internal {
                message: other.to_string(),
            }),
        }
    }

    /// 将任务级错误归约为失败原因（取消返回 None）
    pub fn failure_reason(&self, err: &MissionError) -> Option<FailureReason> {
        match self.handle(err) {
            RecoveryAction::FailMission(reason) => Some(reason),
            RecoveryAction::Abort => None,
            _ => Some(FailureReason::Internal {
                message: err.to_string(),
            }),
        }
    }
}
