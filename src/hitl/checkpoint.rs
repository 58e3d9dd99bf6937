//! 检查点类型
//!
//! 状态机：pending → {approved | rejected | modified | timed_out}，终态不可再变。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 检查点类型（即插入点）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    PlanApproval,
    ToolExecutionApproval,
    SubagentApproval,
    CriticalDecisionApproval,
    FinalReview,
}

impl CheckpointKind {
    pub fn name(&self) -> &'static str {
        match self {
            CheckpointKind::PlanApproval => "plan_approval",
            CheckpointKind::ToolExecutionApproval => "tool_execution_approval",
            CheckpointKind::SubagentApproval => "subagent_approval",
            CheckpointKind::CriticalDecisionApproval => "critical_decision_approval",
            CheckpointKind::FinalReview => "final_review",
        }
    }
}

impl fmt::Display for CheckpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStatus {
    Pending,
    Approved,
    Rejected,
    Modified,
    TimedOut,
}

impl CheckpointStatus {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, CheckpointStatus::Pending)
    }
}

/// 审核动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// 超时自动转换时为 "system"
    pub reviewer: String,
    pub resolved_at: DateTime<Utc>,
    /// Modify 时为替换内容；Reject 时可携带审核意见
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modification: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub mission_id: String,
    pub kind: CheckpointKind,
    pub status: CheckpointStatus,
    pub proposed: Value,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    pub created_at: DateTime<Utc>,
}

/// 检查点结束后对任务的影响
#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointDecision {
    /// 继续执行；内容为原提议或审核者的修改
    Proceed(Value),
    Reject { feedback: Option<Value> },
}

impl Checkpoint {
    pub fn new(mission_id: impl Into<String>, kind: CheckpointKind, proposed: Value) -> Self {
        Self {
            id: format!("cp-{}", uuid::Uuid::new_v4()),
            mission_id: mission_id.into(),
            kind,
            status: CheckpointStatus::Pending,
            proposed,
            resolution: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == CheckpointStatus::Pending
    }

    /// 超时默认视为拒绝，除非任务策略允许超时自动批准
    pub fn decision(&self, auto_approve_on_timeout: bool) -> Option<CheckpointDecision> {
        let modification = self.resolution.as_ref().and_then(|r| r.modification.clone());
        match self.status {
            CheckpointStatus::Pending => None,
            CheckpointStatus::Approved => Some(CheckpointDecision::Proceed(self.proposed.clone())),
            CheckpointStatus::Modified => Some(CheckpointDecision::Proceed(
                modification.unwrap_or_else(|| self.proposed.clone()),
            )),
            CheckpointStatus::Rejected => Some(CheckpointDecision::Reject {
                feedback: modification,
            }),
            CheckpointStatus::TimedOut if auto_approve_on_timeout => {
                Some(CheckpointDecision::Proceed(self.proposed.clone()))
            }
            CheckpointStatus::TimedOut => Some(CheckpointDecision::Reject { feedback: None }),
        }
    }
}
