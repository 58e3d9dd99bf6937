//! 任务数据模型
//!
//! MissionStatus 为带标签的枚举：每个状态只携带对该状态有效的字段。
//! 生命周期：draft → running → {paused ↔ running} → {completed | failed | cancelled}，以及 running ↔ awaiting_checkpoint。

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MissionSection;
use crate::core::{BreakerSnapshot, FailureReason, MissionError, Result};
use crate::fusion::Selection;
use crate::hitl::{Checkpoint, CheckpointKind};
use crate::mission::BudgetLedger;
use crate::react::{CompletionOutcome, LoopMemory, LoopSettings, ReasoningStep};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MissionStatus {
    Draft,
    Running,
    Paused {
        paused_at: DateTime<Utc>,
    },
    AwaitingCheckpoint {
        checkpoint_id: String,
        kind: CheckpointKind,
    },
    Completed {
        answer: String,
        outcome: CompletionOutcome,
        completed_at: DateTime<Utc>,
    },
    Failed {
        reason: FailureReason,
        message: String,
        last_sequence: u64,
        failed_at: DateTime<Utc>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
    },
}

impl MissionStatus {
    pub fn name(&self) -> &'static str {
        match self {
            MissionStatus::Draft => "draft",
            MissionStatus::Running => "running",
            MissionStatus::Paused { .. } => "paused",
            MissionStatus::AwaitingCheckpoint { .. } => "awaiting_checkpoint",
            MissionStatus::Completed { .. } => "completed",
            MissionStatus::Failed { .. } => "failed",
            MissionStatus::Cancelled { .. } => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MissionStatus::Completed { .. }
                | MissionStatus::Failed { .. }
                | MissionStatus::Cancelled { .. }
        )
    }

    pub fn can_transition(&self, to: &MissionStatus) -> bool {
        use MissionStatus::*;
        match (self, to) {
            (Draft, Running | Failed { .. } | Cancelled { .. }) => true,
            (Running, Paused { .. } | AwaitingCheckpoint { .. }) => true,
            (Running, Completed { .. } | Failed { .. } | Cancelled { .. }) => true,
            (Paused { .. }, Running | Cancelled { .. }) => true,
            (AwaitingCheckpoint { .. }, Running | Failed { .. } | Cancelled { .. }) => true,
            // 重启后重新进入同一检查点
            (AwaitingCheckpoint { .. }, AwaitingCheckpoint { .. }) => true,
            _ => false,
        }
    }
}

impl fmt::Display for MissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 智能体选择方式
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AgentSelectionMode {
    /// 由融合选择器挑选
    #[default]
    Auto,
    Fixed { agent_id: String },
}

/// 任务级策略（默认取自 [mission] 配置段）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MissionPolicy {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
    pub require_final_review: bool,
    pub auto_approve_on_timeout: bool,
}

impl Default for MissionPolicy {
    fn default() -> Self {
        Self::from(&MissionSection::default())
    }
}

impl From<&MissionSection> for MissionPolicy {
    fn from(section: &MissionSection) -> Self {
        Self {
            max_iterations: section.max_iterations,
            confidence_threshold: section.confidence_threshold,
            require_final_review: section.require_final_review,
            auto_approve_on_timeout: section.auto_approve_on_timeout,
        }
    }
}

impl MissionPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(MissionError::Validation(
                "max_iterations must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(MissionError::Validation(format!(
                "confidence_threshold must be within 0..=1, got {}",
                self.confidence_threshold
            )));
        }
        Ok(())
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            max_iterations: self.max_iterations,
            confidence_threshold: self.confidence_threshold,
            require_final_review: self.require_final_review,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mission {
    pub id: String,
    pub tenant_id: String,
    pub goal: String,
    pub status: MissionStatus,
    /// 已完成的迭代数
    pub iteration: u32,
    pub budget: BudgetLedger,
    pub selection_mode: AgentSelectionMode,
    pub selected_agent: Option<String>,
    pub policy: MissionPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Mission {
    pub fn new(
        tenant_id: impl Into<String>,
        goal: impl Into<String>,
        selection_mode: AgentSelectionMode,
        budget: BudgetLedger,
        policy: MissionPolicy,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: format!("m-{}", uuid::Uuid::new_v4()),
            tenant_id: tenant_id.into(),
            goal: goal.into(),
            status: MissionStatus::Draft,
            iteration: 0,
            budget,
            selection_mode,
            selected_agent: None,
            policy,
            created_at: now,
            updated_at: now,
        }
    }

    /// 校验后转换状态
    pub fn transition(&mut self, to: MissionStatus) -> Result<()> {
        if !self.status.can_transition(&to) {
            return Err(MissionError::InvalidTransition {
                from: self.status.name().to_string(),
                to: to.name().to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// 任务快照：崩溃恢复所需的全部状态
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionStateSnapshot {
    pub mission: Mission,
    /// 已提交的推理步骤（只追加）
    pub steps: Vec<ReasoningStep>,
    pub pending_checkpoint: Option<Checkpoint>,
    #[serde(default)]
    pub checkpoint_history: Vec<Checkpoint>,
    /// 各依赖的熔断器计数
    #[serde(default)]
    pub breakers: BTreeMap<String, BreakerSnapshot>,
    pub next_step_sequence: u64,
    pub next_event_sequence: u64,
    /// 融合选择的决策记录
    pub selection: Option<Selection>,
    #[serde(default)]
    pub memory: LoopMemory,
}

impl MissionStateSnapshot {
    pub fn new(mission: Mission) -> Self {
        Self {
            mission,
            steps: Vec::new(),
            pending_checkpoint: None,
            checkpoint_history: Vec::new(),
            breakers: BTreeMap::new(),
            next_step_sequence: 1,
            next_event_sequence: 1,
            selection: None,
            memory: LoopMemory::default(),
        }
    }

    pub fn id(&self) -> &str {
        &self.mission.id
    }

    pub fn is_terminal(&self) -> bool {
        self.mission.status.is_terminal()
    }

    /// 最后一个已提交步骤的序号（无步骤时为 0）
    pub fn last_sequence(&self) -> u64 {
        self.steps.last().map(|s| s.sequence).unwrap_or(0)
    }
}
