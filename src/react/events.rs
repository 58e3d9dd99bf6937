//! 任务事件：reasoning_step / checkpoint_reached / tool_result / mission_completed / mission_failed / mission_cancelled
//!
//! 每个事件带任务 id、任务内递增的序号与时间戳，经 broadcast 通道广播；订阅者只能看到订阅之后的事件，不回放。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::core::FailureReason;
use crate::hitl::Checkpoint;
use crate::react::{CompletionOutcome, ReasoningStep};
use crate::tools::{ToolCall, ToolResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ReasoningStep {
        step: ReasoningStep,
    },
    CheckpointReached {
        checkpoint: Checkpoint,
    },
    ToolResult {
        index: usize,
        call: ToolCall,
        result: ToolResult,
    },
    MissionCompleted {
        answer: String,
        outcome: CompletionOutcome,
        iterations: u32,
    },
    MissionFailed {
        reason: FailureReason,
        message: String,
        last_sequence: u64,
    },
    MissionCancelled {
        iterations: u32,
    },
}

impl EventPayload {
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::ReasoningStep { .. } => "reasoning_step",
            EventPayload::CheckpointReached { .. } => "checkpoint_reached",
            EventPayload::ToolResult { .. } => "tool_result",
            EventPayload::MissionCompleted { .. } => "mission_completed",
            EventPayload::MissionFailed { .. } => "mission_failed",
            EventPayload::MissionCancelled { .. } => "mission_cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventPayload::MissionCompleted { .. }
                | EventPayload::MissionFailed { .. }
                | EventPayload::MissionCancelled { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionEvent {
    pub mission_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// 引擎级事件总线
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MissionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.tx.subscribe()
    }

    /// 没有订阅者时事件直接丢弃
    pub fn publish(&self, event: MissionEvent) {
        tracing::debug!(
            mission_id = %event.mission_id,
            sequence = event.sequence,
            event = event.payload.name(),
            "event"
        );
        let _ = self.tx.send(event);
    }
}
