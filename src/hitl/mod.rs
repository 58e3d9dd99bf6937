//! 人在回路（HITL）检查点：类型与管理器

pub mod checkpoint;
pub mod manager;

pub use checkpoint::{
    Checkpoint, CheckpointDecision, CheckpointKind, CheckpointStatus, Resolution, ReviewAction,
};
pub use manager::CheckpointManager;
