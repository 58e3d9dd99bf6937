//! 核心层：错误与恢复、弹性策略（重试 / 熔断）、任务监管、工具并发池

pub mod error;
pub mod recovery;
pub mod resilience;
pub mod supervisor;
pub mod task_scheduler;

pub use error::{FailureReason, MissionError, RecoveryAction, Result};
pub use recovery::RecoveryEngine;
pub use resilience::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker,
    ResiliencePolicy, RetryPolicy,
};
pub use supervisor::MissionSupervisor;
pub use task_scheduler::TaskScheduler;
