//! 工具并发池：所有任务共享
//!
//! 任务之间并发运行，但工具调用通过 Semaphore 限制同时执行的数量，保护下游工具提供方。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::{MissionError, Result};

/// 工具调用调度器（进程级共享）
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    tool_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_concurrent_tools: usize) -> Self {
        Self {
            tool_semaphore: Arc::new(Semaphore::new(max_concurrent_tools.max(1))),
        }
    }

    /// 获取工具执行许可
    pub async fn acquire_tool(&self) -> Result<OwnedSemaphorePermit> {
        self.tool_semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| MissionError::ToolExecutionFailed("tool pool closed".to_string()))
    }

    pub fn available(&self) -> usize {
        self.tool_semaphore.available_permits()
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(8)
    }
}
