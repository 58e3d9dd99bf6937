//! 任务监管：取消令牌与暂停 / 恢复信号
//!
//! 每个任务持有一个 MissionSupervisor。cancel 触发 CancellationToken（在每轮开始与每次工具调用前检查）；
//! pause 仅设置标志，由任务自身在轮次边界观察到后挂起，resume 通过 Notify 唤醒。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// 任务级生命周期信号：取消令牌与暂停状态
#[derive(Debug, Clone)]
pub struct MissionSupervisor {
    cancel_token: CancellationToken,
    paused: Arc<AtomicBool>,
    resumed: Arc<Notify>,
}

impl MissionSupervisor {
    pub fn new() -> Self {
        Self {
            cancel_token: CancellationToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            resumed: Arc::new(Notify::new()),
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
        self.resumed.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn request_pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn request_resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.resumed.notify_one();
    }

    /// 挂起直到 resume 或 cancel；返回 false 表示被取消
    pub async fn wait_for_resume(&self) -> bool {
        loop {
            if self.is_cancelled() {
                return false;
            }
            if !self.is_paused() {
                return true;
            }
            tokio::select! {
                _ = self.resumed.notified() => {}
                _ = self.cancel_token.cancelled() => return false,
            }
        }
    }
}

impl Default for MissionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
