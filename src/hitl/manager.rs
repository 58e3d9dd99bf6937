//! 检查点管理器
//!
//! 每个任务同一时刻最多一个 pending 检查点。raise 登记并建立 oneshot 通道，wait 在通道、
//! 超时与取消三者间 select；resolve 由外部审核者调用，转换状态并唤醒等待方。
//! 超时与 resolve 可能竞争：以先拿到锁的一方为准，另一方从已解决历史中读取结果。

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::HitlSection;
use crate::core::{MissionError, Result};
use crate::hitl::{Checkpoint, CheckpointKind, CheckpointStatus, Resolution, ReviewAction};

struct PendingEntry {
    checkpoint: Checkpoint,
    tx: Option<oneshot::Sender<Checkpoint>>,
    rx: Option<oneshot::Receiver<Checkpoint>>,
}

impl PendingEntry {
    fn new(checkpoint: Checkpoint) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            checkpoint,
            tx: Some(tx),
            rx: Some(rx),
        }
    }
}

#[derive(Default)]
struct Inner {
    /// mission_id -> 当前 pending 检查点
    pending: HashMap<String, PendingEntry>,
    /// checkpoint_id -> 已解决的检查点
    resolved: HashMap<String, Checkpoint>,
}

pub struct CheckpointManager {
    timeouts: HitlSection,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    pub fn new(timeouts: HitlSection) -> Self {
        Self {
            timeouts,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 登记新的 pending 检查点；同一任务已有 pending 时立即失败
    pub fn raise(
        &self,
        mission_id: &str,
        kind: CheckpointKind,
        proposed: Value,
    ) -> Result<Checkpoint> {
        let mut inner = self.lock();
        if let Some(existing) = inner.pending.get(mission_id) {
            return Err(MissionError::CheckpointAlreadyPending {
                mission_id: mission_id.to_string(),
                checkpoint_id: existing.checkpoint.id.clone(),
            });
        }
        let checkpoint = Checkpoint::new(mission_id, kind, proposed);
        inner
            .pending
            .insert(mission_id.to_string(), PendingEntry::new(checkpoint.clone()));
        tracing::info!(mission_id, checkpoint_id = %checkpoint.id, %kind, "checkpoint raised");
        Ok(checkpoint)
    }

    /// 重启后从快照重新登记 pending 检查点（保持原 id）
    pub fn restore(&self, checkpoint: Checkpoint) -> Result<()> {
        if !checkpoint.is_pending() {
            return Err(MissionError::Validation(format!(
                "checkpoint {} is not pending",
                checkpoint.id
            )));
        }
        let mut inner = self.lock();
        if let Some(existing) = inner.pending.get(&checkpoint.mission_id) {
            if existing.checkpoint.id == checkpoint.id {
                return Ok(());
            }
            return Err(MissionError::CheckpointAlreadyPending {
                mission_id: checkpoint.mission_id.clone(),
                checkpoint_id: existing.checkpoint.id.clone(),
            });
        }
        inner
            .pending
            .insert(checkpoint.mission_id.clone(), PendingEntry::new(checkpoint));
        Ok(())
    }

    /// 审核者解决检查点。Modify 必须提供 modification；Reject 的 modification 作为审核意见保留
    pub fn resolve(
        &self,
        mission_id: &str,
        checkpoint_id: &str,
        action: ReviewAction,
        modification: Option<Value>,
        reviewer: &str,
    ) -> Result<Checkpoint> {
        if action == ReviewAction::Modify && modification.is_none() {
            return Err(MissionError::Validation(
                "modify requires a modification".to_string(),
            ));
        }
        let status = match action {
            ReviewAction::Approve => CheckpointStatus::Approved,
            ReviewAction::Reject => CheckpointStatus::Rejected,
            ReviewAction::Modify => CheckpointStatus::Modified,
        };
        let modification = match action {
            ReviewAction::Approve => None,
            _ => modification,
        };
        let resolved = self.finish(mission_id, checkpoint_id, status, reviewer, modification)?;
        tracing::info!(mission_id, checkpoint_id, status = ?resolved.status, reviewer, "checkpoint resolved");
        Ok(resolved)
    }

    fn finish(
        &self,
        mission_id: &str,
        checkpoint_id: &str,
        status: CheckpointStatus,
        reviewer: &str,
        modification: Option<Value>,
    ) -> Result<Checkpoint> {
        let mut inner = self.lock();
        let matches = inner
            .pending
            .get(mission_id)
            .is_some_and(|e| e.checkpoint.id == checkpoint_id);
        if !matches {
            return Err(MissionError::CheckpointNotFound(checkpoint_id.to_string()));
        }
        let Some(mut entry) = inner.pending.remove(mission_id) else {
            return Err(MissionError::CheckpointNotFound(checkpoint_id.to_string()));
        };
        entry.checkpoint.status = status;
        entry.checkpoint.resolution = Some(Resolution {
            reviewer: reviewer.to_string(),
            resolved_at: Utc::now(),
            modification,
        });
        let resolved = entry.checkpoint;
        inner
            .resolved
            .insert(resolved.id.clone(), resolved.clone());
        if let Some(tx) = entry.tx.take() {
            let _ = tx.send(resolved.clone());
        }
        Ok(resolved)
    }

    /// 阻塞等待检查点结束：审核者解决、按类型超时自动 timed_out，或任务取消（返回 Cancelled）
    pub async fn wait(
        &self,
        mission_id: &str,
        checkpoint_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Checkpoint> {
        let (rx, kind) = {
            let mut inner = self.lock();
            if let Some(done) = inner.resolved.get(checkpoint_id) {
                return Ok(done.clone());
            }
            let entry = inner
                .pending
                .get_mut(mission_id)
                .filter(|e| e.checkpoint.id == checkpoint_id)
                .ok_or_else(|| MissionError::CheckpointNotFound(checkpoint_id.to_string()))?;
            let rx = entry.rx.take().ok_or_else(|| {
                MissionError::Validation(format!("checkpoint {checkpoint_id} is already awaited"))
            })?;
            (rx, entry.checkpoint.kind)
        };

        let timeout = self.timeouts.timeout_for(kind);
        let expired = async {
            match timeout {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            resolved = rx => resolved.map_err(|_| {
                MissionError::CheckpointNotFound(checkpoint_id.to_string())
            }),
            _ = expired => self.expire(mission_id, checkpoint_id),
            _ = cancel.cancelled() => {
                self.put_back(mission_id, checkpoint_id);
                Err(MissionError::Cancelled)
            }
        }
    }

    fn expire(&self, mission_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        match self.finish(mission_id, checkpoint_id, CheckpointStatus::TimedOut, "system", None) {
            Ok(cp) => {
                tracing::warn!(mission_id, checkpoint_id, kind = %cp.kind, "checkpoint timed out");
                Ok(cp)
            }
            // resolve 抢先完成
            Err(_) => self
                .get(checkpoint_id)
                .filter(|cp| cp.status.is_resolved())
                .ok_or_else(|| MissionError::CheckpointNotFound(checkpoint_id.to_string())),
        }
    }

    /// 取消等待后重建通道，检查点保持 pending（由任务决定是否 withdraw）
    fn put_back(&self, mission_id: &str, checkpoint_id: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.pending.get_mut(mission_id) {
            if entry.checkpoint.id == checkpoint_id && entry.rx.is_none() {
                let (tx, rx) = oneshot::channel();
                entry.tx = Some(tx);
                entry.rx = Some(rx);
            }
        }
    }

    /// 撤回该任务的 pending 检查点，并清掉其尚未被取走的已解决记录
    pub fn withdraw(&self, mission_id: &str) -> Option<Checkpoint> {
        let removed = {
            let mut inner = self.lock();
            inner.resolved.retain(|_, cp| cp.mission_id != mission_id);
            inner.pending.remove(mission_id).map(|e| e.checkpoint)
        };
        if let Some(cp) = &removed {
            tracing::info!(mission_id, checkpoint_id = %cp.id, "pending checkpoint withdrawn");
        }
        removed
    }

    /// 任务已把结果写入自己的历史后调用
    pub fn forget(&self, checkpoint_id: &str) {
        self.lock().resolved.remove(checkpoint_id);
    }

    pub fn pending(&self, mission_id: &str) -> Option<Checkpoint> {
        self.lock()
            .pending
            .get(mission_id)
            .map(|e| e.checkpoint.clone())
    }

    pub fn get(&self, checkpoint_id: &str) -> Option<Checkpoint> {
        let inner = self.lock();
        inner.resolved.get(checkpoint_id).cloned().or_else(|| {
            inner
                .pending
                .values()
                .find(|e| e.checkpoint.id == checkpoint_id)
                .map(|e| e.checkpoint.clone())
        })
    }

    /// 该任务已解决、尚未被任务取走的检查点，按创建时间排序
    pub fn history(&self, mission_id: &str) -> Vec<Checkpoint> {
        let mut list: Vec<Checkpoint> = self
            .lock()
            .resolved
            .values()
            .filter(|c| c.mission_id == mission_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        list
    }
}
