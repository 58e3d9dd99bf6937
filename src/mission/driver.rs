//! 任务驱动：每个任务一个 tokio task
//!
//! 只有驱动会写任务快照（单写者）；get_status 只读。每轮迭代产生的推理步骤先缓存在内存中，
//! 迭代结束时与迭代计数、循环状态、熔断计数一起写入存储，写入成功后才替换内存快照并广播事件。
//! 检查点的每次状态变化同样先持久化再继续。崩溃后从最后一次持久化的快照重跑下一轮。

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::core::{
    BreakerRegistry, FailureReason, MissionError, MissionSupervisor, RecoveryEngine,
    ResiliencePolicy, Result,
};
use crate::fusion::CandidateKind;
use crate::hitl::{Checkpoint, CheckpointDecision, CheckpointKind};
use crate::mission::{AgentSelectionMode, MissionPolicy, MissionServices, MissionStateSnapshot, MissionStatus};
use crate::react::{
    CompletionOutcome, Critic, EventPayload, GateOutcome, IterationOutcome, LoopHooks,
    LoopMemory, MissionEvent, ReactState, ReasoningLoop, ReasoningStep, StepKind, ThoughtPlanner,
};
use crate::tools::{StepHooks, ToolApproval, ToolCall, ToolChainExecutor, ToolDescriptor, ToolResult};

/// 本轮尚未提交的推理步骤
#[derive(Default)]
struct StepBuffer {
    next_sequence: u64,
    steps: Vec<ReasoningStep>,
}

pub(crate) struct MissionDriver {
    mission_id: String,
    services: Arc<MissionServices>,
    state: Arc<RwLock<MissionStateSnapshot>>,
    supervisor: MissionSupervisor,
    resilience: ResiliencePolicy,
    reasoning: ReasoningLoop,
    policy: MissionPolicy,
    buffer: Mutex<StepBuffer>,
    done: watch::Sender<bool>,
}

impl MissionDriver {
    pub(crate) fn new(
        services: Arc<MissionServices>,
        snapshot: &MissionStateSnapshot,
        state: Arc<RwLock<MissionStateSnapshot>>,
        supervisor: MissionSupervisor,
        done: watch::Sender<bool>,
    ) -> Self {
        let config = &services.config;
        let breakers = Arc::new(BreakerRegistry::new(config.resilience.breaker_config()));
        breakers.restore(&snapshot.breakers);
        let resilience = ResiliencePolicy::new(config.resilience.retry_policy(), breakers);

        let call_cost = config.llm.call_cost;
        let executor = ToolChainExecutor::new(
            services.tools.clone(),
            services.llm.clone(),
            resilience.clone(),
            services.scheduler.clone(),
        )
        .with_max_chain_length(config.tools.max_chain_length)
        .with_tool_timeout(std::time::Duration::from_secs(config.tools.tool_timeout_secs.max(1)))
        .with_llm_call_cost(call_cost);
        let reasoning = ReasoningLoop::new(
            ThoughtPlanner::new(services.llm.clone(), resilience.clone(), call_cost),
            Critic::new(services.llm.clone(), resilience.clone(), call_cost),
            executor,
            services.hierarchy.clone(),
            snapshot.mission.policy.loop_settings(),
        );

        Self {
            mission_id: snapshot.mission.id.clone(),
            policy: snapshot.mission.policy,
            services,
            state,
            supervisor,
            resilience,
            reasoning,
            buffer: Mutex::new(StepBuffer::default()),
            done,
        }
    }

    pub(crate) async fn run(self) {
        if let Err(err) = self.drive().await {
            self.settle_error(err).await;
        }
        self.done.send_replace(true);
    }

    async fn drive(&self) -> Result<()> {
        let token = self.supervisor.cancel_token();
        let status = self.state.read().await.mission.status.clone();
        if status.is_terminal() {
            return Ok(());
        }
        let agent = if status == MissionStatus::Draft {
            self.start().await?
        } else {
            self.current_agent().await
        };

        loop {
            if token.is_cancelled() {
                return Err(MissionError::Cancelled);
            }
            if self.supervisor.is_paused() {
                self.suspend().await?;
            }

            let (goal, iteration, mut memory, next_sequence) = {
                let s = self.state.read().await;
                (
                    s.mission.goal.clone(),
                    s.mission.iteration + 1,
                    s.memory.clone(),
                    s.next_step_sequence,
                )
            };
            self.begin_iteration(next_sequence);

            let outcome = {
                let run = self
                    .reasoning
                    .run_iteration(&goal, iteration, agent, &mut memory, self);
                tokio::pin!(run);
                tokio::select! {
                    outcome = &mut run => outcome?,
                    _ = token.cancelled() => {
                        // 让本轮在下一个取消检查点自行结束，进行中的外部调用不被中途丢弃
                        let _ = run.await;
                        return Err(MissionError::Cancelled);
                    }
                }
            };

            if self.advance_iteration(iteration, memory, outcome).await? {
                return Ok(());
            }
        }
    }

    /// draft → running：选择执行智能体并记录融合决策
    async fn start(&self) -> Result<Option<usize>> {
        let (goal, mode) = {
            let s = self.state.read().await;
            (s.mission.goal.clone(), s.mission.selection_mode.clone())
        };
        let hierarchy = &self.services.hierarchy;

        let (agent_id, selection) = match mode {
            AgentSelectionMode::Fixed { agent_id } => (Some(agent_id), None),
            AgentSelectionMode::Auto if self.services.fusion.has_sources() => {
                let selection = self.services.fusion.select(&goal, &self.resilience).await?;
                let chosen = selection
                    .items
                    .iter()
                    .filter(|item| item.kind == CandidateKind::Agent)
                    .find(|item| hierarchy.index_of(&item.id).is_some())
                    .map(|item| item.id.clone())
                    .or_else(|| self.fallback_agent());
                (chosen, Some(selection))
            }
            AgentSelectionMode::Auto => (self.fallback_agent(), None),
        };
        tracing::info!(agent = agent_id.as_deref(), "agent selected");

        let next = self
            .prepare(|s| {
                s.mission.selected_agent = agent_id.clone();
                s.selection = selection;
                s.memory.state = ReactState::Planning;
                s.mission.transition(MissionStatus::Running)
            })
            .await?;
        self.persist(next).await?;
        Ok(agent_id.and_then(|id| hierarchy.index_of(&id)))
    }

    fn fallback_agent(&self) -> Option<String> {
        let hierarchy = &self.services.hierarchy;
        self.services
            .config
            .mission
            .default_agent
            .clone()
            .filter(|id| hierarchy.index_of(id).is_some())
            .or_else(|| hierarchy.roles().first().map(|r| r.id.clone()))
    }

    async fn current_agent(&self) -> Option<usize> {
        let s = self.state.read().await;
        s.mission
            .selected_agent
            .as_deref()
            .and_then(|id| self.services.hierarchy.index_of(id))
    }

    /// 轮次边界的暂停：持久化 paused，等待 resume 或 cancel
    async fn suspend(&self) -> Result<()> {
        let already_paused = matches!(
            self.state.read().await.mission.status,
            MissionStatus::Paused { .. }
        );
        if !already_paused {
            let next = self
                .prepare(|s| {
                    s.mission.transition(MissionStatus::Paused {
                        paused_at: Utc::now(),
                    })
                })
                .await?;
            self.persist(next).await?;
        }
        tracing::info!("mission paused");

        if !self.supervisor.wait_for_resume().await {
            return Err(MissionError::Cancelled);
        }
        let next = self
            .prepare(|s| s.mission.transition(MissionStatus::Running))
            .await?;
        self.persist(next).await?;
        tracing::info!("mission resumed");
        Ok(())
    }

    fn begin_iteration(&self, next_sequence: u64) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.next_sequence = next_sequence;
        buffer.steps.clear();
    }

    fn take_steps(&self) -> Vec<ReasoningStep> {
        std::mem::take(&mut self.buffer.lock().unwrap_or_else(|e| e.into_inner()).steps)
    }

    /// 提交一轮迭代：写入步骤与计数，终止结果转为 completed；返回任务是否结束
    async fn advance_iteration(
        &self,
        iteration: u32,
        memory: LoopMemory,
        outcome: IterationOutcome,
    ) -> Result<bool> {
        let steps = self.take_steps();
        let finished = match outcome {
            IterationOutcome::Continue => None,
            IterationOutcome::GoalAchieved { answer, .. } => {
                Some((answer, CompletionOutcome::GoalAchieved))
            }
            IterationOutcome::IterationLimitReached { answer } => {
                Some((answer, CompletionOutcome::IterationLimitReached))
            }
        };

        let committed = steps.clone();
        let completion = finished.clone();
        let next = self
            .prepare(move |s| {
                append_steps(s, committed);
                s.mission.iteration = iteration;
                s.memory = memory;
                s.pending_checkpoint = None;
                if matches!(s.mission.status, MissionStatus::AwaitingCheckpoint { .. }) {
                    s.mission.transition(MissionStatus::Running)?;
                }
                if let Some((answer, outcome)) = completion {
                    s.mission.transition(MissionStatus::Completed {
                        answer,
                        outcome,
                        completed_at: Utc::now(),
                    })?;
                }
                Ok(())
            })
            .await?;
        self.persist(next).await?;
        // 重启后恢复但本轮未走到的检查点
        self.services.checkpoints.withdraw(&self.mission_id);

        for step in steps {
            self.emit(EventPayload::ReasoningStep { step }).await;
        }
        tracing::info!(iteration, "iteration committed");

        match finished {
            Some((answer, outcome)) => {
                tracing::info!(iteration, ?outcome, "mission completed");
                self.emit(EventPayload::MissionCompleted {
                    answer,
                    outcome,
                    iterations: iteration,
                })
                .await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn settle_error(&self, err: MissionError) {
        match RecoveryEngine::new().failure_reason(&err) {
            Some(reason) => self.settle_failed(reason, &err).await,
            None => self.settle_cancelled().await,
        }
    }

    /// 失败：提交本轮已产生的步骤（迭代计数不变），写入失败原因与最后步骤序号
    async fn settle_failed(&self, reason: FailureReason, err: &MissionError) {
        let steps = self.take_steps();
        self.services.checkpoints.withdraw(&self.mission_id);
        let message = reason.to_string();
        tracing::error!(error = %err, %reason, "mission failed");

        let committed = steps.clone();
        let failure = reason.clone();
        let text = message.clone();
        let next = self
            .prepare(move |s| {
                append_steps(s, committed);
                s.pending_checkpoint = None;
                s.memory.state = ReactState::Failed;
                let last_sequence = s.last_sequence();
                s.mission.transition(MissionStatus::Failed {
                    reason: failure,
                    message: text,
                    last_sequence,
                    failed_at: Utc::now(),
                })
            })
            .await;
        let last_sequence = match next {
            Ok(next) => {
                let last = next.last_sequence();
                self.persist_best_effort(next).await;
                last
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to record mission failure");
                self.state.read().await.last_sequence()
            }
        };

        for step in steps {
            self.emit(EventPayload::ReasoningStep { step }).await;
        }
        self.emit(EventPayload::MissionFailed {
            reason,
            message,
            last_sequence,
        })
        .await;
    }

    /// 取消：丢弃本轮未提交的步骤，撤回 pending 检查点
    async fn settle_cancelled(&self) {
        let discarded = self.take_steps().len();
        self.services.checkpoints.withdraw(&self.mission_id);
        let next = self
            .prepare(|s| {
                s.pending_checkpoint = None;
                s.mission.transition(MissionStatus::Cancelled {
                    cancelled_at: Utc::now(),
                })
            })
            .await;
        let iterations = match next {
            Ok(next) => {
                let iterations = next.mission.iteration;
                self.persist_best_effort(next).await;
                iterations
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to record mission cancellation");
                self.state.read().await.mission.iteration
            }
        };
        tracing::info!(iterations, discarded, "mission cancelled");
        self.emit(EventPayload::MissionCancelled { iterations }).await;
    }

    /// 在当前快照的副本上应用修改；熔断计数一并写入
    async fn prepare<F>(&self, f: F) -> Result<MissionStateSnapshot>
    where
        F: FnOnce(&mut MissionStateSnapshot) -> Result<()>,
    {
        let mut next = self.state.read().await.clone();
        f(&mut next)?;
        next.breakers = self.resilience.breakers().snapshot();
        next.mission.updated_at = Utc::now();
        Ok(next)
    }

    /// 先写存储，成功后再替换内存快照
    async fn persist(&self, next: MissionStateSnapshot) -> Result<()> {
        self.services
            .store
            .save(&next)
            .await
            .map_err(|e| MissionError::Persistence(e.to_string()))?;
        *self.state.write().await = next;
        Ok(())
    }

    /// 终态即使写入失败也要对外可见
    async fn persist_best_effort(&self, next: MissionStateSnapshot) {
        if let Err(e) = self.services.store.save(&next).await {
            tracing::error!(error = %e, status = next.mission.status.name(), "failed to persist final snapshot");
        }
        *self.state.write().await = next;
    }

    async fn emit(&self, payload: EventPayload) {
        let sequence = {
            let mut s = self.state.write().await;
            let sequence = s.next_event_sequence;
            s.next_event_sequence += 1;
            sequence
        };
        self.services.events.publish(MissionEvent {
            mission_id: self.mission_id.clone(),
            sequence,
            timestamp: Utc::now(),
            payload,
        });
    }

    /// 找到或登记本次检查点：重启恢复的同类检查点被沿用（包括重跑到达之前已被审核的），
    /// 不同类则撤回后重新登记
    async fn open_checkpoint(&self, kind: CheckpointKind, proposed: Value) -> Result<Checkpoint> {
        let manager = &self.services.checkpoints;
        let restored = self.state.read().await.pending_checkpoint.clone();
        if let Some(restored) = restored.filter(|cp| cp.kind == kind) {
            if let Some(resolved) = manager.get(&restored.id).filter(|cp| cp.status.is_resolved()) {
                tracing::info!(checkpoint_id = %resolved.id, %kind, "restored checkpoint already resolved");
                return Ok(resolved);
            }
        }
        match manager.pending(&self.mission_id) {
            Some(existing) if existing.kind == kind => {
                tracing::info!(checkpoint_id = %existing.id, %kind, "resuming restored checkpoint");
                Ok(existing)
            }
            Some(stale) => {
                tracing::warn!(checkpoint_id = %stale.id, kind = %stale.kind, "withdrawing stale checkpoint");
                manager.withdraw(&self.mission_id);
                manager.raise(&self.mission_id, kind, proposed)
            }
            None => manager.raise(&self.mission_id, kind, proposed),
        }
    }
}

fn append_steps(snapshot: &mut MissionStateSnapshot, steps: Vec<ReasoningStep>) {
    if let Some(last) = steps.last() {
        snapshot.next_step_sequence = last.sequence + 1;
    }
    snapshot.steps.extend(steps);
}

fn feedback_text(feedback: Option<&Value>) -> String {
    match feedback {
        Some(Value::String(s)) => format!(": {s}"),
        Some(other) => format!(": {other}"),
        None => String::new(),
    }
}

#[async_trait]
impl StepHooks for MissionDriver {
    fn cancel_token(&self) -> CancellationToken {
        self.supervisor.cancel_token()
    }

    async fn spend(&self, line: &str, amount: f64) -> Result<()> {
        // 每次外部调用前都会预授权，取消后不再发起新调用
        if self.supervisor.cancel_token().is_cancelled() {
            return Err(MissionError::Cancelled);
        }
        let mut s = self.state.write().await;
        let result = s.mission.budget.spend(line, amount);
        if let Err(e) = &result {
            tracing::warn!(line, amount, remaining = s.mission.budget.remaining(), error = %e, "budget refused");
        }
        result
    }

    async fn approve_tool(&self, descriptor: &ToolDescriptor, params: &Value) -> Result<ToolApproval> {
        let gate = self
            .checkpoint(
                CheckpointKind::ToolExecutionApproval,
                json!({ "tool": descriptor.id, "params": params }),
            )
            .await?;
        Ok(match gate.decision {
            CheckpointDecision::Proceed(content) => {
                let approved = match content.get("params") {
                    Some(p) => p.clone(),
                    None if content.is_object() => content,
                    None => params.clone(),
                };
                ToolApproval::Proceed(approved)
            }
            CheckpointDecision::Reject { feedback } => ToolApproval::Skip(format!(
                "tool execution rejected by reviewer{}",
                feedback_text(feedback.as_ref())
            )),
        })
    }

    async fn on_tool_result(&self, index: usize, call: &ToolCall, result: &ToolResult) -> Result<()> {
        self.emit(EventPayload::ToolResult {
            index,
            call: call.clone(),
            result: result.clone(),
        })
        .await;
        Ok(())
    }
}

#[async_trait]
impl LoopHooks for MissionDriver {
    async fn checkpoint(&self, kind: CheckpointKind, proposed: Value) -> Result<GateOutcome> {
        let checkpoint = self.open_checkpoint(kind, proposed).await?;
        let checkpoint_id = checkpoint.id.clone();

        if checkpoint.is_pending() {
            let pending = checkpoint.clone();
            let next = self
                .prepare(move |s| {
                    s.mission.transition(MissionStatus::AwaitingCheckpoint {
                        checkpoint_id: pending.id.clone(),
                        kind,
                    })?;
                    s.pending_checkpoint = Some(pending);
                    Ok(())
                })
                .await?;
            self.persist(next).await?;
            self.emit(EventPayload::CheckpointReached { checkpoint }).await;
            tracing::info!(%checkpoint_id, %kind, "waiting for reviewer");
        }

        let token = self.supervisor.cancel_token();
        let resolved = self
            .services
            .checkpoints
            .wait(&self.mission_id, &checkpoint_id, &token)
            .await?;

        let record = resolved.clone();
        let next = self
            .prepare(move |s| {
                s.pending_checkpoint = None;
                s.checkpoint_history.push(record);
                if s.mission.status == MissionStatus::Running {
                    return Ok(());
                }
                s.mission.transition(MissionStatus::Running)
            })
            .await?;
        self.persist(next).await?;
        // 已写入快照的历史，管理器不再保留
        self.services.checkpoints.forget(&checkpoint_id);

        let decision = resolved
            .decision(self.policy.auto_approve_on_timeout)
            .ok_or_else(|| MissionError::CheckpointNotFound(checkpoint_id.clone()))?;
        tracing::info!(%checkpoint_id, status = ?resolved.status, "checkpoint finished");
        Ok(GateOutcome {
            checkpoint_id,
            decision,
        })
    }

    fn record_step(&self, iteration: u32, kind: StepKind, content: String, tool_calls: Vec<ToolCall>) {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        let sequence = buffer.next_sequence;
        buffer.next_sequence += 1;
        tracing::debug!(iteration, sequence, ?kind, "reasoning step");
        buffer.steps.push(ReasoningStep {
            sequence,
            iteration,
            kind,
            content,
            tool_calls,
            created_at: Utc::now(),
        });
    }
}
