//! 任务引擎：生命周期 API 与检查点 API 的入口
//!
//! MissionServices 在启动时构建一次（LLM、工具注册表、融合选择器、层级、检查点管理器、存储、事件总线、工具并发池），
//! 以 Arc 传入每个任务 task。引擎只持有各任务的句柄：快照的只读视图、监管信号、task 句柄与结束通知。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::agent::{default_roles, AgentHierarchy};
use crate::config::AppConfig;
use crate::core::{MissionError, MissionSupervisor, Result, TaskScheduler};
use crate::fusion::{FusionSelector, InMemorySource, Modality};
use crate::hitl::{Checkpoint, CheckpointManager, ReviewAction};
use crate::llm::{create_llm_from_config, LlmClient};
use crate::mission::driver::MissionDriver;
use crate::mission::{
    open_store, AgentSelectionMode, BudgetLedger, Mission, MissionPolicy, MissionStateSnapshot,
    MissionStatus, SnapshotStore,
};
use crate::react::{EventBus, MissionEvent};
use crate::tools::{builtin_registry, ToolRegistry};

/// 进程级共享的服务句柄
pub struct MissionServices {
    pub config: AppConfig,
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<dyn ToolRegistry>,
    pub fusion: FusionSelector,
    pub hierarchy: Arc<AgentHierarchy>,
    pub checkpoints: Arc<CheckpointManager>,
    pub store: Arc<dyn SnapshotStore>,
    pub events: EventBus,
    pub scheduler: TaskScheduler,
}

impl MissionServices {
    /// 以配置构建其余服务：层级取 [[agents]]（为空时用内置角色），三路来源由角色构建
    pub fn new(
        config: AppConfig,
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolRegistry>,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self> {
        let roles = if config.agents.is_empty() {
            default_roles()
        } else {
            config.agents.clone()
        };
        let hierarchy = AgentHierarchy::new(roles)?;
        let fusion = FusionSelector::new(config.fusion.weights(), config.fusion.k, config.fusion.top_k)?
            .with_source(Arc::new(InMemorySource::from_roles(Modality::Vector, hierarchy.roles())))
            .with_source(Arc::new(
                InMemorySource::from_roles(Modality::Graph, hierarchy.roles()).with_prior_weight(0.5),
            ))
            .with_source(Arc::new(
                InMemorySource::from_roles(Modality::Relational, hierarchy.roles())
                    .with_prior_weight(0.8),
            ));

        Ok(Self {
            checkpoints: Arc::new(CheckpointManager::new(config.hitl.clone())),
            events: EventBus::new(config.mission.event_buffer),
            scheduler: TaskScheduler::new(config.app.max_concurrent_tools),
            hierarchy: Arc::new(hierarchy),
            fusion,
            llm,
            tools,
            store,
            config,
        })
    }

    /// 全部依赖取自配置：LLM 后端、内置工具（workspace_root 为沙箱根）、[store] 后端
    pub async fn from_config(config: AppConfig) -> Result<Self> {
        let llm = create_llm_from_config(&config);
        let workspace = config
            .app
            .workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("workspace"));
        let tools: Arc<dyn ToolRegistry> = Arc::new(builtin_registry(workspace));
        let store = open_store(&config.store).await?;
        Self::new(config, llm, tools, store)
    }

    pub fn with_fusion(mut self, fusion: FusionSelector) -> Self {
        self.fusion = fusion;
        self
    }
}

/// 创建任务的参数；policy 为空时使用 [mission] 默认策略
#[derive(Debug, Clone)]
pub struct MissionRequest {
    pub goal: String,
    pub tenant_id: String,
    pub selection_mode: AgentSelectionMode,
    pub budget_limit: f64,
    pub policy: Option<MissionPolicy>,
}

impl MissionRequest {
    pub fn new(goal: impl Into<String>, tenant_id: impl Into<String>, budget_limit: f64) -> Self {
        Self {
            goal: goal.into(),
            tenant_id: tenant_id.into(),
            selection_mode: AgentSelectionMode::Auto,
            budget_limit,
            policy: None,
        }
    }

    pub fn with_selection(mut self, mode: AgentSelectionMode) -> Self {
        self.selection_mode = mode;
        self
    }

    pub fn with_policy(mut self, policy: MissionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }
}

struct MissionHandle {
    state: Arc<RwLock<MissionStateSnapshot>>,
    supervisor: MissionSupervisor,
    task: JoinHandle<()>,
    done: watch::Receiver<bool>,
}

type HandleMap = Arc<Mutex<HashMap<String, MissionHandle>>>;

pub struct MissionEngine {
    services: Arc<MissionServices>,
    /// 仅包含仍在运行的任务；结束的任务由 task 自行移除，之后从存储读取
    handles: HandleMap,
}

impl MissionEngine {
    pub fn new(services: MissionServices) -> Self {
        Self {
            services: Arc::new(services),
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub async fn from_config(config: AppConfig) -> Result<Self> {
        Ok(Self::new(MissionServices::from_config(config).await?))
    }

    pub fn services(&self) -> &Arc<MissionServices> {
        &self.services
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, MissionHandle>> {
        lock_handles(&self.handles)
    }

    pub async fn create_mission(
        &self,
        goal: &str,
        tenant_id: &str,
        selection_mode: AgentSelectionMode,
        budget_limit: f64,
    ) -> Result<String> {
        self.create_mission_with(
            MissionRequest::new(goal, tenant_id, budget_limit).with_selection(selection_mode),
        )
        .await
    }

    /// 校验、持久化 draft 快照，然后启动任务 task
    pub async fn create_mission_with(&self, request: MissionRequest) -> Result<String> {
        if request.goal.trim().is_empty() {
            return Err(MissionError::Validation("goal must not be empty".to_string()));
        }
        if request.tenant_id.trim().is_empty() {
            return Err(MissionError::Validation("tenant_id must not be empty".to_string()));
        }
        if let AgentSelectionMode::Fixed { agent_id } = &request.selection_mode {
            if self.services.hierarchy.index_of(agent_id).is_none() {
                return Err(MissionError::Validation(format!("unknown agent {agent_id}")));
            }
        }
        let policy = request
            .policy
            .unwrap_or_else(|| MissionPolicy::from(&self.services.config.mission));
        policy.validate()?;
        let budget = BudgetLedger::new(request.budget_limit)?;

        let mission = Mission::new(
            request.tenant_id,
            request.goal,
            request.selection_mode,
            budget,
            policy,
        );
        let snapshot = MissionStateSnapshot::new(mission);
        self.services.store.save(&snapshot).await?;
        let mission_id = snapshot.id().to_string();
        tracing::info!(%mission_id, tenant_id = %snapshot.mission.tenant_id, "mission created");
        self.spawn(snapshot, false);
        Ok(mission_id)
    }

    fn spawn(&self, snapshot: MissionStateSnapshot, paused: bool) {
        let mission_id = snapshot.id().to_string();
        let supervisor = MissionSupervisor::new();
        if paused {
            supervisor.request_pause();
        }
        let (done_tx, done_rx) = watch::channel(false);
        let state = Arc::new(RwLock::new(snapshot.clone()));
        let driver = MissionDriver::new(
            self.services.clone(),
            &snapshot,
            state.clone(),
            supervisor.clone(),
            done_tx,
        );
        let span = tracing::info_span!("mission", mission_id = %mission_id);

        // 持锁完成 spawn 与登记，task 结束时的移除一定发生在登记之后
        let mut handles = self.handles();
        let registry = Arc::clone(&self.handles);
        let own_state = state.clone();
        let id = mission_id.clone();
        let task = tokio::spawn(
            async move {
                driver.run().await;
                let mut handles = lock_handles(&registry);
                if handles
                    .get(&id)
                    .is_some_and(|h| Arc::ptr_eq(&h.state, &own_state))
                {
                    handles.remove(&id);
                    tracing::debug!("mission handle released");
                }
            }
            .instrument(span),
        );
        handles.insert(
            mission_id,
            MissionHandle {
                state,
                supervisor,
                task,
                done: done_rx,
            },
        );
    }

    /// 本进程中仍在运行的任务
    pub fn active_missions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.handles().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn live_state(&self, mission_id: &str) -> Option<(Arc<RwLock<MissionStateSnapshot>>, MissionSupervisor)> {
        self.handles()
            .get(mission_id)
            .map(|h| (h.state.clone(), h.supervisor.clone()))
    }

    /// 仅 running 可暂停；在当前迭代结束后生效
    pub async fn pause(&self, mission_id: &str) -> Result<()> {
        let (state, supervisor) = self.require_live(mission_id).await?;
        let status = state.read().await.mission.status.clone();
        if status != MissionStatus::Running || supervisor.is_paused() {
            return Err(MissionError::InvalidTransition {
                from: status.name().to_string(),
                to: "paused".to_string(),
            });
        }
        supervisor.request_pause();
        tracing::info!(mission_id, "pause requested");
        Ok(())
    }

    pub async fn resume(&self, mission_id: &str) -> Result<()> {
        let (state, supervisor) = self.require_live(mission_id).await?;
        let status = state.read().await.mission.status.clone();
        let pending_pause = status == MissionStatus::Running && supervisor.is_paused();
        if !matches!(status, MissionStatus::Paused { .. }) && !pending_pause {
            return Err(MissionError::InvalidTransition {
                from: status.name().to_string(),
                to: "running".to_string(),
            });
        }
        supervisor.request_resume();
        tracing::info!(mission_id, "resume requested");
        Ok(())
    }

    /// 协作式取消：在轮次开始、每次工具调用前、检查点等待与暂停中生效
    pub async fn cancel(&self, mission_id: &str) -> Result<()> {
        if let Some((state, supervisor)) = self.live_state(mission_id) {
            let status = state.read().await.mission.status.clone();
            if status.is_terminal() {
                return Err(MissionError::InvalidTransition {
                    from: status.name().to_string(),
                    to: "cancelled".to_string(),
                });
            }
            supervisor.cancel();
            tracing::info!(mission_id, "cancel requested");
            return Ok(());
        }

        // 未在本进程运行（尚未 recover）的任务直接在存储中标记
        let mut snapshot = self
            .services
            .store
            .load(mission_id)
            .await?
            .ok_or_else(|| MissionError::MissionNotFound(mission_id.to_string()))?;
        snapshot.mission.transition(MissionStatus::Cancelled {
            cancelled_at: Utc::now(),
        })?;
        snapshot.pending_checkpoint = None;
        self.services.store.save(&snapshot).await?;
        tracing::info!(mission_id, "dormant mission cancelled");
        Ok(())
    }

    /// 运行中的任务读内存快照，否则读存储
    pub async fn get_status(&self, mission_id: &str) -> Result<MissionStateSnapshot> {
        if let Some((state, _)) = self.live_state(mission_id) {
            return Ok(state.read().await.clone());
        }
        self.services
            .store
            .load(mission_id)
            .await?
            .ok_or_else(|| MissionError::MissionNotFound(mission_id.to_string()))
    }

    pub async fn list_missions(&self) -> Result<Vec<MissionStateSnapshot>> {
        let mut all = self.services.store.list().await?;
        for snapshot in all.iter_mut() {
            if let Some((state, _)) = self.live_state(snapshot.id()) {
                *snapshot = state.read().await.clone();
            }
        }
        Ok(all)
    }

    pub async fn resolve_checkpoint(
        &self,
        mission_id: &str,
        checkpoint_id: &str,
        action: ReviewAction,
        modification: Option<Value>,
    ) -> Result<Checkpoint> {
        self.resolve_checkpoint_as(mission_id, checkpoint_id, action, modification, "reviewer")
            .await
    }

    pub async fn resolve_checkpoint_as(
        &self,
        mission_id: &str,
        checkpoint_id: &str,
        action: ReviewAction,
        modification: Option<Value>,
        reviewer: &str,
    ) -> Result<Checkpoint> {
        if self.live_state(mission_id).is_none() {
            return Err(MissionError::MissionNotFound(mission_id.to_string()));
        }
        self.services
            .checkpoints
            .resolve(mission_id, checkpoint_id, action, modification, reviewer)
    }

    /// 订阅之后的事件（不回放）
    pub fn subscribe(&self) -> broadcast::Receiver<MissionEvent> {
        self.services.events.subscribe()
    }

    /// 等待任务 task 结束，返回最终快照
    pub async fn wait_until_finished(&self, mission_id: &str) -> Result<MissionStateSnapshot> {
        let done = self.handles().get(mission_id).map(|h| h.done.clone());
        if let Some(mut done) = done {
            // 发送端随 task 中止而关闭时同样返回
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.get_status(mission_id).await
    }

    /// 启动时重新加载所有非终态任务；paused 保持暂停，pending 检查点重新登记
    pub async fn recover(&self) -> Result<Vec<String>> {
        let mut recovered = Vec::new();
        for snapshot in self.services.store.list().await? {
            if snapshot.is_terminal() || self.live_state(snapshot.id()).is_some() {
                continue;
            }
            if let Some(checkpoint) = snapshot.pending_checkpoint.clone() {
                self.services.checkpoints.restore(checkpoint)?;
            }
            let paused = matches!(snapshot.mission.status, MissionStatus::Paused { .. });
            tracing::info!(
                mission_id = %snapshot.id(),
                status = snapshot.mission.status.name(),
                iteration = snapshot.mission.iteration,
                "recovering mission"
            );
            recovered.push(snapshot.id().to_string());
            self.spawn(snapshot, paused);
        }
        Ok(recovered)
    }

    /// 立即中止所有任务 task，不写入任何状态
    pub fn abort_all(&self) {
        let handles: Vec<(String, MissionHandle)> = self.handles().drain().collect();
        for (mission_id, handle) in handles {
            handle.task.abort();
            self.services.checkpoints.withdraw(&mission_id);
            tracing::warn!(%mission_id, "mission task aborted");
        }
    }

    async fn require_live(&self, mission_id: &str) -> Result<(Arc<RwLock<MissionStateSnapshot>>, MissionSupervisor)> {
        if let Some(live) = self.live_state(mission_id) {
            return Ok(live);
        }
        match self.services.store.load(mission_id).await? {
            Some(snapshot) => Err(MissionError::InvalidTransition {
                from: snapshot.mission.status.name().to_string(),
                to: "running".to_string(),
            }),
            None => Err(MissionError::MissionNotFound(mission_id.to_string())),
        }
    }
}

fn lock_handles(handles: &Mutex<HashMap<String, MissionHandle>>) -> std::sync::MutexGuard<'_, HashMap<String, MissionHandle>> {
    handles.lock().unwrap_or_else(|e| e.into_inner())
}
