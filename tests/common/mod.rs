//! 集成测试公共工具：脚本化 LLM、可阻塞 Thought 的 LLM、测试工具与自动审核

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hive::config::AppConfig;
use hive::hitl::ReviewAction;
use hive::llm::{LlmClient, Message, ScriptedLlmClient, Stage};
use hive::mission::{MemoryStore, MissionStateSnapshot, SnapshotStore};
use hive::react::{EventPayload, MissionEvent};
use hive::tools::{LocalToolRegistry, Tool, ToolOutput};
use hive::{MissionEngine, MissionServices};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Semaphore};

/// 毫秒级退避，测试不必等待
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.resilience.base_delay_ms = 1;
    config.resilience.max_delay_ms = 5;
    config
}

pub fn engine(
    config: AppConfig,
    llm: Arc<dyn LlmClient>,
    tools: LocalToolRegistry,
    store: Arc<dyn SnapshotStore>,
) -> Arc<MissionEngine> {
    let services = MissionServices::new(config, llm, Arc::new(tools), store).unwrap();
    Arc::new(MissionEngine::new(services))
}

pub fn memory_engine(llm: Arc<dyn LlmClient>, tools: LocalToolRegistry) -> Arc<MissionEngine> {
    engine(test_config(), llm, tools, Arc::new(MemoryStore::new()))
}

pub fn answer(text: &str) -> Value {
    json!({ "thought": "I can answer now", "action": "answer", "answer": text })
}

pub fn use_tools(objective: &str) -> Value {
    json!({ "thought": "tools are needed", "action": "use_tools", "objective": objective })
}

pub fn reflection(confidence: f64) -> Value {
    json!({ "critique": format!("confidence {confidence}"), "confidence": confidence, "issues": [] })
}

pub fn plan(steps: Value) -> Value {
    json!({ "steps": steps })
}

/// 自动批准收到的所有检查点
pub fn spawn_auto_approver(engine: Arc<MissionEngine>) -> tokio::task::JoinHandle<()> {
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let EventPayload::CheckpointReached { checkpoint } = event.payload {
                let _ = engine
                    .resolve_checkpoint(
                        &checkpoint.mission_id,
                        &checkpoint.id,
                        ReviewAction::Approve,
                        None,
                    )
                    .await;
            }
        }
    })
}

/// 轮询直到快照满足条件（最多约 5 秒）
pub async fn wait_for<F>(engine: &MissionEngine, mission_id: &str, mut predicate: F) -> MissionStateSnapshot
where
    F: FnMut(&MissionStateSnapshot) -> bool,
{
    for _ in 0..500 {
        let snapshot = engine.get_status(mission_id).await.unwrap();
        if predicate(&snapshot) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("mission {mission_id} did not reach the expected state");
}

/// 收集某任务直到终止事件为止的所有事件
pub async fn collect_until_terminal(
    rx: &mut broadcast::Receiver<MissionEvent>,
    mission_id: &str,
) -> Vec<MissionEvent> {
    let mut events = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        if event.mission_id != mission_id {
            continue;
        }
        let terminal = event.payload.is_terminal();
        events.push(event);
        if terminal {
            return events;
        }
    }
}

/// Thought 调用需要先取得许可；其余阶段直接转发给脚本化客户端
pub struct GatedLlm {
    pub inner: ScriptedLlmClient,
    thoughts: Semaphore,
}

impl GatedLlm {
    pub fn new(inner: ScriptedLlmClient, permits: usize) -> Self {
        Self {
            inner,
            thoughts: Semaphore::new(permits),
        }
    }

    pub fn release(&self, thoughts: usize) {
        self.thoughts.add_permits(thoughts);
    }
}

#[async_trait]
impl LlmClient for GatedLlm {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        if Stage::detect(messages) == Some(Stage::Thought) {
            self.thoughts
                .acquire()
                .await
                .map_err(|e| e.to_string())?
                .forget();
        }
        self.inner.complete(messages).await
    }
}

/// 固定返回 {"city": "Paris"}
pub struct LookupTool;

#[async_trait]
impl Tool for LookupTool {
    fn name(&self) -> &str {
        "lookup"
    }

    fn description(&self) -> &str {
        "Look up the capital city"
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
        Ok(ToolOutput::new(json!({ "city": "Paris" })))
    }
}

/// 总是失败并计数
#[derive(Clone, Default)]
pub struct FailingTool {
    pub calls: Arc<AtomicUsize>,
}

impl FailingTool {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        "broken"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err("upstream returned 500".to_string())
    }
}

/// 每次调用睡眠一段时间，记录开始与完成次数
#[derive(Clone)]
pub struct SlowTool {
    delay: Duration,
    pub started: Arc<AtomicUsize>,
    pub finished: Arc<AtomicUsize>,
}

impl SlowTool {
    pub fn new(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            started: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        "slow"
    }

    fn description(&self) -> &str {
        "Sleeps before answering"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutput::new(args))
    }
}
