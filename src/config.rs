//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `HIVE__*` 覆盖（双下划线表示嵌套，如 `HIVE__MISSION__MAX_ITERATIONS=5`）。
//! 所有字段均有默认值，空配置即得到规范中的默认参数。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::agent::AgentRole;
use crate::core::{BreakerConfig, RetryPolicy};
use crate::fusion::FusionWeights;
use crate::hitl::CheckpointKind;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub mission: MissionSection,
    pub fusion: FusionSection,
    pub tools: ToolsSection,
    pub resilience: ResilienceSection,
    pub hitl: HitlSection,
    pub store: StoreSection,
    /// [[agents]]：可被选择 / 委派的智能体角色
    pub agents: Vec<AgentRole>,
}

/// [app] 段：应用名、工作目录（write_artifact 的沙箱根）、工具并发上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    pub workspace_root: Option<PathBuf>,
    pub max_concurrent_tools: usize,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            workspace_root: None,
            max_concurrent_tools: 8,
        }
    }
}

/// [llm] 段：后端选择与每次调用的预算计费
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    /// 每次 LLM 调用计入任务预算的费用（调用前预授权）
    pub call_cost: f64,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            base_url: None,
            call_cost: 0.0,
        }
    }
}

/// [mission] 段：ReAct 上限、完成阈值、默认策略
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MissionSection {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
    pub require_final_review: bool,
    pub auto_approve_on_timeout: bool,
    /// 融合选择无结果时使用的智能体
    pub default_agent: Option<String>,
    /// 事件广播缓冲大小
    pub event_buffer: usize,
}

impl Default for MissionSection {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            confidence_threshold: 0.9,
            require_final_review: false,
            auto_approve_on_timeout: false,
            default_agent: None,
            event_buffer: 256,
        }
    }
}

/// [fusion] 段：RRF 常数与三路权重
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FusionSection {
    pub k: f64,
    pub vector_weight: f64,
    pub graph_weight: f64,
    pub relational_weight: f64,
    pub top_k: usize,
}

impl Default for FusionSection {
    fn default() -> Self {
        Self {
            k: 60.0,
            vector_weight: 0.5,
            graph_weight: 0.3,
            relational_weight: 0.2,
            top_k: 10,
        }
    }
}

impl FusionSection {
    pub fn weights(&self) -> FusionWeights {
        FusionWeights::new(self.vector_weight, self.graph_weight, self.relational_weight)
    }
}

/// [tools] 段：工具链长度与单次调用超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    pub max_chain_length: usize,
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            max_chain_length: 5,
            tool_timeout_secs: 30,
        }
    }
}

/// [resilience] 段：重试与熔断参数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResilienceSection {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub failure_threshold: u32,
    pub recovery_window_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for ResilienceSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5000,
            failure_threshold: 5,
            recovery_window_secs: 30,
            half_open_max_calls: 3,
        }
    }
}

impl ResilienceSection {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }

    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold.max(1),
            recovery_window: Duration::from_secs(self.recovery_window_secs),
            half_open_max_calls: self.half_open_max_calls.max(1),
        }
    }
}

/// [hitl] 段：各类检查点的超时（秒，0 表示无限等待）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HitlSection {
    pub plan_approval_timeout_secs: u64,
    pub tool_execution_approval_timeout_secs: u64,
    pub subagent_approval_timeout_secs: u64,
    pub critical_decision_approval_timeout_secs: u64,
    pub final_review_timeout_secs: u64,
}

impl Default for HitlSection {
    fn default() -> Self {
        Self {
            plan_approval_timeout_secs: 86_400,
            tool_execution_approval_timeout_secs: 3_600,
            subagent_approval_timeout_secs: 3_600,
            critical_decision_approval_timeout_secs: 3_600,
            final_review_timeout_secs: 86_400,
        }
    }
}

impl HitlSection {
    pub fn timeout_for(&self, kind: CheckpointKind) -> Option<Duration> {
        let secs = match kind {
            CheckpointKind::PlanApproval => self.plan_approval_timeout_secs,
            CheckpointKind::ToolExecutionApproval => self.tool_execution_approval_timeout_secs,
            CheckpointKind::SubagentApproval => self.subagent_approval_timeout_secs,
            CheckpointKind::CriticalDecisionApproval => {
                self.critical_decision_approval_timeout_secs
            }
            CheckpointKind::FinalReview => self.final_review_timeout_secs,
        };
        (secs > 0).then(|| Duration::from_secs(secs))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    File,
    Sqlite,
}

/// [store] 段：快照存储后端
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub backend: StoreBackend,
    /// file 后端为目录，sqlite 后端为数据库文件
    pub path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            path: PathBuf::from("data/missions"),
        }
    }
}

/// 从 config 目录加载配置，环境变量 HIVE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 HIVE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("HIVE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.mission.max_iterations, 10);
        assert!((cfg.mission.confidence_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(cfg.tools.max_chain_length, 5);
        assert_eq!(cfg.resilience.max_attempts, 3);
        assert_eq!(cfg.resilience.breaker_config().failure_threshold, 5);
        assert_eq!(cfg.resilience.breaker_config().recovery_window, Duration::from_secs(30));
        assert_eq!(cfg.resilience.breaker_config().half_open_max_calls, 3);
        assert!((cfg.fusion.k - 60.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_timeout_means_wait_forever() {
        let hitl = HitlSection {
            final_review_timeout_secs: 0,
            ..HitlSection::default()
        };
        assert_eq!(hitl.timeout_for(CheckpointKind::FinalReview), None);
        assert_eq!(
            hitl.timeout_for(CheckpointKind::ToolExecutionApproval),
            Some(Duration::from_secs(3_600))
        );
    }

    #[test]
    fn test_load_from_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.toml");
        std::fs::write(
            &path,
            r#"
[mission]
max_iterations = 4

[store]
backend = "sqlite"
path = "missions.db"

[[agents]]
id = "researcher"
name = "Researcher"
level = 3
description = "finds evidence"
tools = ["echo"]
"#,
        )
        .unwrap();
        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.mission.max_iterations, 4);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.agents.len(), 1);
        assert_eq!(cfg.agents[0].level, 3);
        assert_eq!(cfg.tools.max_chain_length, 5);
    }
}
