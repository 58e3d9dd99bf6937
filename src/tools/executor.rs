//! 工具链执行器
//!
//! plan：由 LLM 产出最多 max_chain_length 步的工具链，未知工具丢弃并告警。
//! execute：按计划顺序执行，步骤输入可引用前序输出（见 template）；单步失败只记录，链条继续。
//! 每次调用前依次检查取消、审批有副作用的工具、预算预授权、获取并发许可，再在 "tool:<id>" 依赖标识下
//! 经重试 / 熔断并加超时调用注册表；每次调用输出结构化审计日志（JSON）。
//! synthesize：把成功与失败的结果交给 LLM 综合为一个回答，有失败步骤时总会附加说明；
//! 综合调用不可用时退化为确定性的拼接回答并标记 degraded。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentRole;
use crate::core::{MissionError, ResiliencePolicy, Result, TaskScheduler};
use crate::llm::{complete_stage, parse_json, LlmClient, Stage};
use crate::tools::{resolve_input, Citation, ToolCall, ToolDescriptor, ToolRegistry, ToolResult};

pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 5;
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub tool_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPlan {
    pub steps: Vec<PlannedStep>,
    /// 被丢弃的未知工具名
    #[serde(default)]
    pub dropped: Vec<String>,
}

impl ToolPlan {
    pub fn new(steps: Vec<PlannedStep>) -> Self {
        Self {
            steps,
            dropped: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Deserialize)]
struct RawStep {
    #[serde(alias = "tool_id")]
    tool: String,
    #[serde(default, alias = "args", alias = "params")]
    input: Value,
    #[serde(default)]
    rationale: Option<String>,
}

/// 有副作用的工具在执行前的审批结果
#[derive(Debug, Clone, PartialEq)]
pub enum ToolApproval {
    /// 继续执行；参数可能已被审核者修改
    Proceed(Value),
    /// 跳过该步骤，记录为单步失败
    Skip(String),
}

/// 执行过程中由任务侧提供的钩子：取消、预算、审批与结果记录
#[async_trait]
pub trait StepHooks: Send + Sync {
    fn cancel_token(&self) -> CancellationToken;

    /// 预授权并记账；拒绝时返回 BudgetExceeded 且不记账
    async fn spend(&self, line: &str, amount: f64) -> Result<()>;

    async fn approve_tool(&self, descriptor: &ToolDescriptor, params: &Value)
        -> Result<ToolApproval>;

    async fn on_tool_result(&self, index: usize, call: &ToolCall, result: &ToolResult)
        -> Result<()>;
}

/// 一次链执行中已完成的步骤（按 1 起始的计划位置）；重跑时跳过已完成步骤
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainProgress {
    completed: BTreeMap<usize, ToolResult>,
}

impl ChainProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: usize) -> Option<&ToolResult> {
        self.completed.get(&index)
    }

    pub fn record(&mut self, index: usize, result: ToolResult) {
        self.completed.insert(index, result);
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub index: usize,
    /// 模板已解析后的实际调用
    pub call: ToolCall,
    pub result: ToolResult,
    #[serde(default)]
    pub unresolved: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChainOutcome {
    pub steps: Vec<StepOutcome>,
    pub citations: Vec<Citation>,
    pub total_cost: f64,
    pub total_latency_ms: u64,
}

impl ChainOutcome {
    fn from_steps(steps: Vec<StepOutcome>) -> Self {
        let citations = merge_citations(steps.iter().flat_map(|s| s.result.citations.iter()));
        let total_cost = steps.iter().map(|s| s.result.cost).sum();
        let total_latency_ms = steps.iter().map(|s| s.result.latency_ms).sum();
        Self {
            steps,
            citations,
            total_cost,
            total_latency_ms,
        }
    }

    pub fn failed_steps(&self) -> Vec<&StepOutcome> {
        self.steps.iter().filter(|s| !s.result.success).collect()
    }

    pub fn succeeded(&self) -> usize {
        self.steps.iter().filter(|s| s.result.success).count()
    }
}

/// 按来源去重，保留最高置信度，顺序为首次出现顺序
fn merge_citations<'a>(citations: impl Iterator<Item = &'a Citation>) -> Vec<Citation> {
    let mut merged: Vec<Citation> = Vec::new();
    for c in citations {
        match merged.iter_mut().find(|m| m.source_id == c.source_id) {
            Some(existing) if c.confidence > existing.confidence => *existing = c.clone(),
            Some(_) => {}
            None => merged.push(c.clone()),
        }
    }
    merged
}

/// 综合后的回答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub answer: String,
    pub degraded: bool,
    pub failed_steps: Vec<usize>,
    pub citations: Vec<Citation>,
    pub total_cost: f64,
    pub total_latency_ms: u64,
}

/// 工具链执行器：每个任务一份（共享注册表与并发池，弹性策略按任务划分）
#[derive(Clone)]
pub struct ToolChainExecutor {
    registry: Arc<dyn ToolRegistry>,
    llm: Arc<dyn LlmClient>,
    policy: ResiliencePolicy,
    scheduler: TaskScheduler,
    max_chain_length: usize,
    tool_timeout: Duration,
    llm_call_cost: f64,
}

impl ToolChainExecutor {
    pub fn new(
        registry: Arc<dyn ToolRegistry>,
        llm: Arc<dyn LlmClient>,
        policy: ResiliencePolicy,
        scheduler: TaskScheduler,
    ) -> Self {
        Self {
            registry,
            llm,
            policy,
            scheduler,
            max_chain_length: DEFAULT_MAX_CHAIN_LENGTH,
            tool_timeout: DEFAULT_TOOL_TIMEOUT,
            llm_call_cost: 0.0,
        }
    }

    pub fn with_max_chain_length(mut self, max: usize) -> Self {
        self.max_chain_length = max.max(1);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_llm_call_cost(mut self, cost: f64) -> Self {
        self.llm_call_cost = cost;
        self
    }

    pub fn registry(&self) -> &Arc<dyn ToolRegistry> {
        &self.registry
    }

    /// 当前角色可用的工具
    pub fn available_tools(&self, role: Option<&AgentRole>) -> Vec<ToolDescriptor> {
        self.registry
            .list_tools()
            .into_iter()
            .filter(|d| role.map_or(true, |r| r.allows_tool(&d.id)))
            .collect()
    }

    pub async fn plan(
        &self,
        goal: &str,
        context: &str,
        role: Option<&AgentRole>,
        hooks: &dyn StepHooks,
    ) -> Result<ToolPlan> {
        let tools = self.available_tools(role);
        let catalog: Vec<Value> = tools
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.id,
                    "description": d.description,
                    "parameters": d.parameters,
                })
            })
            .collect();
        let system = format!(
            "You plan tool chains. Available tools:\n{}\n\
             Reply with JSON only: {{\"steps\": [{{\"tool\": \"<name>\", \"input\": {{}}}}]}} \
             with at most {} steps. A step input may reference earlier outputs with \
             {{{{stepN.output.field}}}} or {{{{prev.output}}}}.",
            serde_json::to_string_pretty(&catalog).unwrap_or_else(|_| "[]".to_string()),
            self.max_chain_length
        );
        let user = if context.is_empty() {
            goal.to_string()
        } else {
            format!("{goal}\n\nContext:\n{context}")
        };

        hooks.spend("llm", self.llm_call_cost).await?;
        let raw = complete_stage(self.llm.as_ref(), &self.policy, Stage::Plan, &system, &user).await?;
        let parsed: RawPlan = parse_json(&raw)?;
        Ok(self.accept_plan(parsed, &tools))
    }

    /// 审核者修改后的计划：与 LLM 计划同样过滤未知工具并截断；不是计划形状时返回校验错误
    pub fn plan_from_value(&self, value: Value, role: Option<&AgentRole>) -> Result<ToolPlan> {
        if !value.get("steps").is_some_and(Value::is_array) {
            return Err(MissionError::Validation(format!(
                "modified plan has no steps array: {value}"
            )));
        }
        let parsed: RawPlan = serde_json::from_value(value)
            .map_err(|e| MissionError::Validation(format!("modified plan is invalid: {e}")))?;
        Ok(self.accept_plan(parsed, &self.available_tools(role)))
    }

    fn accept_plan(&self, parsed: RawPlan, tools: &[ToolDescriptor]) -> ToolPlan {
        let mut plan = ToolPlan::default();
        for step in parsed.steps {
            if tools.iter().any(|d| d.id == step.tool) {
                plan.steps.push(PlannedStep {
                    tool_id: step.tool,
                    input: step.input,
                    rationale: step.rationale,
                });
            } else {
                tracing::warn!(tool = %step.tool, "planned tool is not available, dropping step");
                plan.dropped.push(step.tool);
            }
        }
        if plan.steps.len() > self.max_chain_length {
            tracing::warn!(
                planned = plan.steps.len(),
                max = self.max_chain_length,
                "tool chain truncated"
            );
            plan.steps.truncate(self.max_chain_length);
        }
        plan
    }

    pub async fn execute(
        &self,
        plan: &ToolPlan,
        progress: &mut ChainProgress,
        hooks: &dyn StepHooks,
    ) -> Result<ChainOutcome> {
        let cancel = hooks.cancel_token();
        let mut outputs: Vec<Option<Value>> = Vec::with_capacity(plan.steps.len());
        let mut steps = Vec::with_capacity(plan.steps.len());

        for (i, planned) in plan.steps.iter().enumerate() {
            let index = i + 1;
            let resolved = resolve_input(&planned.input, &outputs, index);
            if !resolved.unresolved.is_empty() {
                tracing::warn!(
                    step = index,
                    tool = %planned.tool_id,
                    unresolved = ?resolved.unresolved,
                    "step input references unavailable outputs"
                );
            }
            let call = ToolCall {
                tool_id: planned.tool_id.clone(),
                params: resolved.value,
            };

            let result = match progress.get(index) {
                Some(done) => {
                    tracing::debug!(step = index, tool = %call.tool_id, "step already executed, skipping");
                    done.clone()
                }
                None => {
                    let result = self.run_step(index, &call, &cancel, hooks).await?;
                    progress.record(index, result.clone());
                    hooks.on_tool_result(index, &call, &result).await?;
                    result
                }
            };

            outputs.push(result.success.then(|| result.output.clone()));
            steps.push(StepOutcome {
                index,
                call,
                result,
                unresolved: resolved.unresolved,
            });
        }

        Ok(ChainOutcome::from_steps(steps))
    }

    async fn run_step(
        &self,
        index: usize,
        call: &ToolCall,
        cancel: &CancellationToken,
        hooks: &dyn StepHooks,
    ) -> Result<ToolResult> {
        if cancel.is_cancelled() {
            return Err(MissionError::Cancelled);
        }
        let Some(descriptor) = self.registry.descriptor(&call.tool_id) else {
            let err = MissionError::ToolNotFound(call.tool_id.clone());
            audit(index, &call.tool_id, &call.params, "not_found", 0);
            return Ok(ToolResult::failed(&call.tool_id, err.to_string(), 0));
        };

        let mut params = call.params.clone();
        if descriptor.side_effecting {
            match hooks.approve_tool(&descriptor, &params).await? {
                ToolApproval::Proceed(approved) => params = approved,
                ToolApproval::Skip(reason) => {
                    audit(index, &call.tool_id, &params, "skipped", 0);
                    return Ok(ToolResult::failed(&call.tool_id, reason, 0));
                }
            }
            if cancel.is_cancelled() {
                return Err(MissionError::Cancelled);
            }
        }

        let dependency = format!("tool:{}", descriptor.id);
        hooks.spend(&dependency, descriptor.cost_estimate).await?;
        let _permit = self.scheduler.acquire_tool().await?;

        let start = Instant::now();
        let registry = self.registry.as_ref();
        let timeout = self.tool_timeout;
        let tool_id = descriptor.id.as_str();
        let args = &params;
        let invocation = self.policy.call(&dependency, move || async move {
            match tokio::time::timeout(timeout, registry.invoke(tool_id, args.clone())).await {
                Ok(result) => result,
                Err(_) => Err(MissionError::ToolTimeout(tool_id.to_string())),
            }
        });
        tokio::pin!(invocation);
        let outcome = tokio::select! {
            outcome = &mut invocation => outcome,
            _ = cancel.cancelled() => {
                // 已发出的调用跑完，避免留下半完成的副作用；结果丢弃
                tracing::info!(step = index, tool = tool_id, "cancel requested, waiting for in-flight tool call");
                let _ = invocation.await;
                audit(index, tool_id, &params, "discarded", start.elapsed().as_millis() as u64);
                return Err(MissionError::Cancelled);
            }
        };
        // 取消后才返回的结果直接丢弃
        if cancel.is_cancelled() {
            return Err(MissionError::Cancelled);
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        let result = match outcome {
            Ok(mut result) => {
                result.latency_ms = latency_ms;
                result.cost = descriptor.cost_estimate;
                audit(index, tool_id, &params, "ok", latency_ms);
                result
            }
            Err(e) => {
                let outcome = match e {
                    MissionError::ToolTimeout(_) => "timeout",
                    MissionError::CircuitOpen { .. } => "circuit_open",
                    _ => "error",
                };
                audit(index, tool_id, &params, outcome, latency_ms);
                let mut failed = ToolResult::failed(tool_id, e.to_string(), latency_ms);
                failed.cost = descriptor.cost_estimate;
                failed
            }
        };
        Ok(result)
    }

    pub async fn synthesize(
        &self,
        goal: &str,
        outcome: &ChainOutcome,
        hooks: &dyn StepHooks,
    ) -> Result<Synthesis> {
        let failed = outcome.failed_steps();
        let succeeded: Vec<String> = outcome
            .steps
            .iter()
            .filter(|s| s.result.success)
            .map(|s| format!("step {} ({}): {}", s.index, s.call.tool_id, s.result.output))
            .collect();
        let failures: Vec<String> = failed
            .iter()
            .map(|s| {
                format!(
                    "step {} ({}): {}",
                    s.index,
                    s.call.tool_id,
                    s.result.error.as_deref().unwrap_or("failed")
                )
            })
            .collect();

        let system = "Combine the tool results into one answer for the goal. \
                      Reply with JSON only: {\"answer\": \"...\"}. \
                      Say what could not be determined because of failed steps.";
        let user = format!(
            "{goal}\n\nSuccessful steps:\n{}\n\nFailed steps:\n{}",
            if succeeded.is_empty() { "(none)".to_string() } else { succeeded.join("\n") },
            if failures.is_empty() { "(none)".to_string() } else { failures.join("\n") },
        );

        hooks.spend("llm", self.llm_call_cost).await?;
        let (answer, degraded) =
            match complete_stage(self.llm.as_ref(), &self.policy, Stage::Synthesis, system, &user)
                .await
            {
                Ok(raw) => (parse_answer(&raw), false),
                Err(MissionError::Cancelled) => return Err(MissionError::Cancelled),
                Err(e) => {
                    tracing::warn!(error = %e, "synthesis unavailable, concatenating tool outputs");
                    (concatenate(outcome), true)
                }
            };

        let answer = if failures.is_empty() {
            answer
        } else {
            format!(
                "{answer}\n\nCaveat: {} of {} steps failed and their results are missing: {}",
                failures.len(),
                outcome.steps.len(),
                failures.join("; ")
            )
        };

        Ok(Synthesis {
            answer,
            degraded,
            failed_steps: failed.iter().map(|s| s.index).collect(),
            citations: outcome.citations.clone(),
            total_cost: outcome.total_cost,
            total_latency_ms: outcome.total_latency_ms,
        })
    }
}

fn parse_answer(raw: &str) -> String {
    parse_json::<Value>(raw)
        .ok()
        .and_then(|v| v.get("answer").and_then(|a| a.as_str()).map(str::to_string))
        .unwrap_or_else(|| raw.trim().to_string())
}

fn concatenate(outcome: &ChainOutcome) -> String {
    let parts: Vec<String> = outcome
        .steps
        .iter()
        .filter(|s| s.result.success)
        .map(|s| match &s.result.output {
            Value::String(text) => format!("{}: {}", s.call.tool_id, text),
            other => format!("{}: {}", s.call.tool_id, other),
        })
        .collect();
    if parts.is_empty() {
        "No tool produced a result.".to_string()
    } else {
        parts.join("\n")
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

fn audit(step: usize, tool: &str, args: &Value, outcome: &str, duration_ms: u64) {
    let record = serde_json::json!({
        "event": "tool_audit",
        "step": step,
        "tool": tool,
        "ok": outcome == "ok",
        "outcome": outcome,
        "duration_ms": duration_ms,
        "args_preview": args_preview(args),
    });
    tracing::info!(audit = %record, "tool");
}
