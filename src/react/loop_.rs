//! ReAct 主循环（单次迭代）
//!
//! Thought -> [critical_decision_approval] -> Action（工具链 / 直接回答 / 子智能体）-> Observation
//! -> Reflection -> Reassess。迭代之间的状态放在 LoopMemory 中，由任务在每轮结束时连同步骤一起持久化。
//! 检查点通过 LoopHooks::checkpoint 阻塞当前迭代，直到审核结束。

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::{AgentHierarchy, AgentRole};
use crate::core::{MissionError, Result};
use crate::hitl::{CheckpointDecision, CheckpointKind};
use crate::react::{Critic, ReactState, StepKind, Thought, ThoughtDecision, ThoughtPlanner};
use crate::tools::{ChainProgress, StepHooks, ToolCall, ToolChainExecutor};

/// 保留在上下文中的最近观察条数
const CONTEXT_OBSERVATIONS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoopSettings {
    pub max_iterations: u32,
    pub confidence_threshold: f64,
    pub require_final_review: bool,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            confidence_threshold: 0.9,
            require_final_review: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerCandidate {
    pub answer: String,
    pub confidence: f64,
    pub iteration: u32,
}

/// 跨迭代的循环状态（随任务快照持久化）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoopMemory {
    pub state: ReactState,
    pub best_answer: Option<AnswerCandidate>,
    /// 首个多步计划已通过 plan_approval
    pub plan_approved: bool,
    /// 审核意见，作为下一轮 Thought 的观察
    pub feedback: Vec<String>,
    pub observations: Vec<String>,
}

/// 检查点结束后的结果
#[derive(Debug, Clone, PartialEq)]
pub struct GateOutcome {
    pub checkpoint_id: String,
    pub decision: CheckpointDecision,
}

/// 循环对任务侧的要求：在 StepHooks 之上增加检查点与步骤记录
#[async_trait]
pub trait LoopHooks: StepHooks {
    async fn checkpoint(&self, kind: CheckpointKind, proposed: Value) -> Result<GateOutcome>;

    fn record_step(&self, iteration: u32, kind: StepKind, content: String, tool_calls: Vec<ToolCall>);
}

#[derive(Debug, Clone, PartialEq)]
pub enum IterationOutcome {
    Continue,
    GoalAchieved { answer: String, confidence: f64 },
    IterationLimitReached { answer: String },
}

/// 一次动作的结果
struct ActionResult {
    candidate: Option<String>,
    observation: String,
}

#[derive(Clone)]
pub struct ReasoningLoop {
    thinker: ThoughtPlanner,
    critic: Critic,
    executor: ToolChainExecutor,
    hierarchy: Arc<AgentHierarchy>,
    settings: LoopSettings,
}

impl ReasoningLoop {
    pub fn new(
        thinker: ThoughtPlanner,
        critic: Critic,
        executor: ToolChainExecutor,
        hierarchy: Arc<AgentHierarchy>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            thinker,
            critic,
            executor,
            hierarchy,
            settings,
        }
    }

    pub fn settings(&self) -> LoopSettings {
        self.settings
    }

    /// 执行第 iteration 轮（从 1 开始）
    pub async fn run_iteration<H: LoopHooks>(
        &self,
        goal: &str,
        iteration: u32,
        agent: Option<usize>,
        memory: &mut LoopMemory,
        hooks: &H,
    ) -> Result<IterationOutcome> {
        let mut state = memory.state;
        if state == ReactState::GoalUnderstood {
            state = state.transition(ReactState::Planning)?;
        }
        state = state.transition(ReactState::Thinking)?;
        let role = agent.and_then(|i| self.hierarchy.role(i));
        tracing::info!(iteration, agent = role.map(|r| r.id.as_str()), "iteration started");

        // Thought
        let context = self.context(goal, role, memory);
        let mut thought = self.thinker.think(&context, hooks).await?;
        hooks.record_step(iteration, StepKind::Thought, thought.summary(), Vec::new());

        // Action
        state = state.transition(ReactState::Acting)?;
        let mut rejected_critical = false;
        if thought.critical {
            let gate = hooks
                .checkpoint(CheckpointKind::CriticalDecisionApproval, thought.to_value())
                .await?;
            match gate.decision {
                CheckpointDecision::Proceed(content) => {
                    thought = Thought::from_value(content)?;
                }
                CheckpointDecision::Reject { feedback } => {
                    rejected_critical = true;
                    memory.feedback.push(format!(
                        "critical decision rejected by reviewer{}",
                        feedback_suffix(feedback.as_ref())
                    ));
                }
            }
        }

        let action = if rejected_critical {
            hooks.record_step(
                iteration,
                StepKind::Action,
                "skipped: critical decision rejected".to_string(),
                Vec::new(),
            );
            ActionResult {
                candidate: None,
                observation: "The reviewer rejected the proposed critical decision.".to_string(),
            }
        } else {
            self.act(goal, &context, iteration, agent, &thought, memory, hooks)
                .await?
        };

        // Observation
        state = state.transition(ReactState::Observing)?;
        hooks.record_step(iteration, StepKind::Observation, action.observation.clone(), Vec::new());
        memory.observations.push(action.observation.clone());
        if memory.observations.len() > CONTEXT_OBSERVATIONS {
            let excess = memory.observations.len() - CONTEXT_OBSERVATIONS;
            memory.observations.drain(..excess);
        }

        // Reflection
        state = state.transition(ReactState::Reflecting)?;
        let reflection = self
            .critic
            .reflect(goal, action.candidate.as_deref(), &action.observation, hooks)
            .await?;
        hooks.record_step(iteration, StepKind::Reflection, reflection.summary(), Vec::new());

        // Reassess
        state = state.transition(ReactState::Reassessing)?;
        if let Some(answer) = &action.candidate {
            let better = memory
                .best_answer
                .as_ref()
                .map_or(true, |b| reflection.confidence >= b.confidence);
            if better {
                memory.best_answer = Some(AnswerCandidate {
                    answer: answer.clone(),
                    confidence: reflection.confidence,
                    iteration,
                });
            }
        }

        if let Some(answer) = action.candidate {
            if reflection.confidence >= self.settings.confidence_threshold {
                if let Some(answer) = self.final_review(answer, memory, hooks).await? {
                    memory.state = state.transition(ReactState::GoalAchieved)?;
                    tracing::info!(iteration, confidence = reflection.confidence, "goal achieved");
                    return Ok(IterationOutcome::GoalAchieved {
                        answer,
                        confidence: reflection.confidence,
                    });
                }
            }
        }

        if iteration >= self.settings.max_iterations {
            memory.state = state.transition(ReactState::IterationLimitReached)?;
            let answer = memory
                .best_answer
                .as_ref()
                .map(|b| b.answer.clone())
                .unwrap_or_else(|| "No answer was produced within the iteration limit.".to_string());
            tracing::info!(iteration, "iteration limit reached");
            return Ok(IterationOutcome::IterationLimitReached { answer });
        }

        memory.state = state;
        Ok(IterationOutcome::Continue)
    }

    /// 需要终审时阻塞等待；返回 None 表示终审被拒，循环继续
    async fn final_review<H: LoopHooks>(
        &self,
        answer: String,
        memory: &mut LoopMemory,
        hooks: &H,
    ) -> Result<Option<String>> {
        if !self.settings.require_final_review {
            return Ok(Some(answer));
        }
        let gate = hooks
            .checkpoint(CheckpointKind::FinalReview, json!({ "answer": answer }))
            .await?;
        match gate.decision {
            CheckpointDecision::Proceed(content) => content
                .get("answer")
                .and_then(|a| a.as_str())
                .or_else(|| content.as_str())
                .map(|a| Some(a.to_string()))
                .ok_or_else(|| {
                    MissionError::Validation(format!("final review content has no answer: {content}"))
                }),
            CheckpointDecision::Reject { feedback } => {
                memory.feedback.push(format!(
                    "final review rejected{}",
                    feedback_suffix(feedback.as_ref())
                ));
                Ok(None)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn act<H: LoopHooks>(
        &self,
        goal: &str,
        context: &str,
        iteration: u32,
        agent: Option<usize>,
        thought: &Thought,
        memory: &mut LoopMemory,
        hooks: &H,
    ) -> Result<ActionResult> {
        let role = agent.and_then(|i| self.hierarchy.role(i));
        match &thought.decision {
            ThoughtDecision::Answer { answer } => {
                hooks.record_step(
                    iteration,
                    StepKind::Action,
                    "answer directly".to_string(),
                    Vec::new(),
                );
                Ok(ActionResult {
                    candidate: Some(answer.clone()),
                    observation: format!("Proposed answer: {answer}"),
                })
            }
            ThoughtDecision::UseTools { objective } => {
                let objective = if objective.is_empty() { goal } else { objective.as_str() };
                self.run_chain(objective, context, iteration, role, true, memory, hooks)
                    .await
            }
            ThoughtDecision::Delegate { task, level } => {
                let task = if task.is_empty() { goal } else { task.as_str() };
                let target = match agent {
                    Some(i) => self
                        .hierarchy
                        .delegate_target(i, *level)
                        .or_else(|| self.hierarchy.escalation_target(i)),
                    None => level
                        .and_then(|l| self.hierarchy.roles().iter().position(|r| r.level == l)),
                };
                let Some(target_role) = target.and_then(|i| self.hierarchy.role(i)) else {
                    hooks.record_step(
                        iteration,
                        StepKind::Action,
                        format!("delegate: {task}"),
                        Vec::new(),
                    );
                    return Ok(ActionResult {
                        candidate: None,
                        observation: "No agent is available to take the sub-task.".to_string(),
                    });
                };

                let gate = hooks
                    .checkpoint(
                        CheckpointKind::SubagentApproval,
                        json!({ "agent": target_role.id, "level": target_role.level, "task": task }),
                    )
                    .await?;
                let task = match gate.decision {
                    CheckpointDecision::Proceed(content) => content
                        .get("task")
                        .and_then(|t| t.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| {
                            MissionError::Validation(format!(
                                "sub-agent approval content has no task: {content}"
                            ))
                        })?,
                    CheckpointDecision::Reject { feedback } => {
                        hooks.record_step(
                            iteration,
                            StepKind::Action,
                            format!("skipped: sub-agent {} rejected", target_role.id),
                            Vec::new(),
                        );
                        return Ok(ActionResult {
                            candidate: None,
                            observation: format!(
                                "Spawning sub-agent {} was rejected by the reviewer{}",
                                target_role.id,
                                feedback_suffix(feedback.as_ref())
                            ),
                        });
                    }
                };
                tracing::info!(agent = %target_role.id, level = target_role.level, "delegating sub-task");
                let sub_context = format!("{task}\n\nDelegated by the mission: {goal}");
                self.run_chain(&task, &sub_context, iteration, Some(target_role), false, memory, hooks)
                    .await
            }
        }
    }

    /// 规划并执行工具链；plan_gate 为 false 时（子智能体）不触发 plan_approval
    #[allow(clippy::too_many_arguments)]
    async fn run_chain<H: LoopHooks>(
        &self,
        objective: &str,
        context: &str,
        iteration: u32,
        role: Option<&AgentRole>,
        plan_gate: bool,
        memory: &mut LoopMemory,
        hooks: &H,
    ) -> Result<ActionResult> {
        let who = role.map(|r| format!(" as {}", r.id)).unwrap_or_default();
        let mut plan = match self.executor.plan(objective, context, role, hooks).await {
            Ok(plan) => plan,
            Err(e) => {
                let observation = absorb(e)?;
                hooks.record_step(
                    iteration,
                    StepKind::Action,
                    format!("plan tools{who}: failed"),
                    Vec::new(),
                );
                return Ok(ActionResult {
                    candidate: None,
                    observation: format!("Planning failed: {observation}"),
                });
            }
        };

        if plan_gate && plan.steps.len() > 1 && !memory.plan_approved {
            let proposed = serde_json::to_value(&plan).unwrap_or(Value::Null);
            let gate = hooks.checkpoint(CheckpointKind::PlanApproval, proposed).await?;
            match gate.decision {
                CheckpointDecision::Proceed(content) => {
                    plan = self.executor.plan_from_value(content, role)?;
                    memory.plan_approved = true;
                }
                CheckpointDecision::Reject { .. } => {
                    return Err(MissionError::CheckpointRejected {
                        kind: CheckpointKind::PlanApproval,
                        checkpoint_id: gate.checkpoint_id,
                    });
                }
            }
        }

        let planned_calls: Vec<ToolCall> = plan
            .steps
            .iter()
            .map(|s| ToolCall {
                tool_id: s.tool_id.clone(),
                params: s.input.clone(),
            })
            .collect();
        let chain = planned_calls
            .iter()
            .map(|c| c.tool_id.as_str())
            .collect::<Vec<_>>()
            .join(" -> ");
        hooks.record_step(
            iteration,
            StepKind::Action,
            format!("run tools{who}: {}", if chain.is_empty() { "(none)" } else { chain.as_str() }),
            planned_calls,
        );

        if plan.is_empty() {
            return Ok(ActionResult {
                candidate: None,
                observation: "No applicable tools were planned.".to_string(),
            });
        }

        let mut progress = ChainProgress::new();
        let outcome = self.executor.execute(&plan, &mut progress, hooks).await?;
        let synthesis = self.executor.synthesize(objective, &outcome, hooks).await?;
        let observation = format!(
            "{} of {} tool steps succeeded{}. Result: {}",
            outcome.succeeded(),
            outcome.steps.len(),
            if synthesis.degraded { " (degraded synthesis)" } else { "" },
            synthesis.answer
        );
        Ok(ActionResult {
            candidate: Some(synthesis.answer),
            observation,
        })
    }

    fn context(&self, goal: &str, role: Option<&AgentRole>, memory: &LoopMemory) -> String {
        let mut context = goal.to_string();
        if let Some(role) = role {
            context.push_str(&format!(
                "\n\nActing agent: {} (L{}): {}",
                role.name, role.level, role.description
            ));
        }
        if !memory.observations.is_empty() {
            context.push_str("\n\nPrevious observations:");
            for o in &memory.observations {
                context.push_str(&format!("\n- {o}"));
            }
        }
        if !memory.feedback.is_empty() {
            context.push_str("\n\nReviewer feedback:");
            for f in &memory.feedback {
                context.push_str(&format!("\n- {f}"));
            }
        }
        if let Some(best) = &memory.best_answer {
            context.push_str(&format!(
                "\n\nBest answer so far (confidence {:.2}): {}",
                best.confidence, best.answer
            ));
        }
        context
    }
}

fn feedback_suffix(feedback: Option<&Value>) -> String {
    match feedback {
        Some(Value::String(s)) => format!(": {s}"),
        Some(Value::Null) | None => String::new(),
        Some(other) => format!(": {other}"),
    }
}

/// 动作阶段的组件级错误转为观察；取消、预算、持久化等任务级错误继续上抛
fn absorb(err: MissionError) -> Result<String> {
    match err {
        MissionError::Cancelled
        | MissionError::BudgetExceeded { .. }
        | MissionError::Persistence(_)
        | MissionError::CheckpointAlreadyPending { .. }
        | MissionError::InvalidTransition { .. } => Err(err),
        other => Ok(other.to_string()),
    }
}
