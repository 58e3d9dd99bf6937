//! 任务生命周期集成测试：ReAct 终止条件、检查点阻塞、拒绝、超时与修改、预算、取消、暂停恢复

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hive::core::FailureReason;
use hive::hitl::{CheckpointKind, CheckpointStatus, ReviewAction};
use hive::llm::{ScriptedLlmClient, Stage};
use hive::mission::{MemoryStore, MissionPolicy, MissionStatus};
use hive::react::{CompletionOutcome, EventPayload, StepKind};
use hive::tools::{EchoTool, LocalToolRegistry};
use hive::{AgentSelectionMode, MissionRequest};
use serde_json::json;

fn coordinator() -> AgentSelectionMode {
    AgentSelectionMode::Fixed {
        agent_id: "coordinator".to_string(),
    }
}

fn echo_tools() -> LocalToolRegistry {
    LocalToolRegistry::new().with_tool(EchoTool)
}

/// 两步 echo 计划：会触发 plan_approval
fn two_step_plan() -> serde_json::Value {
    plan(json!([
        { "tool": "echo", "input": { "text": "a" } },
        { "tool": "echo", "input": { "text": "b" } }
    ]))
}

#[tokio::test]
async fn test_terminates_when_confidence_reaches_threshold() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, answer("draft one"))
            .push_json(Stage::Thought, answer("draft two"))
            .push_json(Stage::Thought, answer("final"))
            .push_json(Stage::Reflection, reflection(0.4))
            .push_json(Stage::Reflection, reflection(0.6))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let engine = memory_engine(llm.clone(), echo_tools());
    let mut events = engine.subscribe();

    let id = engine
        .create_mission("What is 6 x 7?", "tenant-a", AgentSelectionMode::Auto, 5.0)
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    match &snapshot.mission.status {
        MissionStatus::Completed {
            answer, outcome, ..
        } => {
            assert_eq!(answer, "final");
            assert_eq!(*outcome, CompletionOutcome::GoalAchieved);
        }
        other => panic!("unexpected status {other}"),
    }
    assert_eq!(snapshot.mission.iteration, 3);
    assert_eq!(llm.call_count(Stage::Thought), 3);
    assert!(snapshot.selection.is_some());
    assert!(snapshot.mission.selected_agent.is_some());

    // 每轮 thought / action / observation / reflection，序号连续
    assert_eq!(snapshot.steps.len(), 12);
    for (i, step) in snapshot.steps.iter().enumerate() {
        assert_eq!(step.sequence, i as u64 + 1);
        assert_eq!(step.iteration, i as u32 / 4 + 1);
    }
    assert_eq!(snapshot.steps[0].kind, StepKind::Thought);
    assert_eq!(snapshot.steps[11].kind, StepKind::Reflection);

    let received = collect_until_terminal(&mut events, &id).await;
    let sequences: Vec<u64> = received.iter().map(|e| e.sequence).collect();
    assert!(sequences.windows(2).all(|w| w[0] < w[1]));
    assert!(matches!(
        received.last().unwrap().payload,
        EventPayload::MissionCompleted { iterations: 3, .. }
    ));
}

#[tokio::test]
async fn test_iteration_limit_completes_with_best_answer() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, answer("weak"))
            .push_json(Stage::Thought, answer("better"))
            .push_json(Stage::Reflection, reflection(0.3))
            .push_json(Stage::Reflection, reflection(0.5)),
    );
    let engine = memory_engine(llm, echo_tools());
    let policy = MissionPolicy {
        max_iterations: 2,
        ..MissionPolicy::default()
    };

    let id = engine
        .create_mission_with(MissionRequest::new("hard question", "tenant-a", 5.0).with_policy(policy))
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    match &snapshot.mission.status {
        MissionStatus::Completed {
            answer, outcome, ..
        } => {
            assert_eq!(answer, "better");
            assert_eq!(*outcome, CompletionOutcome::IterationLimitReached);
        }
        other => panic!("unexpected status {other}"),
    }
    assert_eq!(snapshot.mission.iteration, 2);
}

#[tokio::test]
async fn test_plan_checkpoint_blocks_until_approved() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("gather"))
            .push_json(Stage::Plan, two_step_plan())
            .push_json(Stage::Synthesis, json!({ "answer": "done" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let engine = memory_engine(llm.clone(), echo_tools());
    let id = engine
        .create_mission("collect a and b", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| {
        matches!(s.mission.status, MissionStatus::AwaitingCheckpoint { .. })
    })
    .await;
    let checkpoint = waiting.pending_checkpoint.clone().unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::PlanApproval);
    assert_eq!(waiting.mission.iteration, 0);

    // 审核之前不会继续执行
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(llm.call_count(Stage::Synthesis), 0);
    assert!(matches!(
        engine.get_status(&id).await.unwrap().mission.status,
        MissionStatus::AwaitingCheckpoint { .. }
    ));

    engine
        .resolve_checkpoint(&id, &checkpoint.id, ReviewAction::Approve, None)
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
    assert_eq!(snapshot.mission.iteration, 1);
    assert!(snapshot.pending_checkpoint.is_none());
    assert_eq!(snapshot.checkpoint_history.len(), 1);
    assert_eq!(snapshot.checkpoint_history[0].id, checkpoint.id);
}

#[tokio::test]
async fn test_plan_rejection_fails_mission() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("gather"))
            .push_json(Stage::Plan, two_step_plan()),
    );
    let engine = memory_engine(llm, echo_tools());
    let id = engine
        .create_mission("collect a and b", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    let checkpoint_id = waiting.pending_checkpoint.unwrap().id;
    engine
        .resolve_checkpoint(&id, &checkpoint_id, ReviewAction::Reject, Some(json!("too broad")))
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    match &snapshot.mission.status {
        MissionStatus::Failed {
            reason,
            message,
            last_sequence,
            ..
        } => {
            assert_eq!(message, "plan rejected by reviewer");
            assert_eq!(
                *reason,
                FailureReason::PlanRejected {
                    checkpoint_id: checkpoint_id.clone()
                }
            );
            // 只有本轮的 thought 被记录
            assert_eq!(*last_sequence, 1);
        }
        other => panic!("unexpected status {other}"),
    }
    assert!(snapshot.pending_checkpoint.is_none());
}

#[tokio::test]
async fn test_budget_refusal_fails_mission() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("echo it"))
            .push_json(Stage::Plan, plan(json!([{ "tool": "echo", "input": { "text": "x" } }]))),
    );
    let mut config = test_config();
    config.llm.call_cost = 0.4;
    let engine = engine(
        config,
        llm.clone(),
        echo_tools(),
        Arc::new(hive::mission::MemoryStore::new()),
    );

    let id = engine
        .create_mission("echo x", "tenant-a", coordinator(), 1.0)
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    match &snapshot.mission.status {
        MissionStatus::Failed {
            reason, message, ..
        } => {
            assert_eq!(message, "budget exceeded");
            match reason {
                FailureReason::BudgetExceeded { line, spent, .. } => {
                    assert_eq!(line, "llm");
                    assert!((spent - 0.8).abs() < 1e-9);
                }
                other => panic!("unexpected reason {other:?}"),
            }
        }
        other => panic!("unexpected status {other}"),
    }
    // 被拒绝的综合调用没有发出
    assert_eq!(llm.call_count(Stage::Synthesis), 0);
    assert!((snapshot.mission.budget.spent - 0.8).abs() < 1e-9);
    assert!(snapshot.mission.budget.spent <= snapshot.mission.budget.limit);
}

#[tokio::test]
async fn test_cancel_while_awaiting_checkpoint() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("gather"))
            .push_json(Stage::Plan, two_step_plan()),
    );
    let engine = memory_engine(llm, echo_tools());
    let mut events = engine.subscribe();
    let id = engine
        .create_mission("collect a and b", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    engine.cancel(&id).await.unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    assert!(matches!(snapshot.mission.status, MissionStatus::Cancelled { .. }));
    assert!(snapshot.pending_checkpoint.is_none());
    assert!(engine.services().checkpoints.pending(&id).is_none());
    // 未提交的本轮步骤被丢弃
    assert!(snapshot.steps.is_empty());

    let received = collect_until_terminal(&mut events, &id).await;
    assert!(matches!(
        received.last().unwrap().payload,
        EventPayload::MissionCancelled { iterations: 0 }
    ));

    // 终态不可再取消
    assert!(engine.cancel(&id).await.is_err());
}

#[tokio::test]
async fn test_pause_takes_effect_at_iteration_boundary() {
    let scripted = ScriptedLlmClient::new()
        .push_json(Stage::Thought, answer("first"))
        .push_json(Stage::Thought, answer("second"))
        .push_json(Stage::Reflection, reflection(0.4))
        .push_json(Stage::Reflection, reflection(0.95));
    let llm = Arc::new(GatedLlm::new(scripted, 0));
    let engine = memory_engine(llm.clone(), echo_tools());
    let id = engine
        .create_mission("two rounds", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    wait_for(&engine, &id, |s| s.mission.status == MissionStatus::Running).await;
    engine.pause(&id).await.unwrap();
    // 已请求暂停时不能重复暂停
    assert!(engine.pause(&id).await.is_err());

    // 放行正在进行的第一轮，它结束后任务挂起
    llm.release(1);
    let paused = wait_for(&engine, &id, |s| {
        matches!(s.mission.status, MissionStatus::Paused { .. })
    })
    .await;
    assert_eq!(paused.mission.iteration, 1);

    llm.release(5);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(llm.inner.call_count(Stage::Thought), 1);

    engine.resume(&id).await.unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();
    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
    assert_eq!(snapshot.mission.iteration, 2);
    assert!(engine.resume(&id).await.is_err());
}

#[tokio::test]
async fn test_create_rejects_invalid_requests() {
    let engine = memory_engine(Arc::new(ScriptedLlmClient::new()), echo_tools());
    assert!(engine
        .create_mission("  ", "tenant-a", AgentSelectionMode::Auto, 1.0)
        .await
        .is_err());
    assert!(engine
        .create_mission("goal", "tenant-a", AgentSelectionMode::Auto, -1.0)
        .await
        .is_err());
    let unknown = AgentSelectionMode::Fixed {
        agent_id: "ghost".to_string(),
    };
    assert!(engine.create_mission("goal", "tenant-a", unknown, 1.0).await.is_err());
    assert!(engine.get_status("m-missing").await.is_err());
}

#[tokio::test]
async fn test_plan_approval_timeout_fails_mission() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("gather"))
            .push_json(Stage::Plan, two_step_plan()),
    );
    let mut config = test_config();
    config.hitl.plan_approval_timeout_secs = 1;
    let engine = engine(config, llm.clone(), echo_tools(), Arc::new(MemoryStore::new()));

    let id = engine
        .create_mission("collect a and b", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    match &snapshot.mission.status {
        MissionStatus::Failed {
            reason, message, ..
        } => {
            assert_eq!(message, "plan rejected by reviewer");
            assert!(matches!(reason, FailureReason::PlanRejected { .. }));
        }
        other => panic!("unexpected status {other}"),
    }
    assert_eq!(snapshot.checkpoint_history.len(), 1);
    assert_eq!(snapshot.checkpoint_history[0].status, CheckpointStatus::TimedOut);
    assert_eq!(llm.call_count(Stage::Synthesis), 0);
}

#[tokio::test]
async fn test_auto_approve_on_timeout_runs_to_completion() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("gather"))
            .push_json(Stage::Plan, two_step_plan())
            .push_json(Stage::Synthesis, json!({ "answer": "done" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let mut config = test_config();
    config.hitl.plan_approval_timeout_secs = 1;
    config.hitl.final_review_timeout_secs = 1;
    let engine = engine(config, llm, echo_tools(), Arc::new(MemoryStore::new()));
    let policy = MissionPolicy {
        require_final_review: true,
        auto_approve_on_timeout: true,
        ..MissionPolicy::default()
    };

    let id = engine
        .create_mission_with(
            MissionRequest::new("collect a and b", "tenant-a", 5.0)
                .with_selection(coordinator())
                .with_policy(policy),
        )
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    match &snapshot.mission.status {
        MissionStatus::Completed { answer, .. } => assert_eq!(answer, "done"),
        other => panic!("unexpected status {other}"),
    }
    let kinds: Vec<CheckpointKind> = snapshot.checkpoint_history.iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![CheckpointKind::PlanApproval, CheckpointKind::FinalReview]);
    assert!(snapshot
        .checkpoint_history
        .iter()
        .all(|c| c.status == CheckpointStatus::TimedOut));
}

#[tokio::test]
async fn test_final_review_modification_replaces_answer() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, answer("draft"))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let engine = memory_engine(llm, echo_tools());
    let policy = MissionPolicy {
        require_final_review: true,
        ..MissionPolicy::default()
    };
    let id = engine
        .create_mission_with(
            MissionRequest::new("write a headline", "tenant-a", 5.0)
                .with_selection(coordinator())
                .with_policy(policy),
        )
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    let checkpoint = waiting.pending_checkpoint.unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::FinalReview);
    assert_eq!(checkpoint.proposed["answer"], "draft");
    engine
        .resolve_checkpoint(&id, &checkpoint.id, ReviewAction::Modify, Some(json!({ "answer": "edited" })))
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    match &snapshot.mission.status {
        MissionStatus::Completed { answer, .. } => assert_eq!(answer, "edited"),
        other => panic!("unexpected status {other}"),
    }
}

#[tokio::test]
async fn test_subagent_modification_replaces_task() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(
                Stage::Thought,
                json!({ "thought": "split it", "action": "delegate", "task": "dig", "level": 3 }),
            )
            .push_json(Stage::Plan, plan(json!([{ "tool": "echo", "input": { "text": "deeper" } }])))
            .push_json(Stage::Synthesis, json!({ "answer": "dug" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let engine = memory_engine(llm.clone(), echo_tools());
    let id = engine
        .create_mission("find the root cause", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    let checkpoint = waiting.pending_checkpoint.unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::SubagentApproval);
    assert_eq!(checkpoint.proposed["agent"], "researcher");
    assert_eq!(checkpoint.proposed["task"], "dig");
    engine
        .resolve_checkpoint(
            &id,
            &checkpoint.id,
            ReviewAction::Modify,
            Some(json!({ "agent": "researcher", "task": "dig deeper" })),
        )
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
    let plan_calls = llm.calls(Stage::Plan);
    assert_eq!(plan_calls.len(), 1);
    let request = &plan_calls[0].messages.last().unwrap().content;
    assert!(request.starts_with("dig deeper"), "{request}");
}

#[tokio::test]
async fn test_finished_mission_releases_handle() {
    let engine = memory_engine(Arc::new(ScriptedLlmClient::new()), echo_tools());
    let id = engine
        .create_mission("quick question", "tenant-a", AgentSelectionMode::Auto, 5.0)
        .await
        .unwrap();
    engine.wait_until_finished(&id).await.unwrap();

    for _ in 0..100 {
        if engine.active_missions().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.active_missions().is_empty());

    // 结束后从存储读取
    let snapshot = engine.get_status(&id).await.unwrap();
    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
    assert!(engine.cancel(&id).await.is_err());
}
