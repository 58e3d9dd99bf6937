//! 工具链集成测试：输出引用、部分失败、熔断、审核修改计划、调用中取消

mod common;

use std::sync::Arc;

use common::*;
use hive::core::BreakerState;
use hive::hitl::{CheckpointKind, CheckpointStatus, ReviewAction};
use hive::llm::{ScriptedLlmClient, Stage};
use hive::mission::MissionStatus;
use hive::react::EventPayload;
use hive::tools::{EchoTool, LocalToolRegistry, WriteArtifactTool};
use hive::AgentSelectionMode;
use serde_json::json;
use std::time::Duration;

fn coordinator() -> AgentSelectionMode {
    AgentSelectionMode::Fixed {
        agent_id: "coordinator".to_string(),
    }
}

fn tool_results(events: &[hive::react::MissionEvent]) -> Vec<(usize, hive::tools::ToolResult)> {
    events
        .iter()
        .filter_map(|e| match &e.payload {
            EventPayload::ToolResult { index, result, .. } => Some((*index, result.clone())),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_step_input_references_earlier_output() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("find the capital"))
            .push_json(
                Stage::Plan,
                plan(json!([
                    { "tool": "lookup", "input": {} },
                    { "tool": "echo", "input": { "text": "{{step1.output.city}}" } }
                ])),
            )
            .push_json(Stage::Synthesis, json!({ "answer": "The capital is Paris" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let tools = LocalToolRegistry::new().with_tool(EchoTool).with_tool(LookupTool);
    let engine = memory_engine(llm, tools);
    let mut events = engine.subscribe();
    let approver = spawn_auto_approver(engine.clone());

    let id = engine
        .create_mission("capital of France", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();
    let received = collect_until_terminal(&mut events, &id).await;
    let snapshot = engine.wait_until_finished(&id).await.unwrap();
    approver.abort();

    let results = tool_results(&received);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, 1);
    assert_eq!(results[0].1.output, json!({ "city": "Paris" }));
    assert_eq!(results[1].0, 2);
    assert_eq!(results[1].1.output, json!({ "text": "Paris" }));

    match &snapshot.mission.status {
        MissionStatus::Completed { answer, .. } => assert_eq!(answer, "The capital is Paris"),
        other => panic!("unexpected status {other}"),
    }
    // 多步计划经过 plan_approval
    assert_eq!(snapshot.checkpoint_history.len(), 1);
    assert!(snapshot.memory.plan_approved);
}

#[tokio::test]
async fn test_failed_step_does_not_abort_chain() {
    let broken = FailingTool::default();
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("collect"))
            .push_json(
                Stage::Plan,
                plan(json!([
                    { "tool": "echo", "input": { "text": "one" } },
                    { "tool": "broken", "input": {} },
                    { "tool": "echo", "input": { "text": "three" } }
                ])),
            )
            .push_json(Stage::Synthesis, json!({ "answer": "partial result" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let tools = LocalToolRegistry::new()
        .with_tool(EchoTool)
        .with_tool(broken.clone());
    let engine = memory_engine(llm, tools);
    let mut events = engine.subscribe();
    let approver = spawn_auto_approver(engine.clone());

    let id = engine
        .create_mission("collect three things", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();
    let received = collect_until_terminal(&mut events, &id).await;
    let snapshot = engine.wait_until_finished(&id).await.unwrap();
    approver.abort();

    let results = tool_results(&received);
    assert_eq!(results.len(), 3);
    assert!(results[0].1.success);
    assert!(!results[1].1.success);
    assert!(results[2].1.success);
    // 工具自身的失败不重试
    assert_eq!(broken.calls(), 1);

    match &snapshot.mission.status {
        MissionStatus::Completed { answer, .. } => {
            assert!(answer.starts_with("partial result"));
            assert!(answer.contains("Caveat: 1 of 3 steps failed"));
        }
        other => panic!("unexpected status {other}"),
    }
}

#[tokio::test]
async fn test_breaker_opens_and_is_persisted() {
    let broken = FailingTool::default();
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("hammer"))
            .push_json(
                Stage::Plan,
                plan(json!([
                    { "tool": "broken", "input": {} },
                    { "tool": "broken", "input": {} },
                    { "tool": "broken", "input": {} }
                ])),
            )
            .push_json(Stage::Synthesis, json!({ "answer": "nothing worked" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let mut config = test_config();
    config.resilience.failure_threshold = 2;
    let engine = engine(
        config,
        llm,
        LocalToolRegistry::new().with_tool(broken.clone()),
        Arc::new(hive::mission::MemoryStore::new()),
    );
    let mut events = engine.subscribe();
    let approver = spawn_auto_approver(engine.clone());

    let id = engine
        .create_mission("call the broken tool", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();
    let received = collect_until_terminal(&mut events, &id).await;
    let snapshot = engine.wait_until_finished(&id).await.unwrap();
    approver.abort();

    // 第三次调用被熔断器拦下，没有到达工具
    assert_eq!(broken.calls(), 2);
    let results = tool_results(&received);
    assert_eq!(results.len(), 3);
    let third = results[2].1.error.clone().unwrap();
    assert!(third.contains("Circuit open"), "{third}");

    let breaker = snapshot.breakers.get("tool:broken").unwrap();
    assert_eq!(breaker.state, BreakerState::Open);
    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
}

#[tokio::test]
async fn test_side_effecting_tool_waits_for_approval() {
    let workspace = tempfile::tempdir().unwrap();
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("write the report"))
            .push_json(
                Stage::Plan,
                plan(json!([{
                    "tool": "write_artifact",
                    "input": { "path": "draft.md", "content": "first draft" }
                }])),
            )
            .push_json(Stage::Synthesis, json!({ "answer": "report written" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let tools = LocalToolRegistry::new().with_tool(WriteArtifactTool::new(workspace.path()));
    let engine = memory_engine(llm, tools);
    let id = engine
        .create_mission("write a report", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    let checkpoint = waiting.pending_checkpoint.unwrap();
    assert_eq!(checkpoint.kind, CheckpointKind::ToolExecutionApproval);
    assert_eq!(checkpoint.proposed["tool"], "write_artifact");
    assert!(!workspace.path().join("draft.md").exists());

    engine
        .resolve_checkpoint(
            &id,
            &checkpoint.id,
            ReviewAction::Modify,
            Some(json!({ "params": { "path": "final.md", "content": "reviewed" } })),
        )
        .await
        .unwrap();
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
    assert!(!workspace.path().join("draft.md").exists());
    let written = std::fs::read_to_string(workspace.path().join("final.md")).unwrap();
    assert_eq!(written, "reviewed");
}

#[tokio::test]
async fn test_rejected_tool_is_recorded_as_failed_step() {
    let workspace = tempfile::tempdir().unwrap();
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("write the report"))
            .push_json(
                Stage::Plan,
                plan(json!([{
                    "tool": "write_artifact",
                    "input": { "path": "draft.md", "content": "first draft" }
                }])),
            )
            .push_json(Stage::Synthesis, json!({ "answer": "could not write" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let tools = LocalToolRegistry::new().with_tool(WriteArtifactTool::new(workspace.path()));
    let engine = memory_engine(llm, tools);
    let mut events = engine.subscribe();
    let id = engine
        .create_mission("write a report", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    let checkpoint_id = waiting.pending_checkpoint.unwrap().id;
    engine
        .resolve_checkpoint(&id, &checkpoint_id, ReviewAction::Reject, None)
        .await
        .unwrap();
    let received = collect_until_terminal(&mut events, &id).await;
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    let results = tool_results(&received);
    assert_eq!(results.len(), 1);
    assert!(!results[0].1.success);
    assert!(results[0]
        .1
        .error
        .as_deref()
        .unwrap()
        .starts_with("tool execution rejected by reviewer"));
    assert!(!workspace.path().join("draft.md").exists());
    // 单个工具被拒不会让任务失败
    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
}

fn two_echo_plan() -> serde_json::Value {
    plan(json!([
        { "tool": "echo", "input": { "text": "a" } },
        { "tool": "echo", "input": { "text": "b" } }
    ]))
}

#[tokio::test]
async fn test_modified_plan_replaces_proposal() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("collect"))
            .push_json(Stage::Plan, two_echo_plan())
            .push_json(Stage::Synthesis, json!({ "answer": "only one" }))
            .push_json(Stage::Reflection, reflection(0.95)),
    );
    let engine = memory_engine(llm, LocalToolRegistry::new().with_tool(EchoTool));
    let mut events = engine.subscribe();
    let id = engine
        .create_mission("collect a and b", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    let checkpoint_id = waiting.pending_checkpoint.unwrap().id;
    // 审核者沿用规划器的 {"tool": ...} 形状
    engine
        .resolve_checkpoint(
            &id,
            &checkpoint_id,
            ReviewAction::Modify,
            Some(json!({ "steps": [{ "tool": "echo", "input": { "text": "ONLY" } }] })),
        )
        .await
        .unwrap();
    let received = collect_until_terminal(&mut events, &id).await;
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    let results = tool_results(&received);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].1.output, json!({ "text": "ONLY" }));
    assert_eq!(snapshot.checkpoint_history[0].status, CheckpointStatus::Modified);
    assert!(matches!(snapshot.mission.status, MissionStatus::Completed { .. }));
}

#[tokio::test]
async fn test_unusable_plan_modification_fails_mission() {
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("collect"))
            .push_json(Stage::Plan, two_echo_plan()),
    );
    let engine = memory_engine(llm.clone(), LocalToolRegistry::new().with_tool(EchoTool));
    let mut events = engine.subscribe();
    let id = engine
        .create_mission("collect a and b", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    let waiting = wait_for(&engine, &id, |s| s.pending_checkpoint.is_some()).await;
    let checkpoint_id = waiting.pending_checkpoint.unwrap().id;
    engine
        .resolve_checkpoint(&id, &checkpoint_id, ReviewAction::Modify, Some(json!({ "answer": "skip it" })))
        .await
        .unwrap();
    let received = collect_until_terminal(&mut events, &id).await;
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    // 原计划不会被悄悄执行
    assert!(tool_results(&received).is_empty());
    assert_eq!(llm.call_count(Stage::Synthesis), 0);
    match &snapshot.mission.status {
        MissionStatus::Failed { message, .. } => assert!(message.contains("modified plan"), "{message}"),
        other => panic!("unexpected status {other}"),
    }
}

#[tokio::test]
async fn test_cancel_waits_for_in_flight_tool() {
    let slow = SlowTool::new(200);
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .push_json(Stage::Thought, use_tools("slow work"))
            .push_json(Stage::Plan, plan(json!([{ "tool": "slow", "input": { "n": 1 } }]))),
    );
    let engine = memory_engine(llm.clone(), LocalToolRegistry::new().with_tool(slow.clone()));
    let mut events = engine.subscribe();
    let id = engine
        .create_mission("do slow work", "tenant-a", coordinator(), 5.0)
        .await
        .unwrap();

    for _ in 0..200 {
        if slow.started() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(slow.started(), 1);
    engine.cancel(&id).await.unwrap();

    let received = collect_until_terminal(&mut events, &id).await;
    let snapshot = engine.wait_until_finished(&id).await.unwrap();

    // 调用跑完后任务才结束，结果丢弃
    assert_eq!(slow.finished(), 1);
    assert!(tool_results(&received).is_empty());
    assert!(matches!(snapshot.mission.status, MissionStatus::Cancelled { .. }));
    assert!(snapshot.steps.is_empty());
    assert_eq!(llm.call_count(Stage::Synthesis), 0);
    assert_eq!(llm.call_count(Stage::Reflection), 0);
}
