//! Hive - 无头任务执行入口
//!
//! 初始化日志与配置，恢复存储中未完成的任务，再以命令行目标创建新任务。
//! 事件以 JSON 行输出到 stdout；`--auto-approve` 时自动批准所有检查点；Ctrl+C 取消正在跟踪的任务。
//!
//! 用法: hive [--config <file>] [--tenant <id>] [--budget <amount>] [--auto-approve] <goal...>

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context};
use hive::config::load_config;
use hive::hitl::ReviewAction;
use hive::mission::MissionStatus;
use hive::react::EventPayload;
use hive::{observability, AgentSelectionMode, MissionEngine};
use tokio::sync::broadcast::error::RecvError;

struct CliArgs {
    config: Option<PathBuf>,
    tenant: String,
    budget: f64,
    auto_approve: bool,
    goal: Option<String>,
}

impl CliArgs {
    fn parse(args: impl Iterator<Item = String>) -> anyhow::Result<Self> {
        let mut parsed = Self {
            config: None,
            tenant: "local".to_string(),
            budget: 10.0,
            auto_approve: false,
            goal: None,
        };
        let mut words = Vec::new();
        let mut args = args;
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--auto-approve" => parsed.auto_approve = true,
                "--config" => {
                    parsed.config = Some(PathBuf::from(args.next().context("--config needs a path")?))
                }
                "--tenant" => parsed.tenant = args.next().context("--tenant needs a value")?,
                "--budget" => {
                    parsed.budget = args
                        .next()
                        .context("--budget needs a value")?
                        .parse()
                        .context("--budget must be a number")?
                }
                flag if flag.starts_with("--") => bail!("unknown option {flag}"),
                _ => words.push(arg),
            }
        }
        if !words.is_empty() {
            parsed.goal = Some(words.join(" "));
        }
        Ok(parsed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let args = CliArgs::parse(std::env::args().skip(1))?;
    let config = load_config(args.config.clone()).context("Failed to load config")?;
    let engine = MissionEngine::from_config(config)
        .await
        .context("Failed to build mission engine")?;

    // 先订阅，避免错过恢复任务的早期事件
    let mut events = engine.subscribe();
    let mut watched = HashSet::new();
    for mission_id in engine.recover().await.context("Failed to recover missions")? {
        // 暂停的任务保持暂停，不阻塞本次运行
        if matches!(
            engine.get_status(&mission_id).await?.mission.status,
            MissionStatus::Paused { .. }
        ) {
            tracing::info!(%mission_id, "recovered mission stays paused");
            continue;
        }
        watched.insert(mission_id);
    }
    if !watched.is_empty() {
        tracing::info!(count = watched.len(), "recovered unfinished missions");
    }

    if let Some(goal) = &args.goal {
        let mission_id = engine
            .create_mission(goal, &args.tenant, AgentSelectionMode::Auto, args.budget)
            .await
            .context("Failed to create mission")?;
        watched.insert(mission_id);
    }
    if watched.is_empty() {
        eprintln!("usage: hive [--config <file>] [--tenant <id>] [--budget <amount>] [--auto-approve] <goal...>");
        return Ok(());
    }

    let tracked: Vec<String> = watched.iter().cloned().collect();
    while !watched.is_empty() {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    println!("{}", serde_json::to_string(&event)?);
                    if let EventPayload::CheckpointReached { checkpoint } = &event.payload {
                        if args.auto_approve {
                            engine
                                .resolve_checkpoint_as(
                                    &checkpoint.mission_id,
                                    &checkpoint.id,
                                    ReviewAction::Approve,
                                    None,
                                    "cli",
                                )
                                .await
                                .context("Failed to approve checkpoint")?;
                        } else {
                            tracing::warn!(
                                checkpoint_id = %checkpoint.id,
                                kind = %checkpoint.kind,
                                "checkpoint waiting for review; run with --auto-approve to approve automatically"
                            );
                        }
                    }
                    if event.payload.is_terminal() {
                        watched.remove(&event.mission_id);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, cancelling missions");
                for mission_id in &watched {
                    if let Err(e) = engine.cancel(mission_id).await {
                        tracing::warn!(%mission_id, error = %e, "cancel failed");
                    }
                }
                for mission_id in &watched {
                    engine.wait_until_finished(mission_id).await?;
                }
                break;
            }
        }
    }

    for mission_id in &tracked {
        let snapshot = engine.get_status(mission_id).await?;
        tracing::info!(
            %mission_id,
            status = snapshot.mission.status.name(),
            iterations = snapshot.mission.iteration,
            spent = snapshot.mission.budget.spent,
            "mission finished"
        );
    }
    Ok(())
}
