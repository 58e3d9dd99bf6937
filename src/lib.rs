//! Hive - Rust 自主任务执行引擎
//!
//! 模块划分：
//! - **agent**: 智能体角色与 L1–L5 层级（委派 / 升级）
//! - **config**: 应用配置加载（TOML + 环境变量 HIVE__*）
//! - **core**: 错误与恢复、重试与熔断、任务监管、工具并发池
//! - **fusion**: 向量 / 图 / 关系三路来源的加权 RRF 融合选择
//! - **hitl**: 人工检查点（审批、超时、恢复）
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）
//! - **mission**: 任务模型、预算、快照存储、任务引擎
//! - **observability**: 日志初始化
//! - **react**: Thought / Reflection、ReAct 迭代与事件
//! - **tools**: 工具注册表、内置工具与工具链执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod fusion;
pub mod hitl;
pub mod llm;
pub mod mission;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{MissionError, Result};
pub use mission::{AgentSelectionMode, MissionEngine, MissionRequest, MissionServices};
