//! LLM 层：客户端抽象与实现（OpenAI 兼容 / Mock / Scripted）、消息与阶段标签

pub mod message;
pub mod mock;
pub mod openai;
pub mod parse;
pub mod stage;
pub mod traits;

use std::sync::Arc;

pub use message::{Message, Role};
pub use mock::{MockLlmClient, RecordedCall, ScriptedLlmClient, ScriptedReply};
pub use openai::{OpenAiClient, TokenUsage};
pub use parse::{extract_json, parse_json};
pub use stage::Stage;
pub use traits::LlmClient;

use crate::config::AppConfig;
use crate::core::{MissionError, ResiliencePolicy, Result};

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let api_key = std::env::var("OPENAI_API_KEY").ok();
    if provider != "mock" && api_key.is_some() {
        tracing::info!(model = %cfg.llm.model, "Using OpenAI-compatible LLM");
        Arc::new(OpenAiClient::new(
            cfg.llm.base_url.as_deref(),
            &cfg.llm.model,
            api_key.as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider is mock, using Mock LLM");
        Arc::new(MockLlmClient)
    }
}

/// 以阶段标签组装消息，并在 "llm" 依赖标识下经重试 / 熔断调用
///
/// 提供方错误一律视为瞬时错误，由 ResiliencePolicy 决定是否重试。
pub async fn complete_stage(
    llm: &dyn LlmClient,
    policy: &ResiliencePolicy,
    stage: Stage,
    system: &str,
    user: &str,
) -> Result<String> {
    let messages = vec![stage.system_message(system), Message::user(user)];
    let messages = messages.as_slice();
    tracing::debug!(%stage, "llm call");
    policy
        .call("llm", move || async move {
            llm.complete(messages)
                .await
                .map_err(|e| MissionError::transient("llm", e))
        })
        .await
}
