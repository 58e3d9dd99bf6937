//! Prompt 阶段标签
//!
//! 每个发往 LLM 的 system 消息以 `[stage:<name>]` 开头，便于日志区分，也让脚本化客户端按阶段返回预设输出。

use std::fmt;

use crate::llm::{Message, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// ReAct Thought：决定下一步动作
    Thought,
    /// 工具链规划
    Plan,
    /// 工具链结果综合
    Synthesis,
    /// Reflection：自我评估与置信度
    Reflection,
}

impl Stage {
    pub const ALL: [Stage; 4] = [Stage::Thought, Stage::Plan, Stage::Synthesis, Stage::Reflection];

    pub fn name(&self) -> &'static str {
        match self {
            Stage::Thought => "thought",
            Stage::Plan => "plan",
            Stage::Synthesis => "synthesis",
            Stage::Reflection => "reflection",
        }
    }

    pub fn tag(&self) -> String {
        format!("[stage:{}]", self.name())
    }

    /// 构造带阶段标签的 system 消息
    pub fn system_message(&self, body: &str) -> Message {
        Message::system(format!("{}\n{}", self.tag(), body))
    }

    /// 从消息列表的首条 system 消息识别阶段
    pub fn detect(messages: &[Message]) -> Option<Stage> {
        let system = messages.iter().find(|m| m.role == Role::System)?;
        Stage::ALL
            .into_iter()
            .find(|s| system.content.starts_with(&s.tag()))
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_stage_from_system_message() {
        let messages = vec![
            Stage::Reflection.system_message("critique"),
            Message::user("goal"),
        ];
        assert_eq!(Stage::detect(&messages), Some(Stage::Reflection));
        assert_eq!(Stage::detect(&[Message::user("x")]), None);
    }
}
