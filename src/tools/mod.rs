//! 工具层：注册表接口与本地实现、内置工具、输入模板、工具链执行器

pub mod artifact;
pub mod echo;
pub mod executor;
pub mod registry;
pub mod template;

use std::path::Path;

pub use artifact::WriteArtifactTool;
pub use echo::EchoTool;
pub use executor::{
    ChainOutcome, ChainProgress, PlannedStep, StepHooks, StepOutcome, Synthesis, ToolApproval,
    ToolChainExecutor, ToolPlan, DEFAULT_MAX_CHAIN_LENGTH, DEFAULT_TOOL_TIMEOUT,
};
pub use registry::{
    Citation, LocalToolRegistry, Tool, ToolCall, ToolDescriptor, ToolOutput, ToolRegistry,
    ToolResult,
};
pub use template::{resolve_input, ResolvedInput};

/// 内置工具：echo 与以 workspace 为沙箱根的 write_artifact
pub fn builtin_registry(workspace: impl AsRef<Path>) -> LocalToolRegistry {
    LocalToolRegistry::new()
        .with_tool(EchoTool)
        .with_tool(WriteArtifactTool::new(workspace))
}
