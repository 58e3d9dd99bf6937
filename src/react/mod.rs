//! 推理层：ReAct 状态机、Thought、Reflection、单次迭代循环与任务事件

pub mod critic;
pub mod events;
pub mod loop_;
pub mod planner;
pub mod state;

pub use critic::{Critic, Reflection};
pub use events::{EventBus, EventPayload, MissionEvent};
pub use loop_::{
    AnswerCandidate, GateOutcome, IterationOutcome, LoopHooks, LoopMemory, LoopSettings,
    ReasoningLoop,
};
pub use planner::{parse_thought, Thought, ThoughtDecision, ThoughtPlanner};
pub use state::{CompletionOutcome, ReactState, ReasoningStep, StepKind};
