//! 任务层：数据模型、预算、快照存储、任务驱动与引擎

pub mod budget;
mod driver;
pub mod engine;
pub mod store;
pub mod types;

pub use budget::BudgetLedger;
pub use engine::{MissionEngine, MissionRequest, MissionServices};
pub use store::{open_store, FileStore, MemoryStore, SnapshotStore, SqliteStore};
pub use types::{
    AgentSelectionMode, Mission, MissionPolicy, MissionStateSnapshot, MissionStatus,
};
