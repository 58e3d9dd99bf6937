//! 融合选择：加权 RRF、检索来源接口、并发查询的选择器

pub mod rrf;
pub mod selector;
pub mod source;

pub use rrf::{
    fuse, validate_k, CandidateKind, FusionWeights, Modality, RankedItem, RankedLists,
    SourceHit, SourceScore, DEFAULT_RRF_K,
};
pub use selector::{FusionSelector, Selection};
pub use source::{InMemorySource, RetrievalSource, SourceEntry};
