//! 融合选择器：并发查询三路来源，经 ResiliencePolicy 包裹，再做加权 RRF
//!
//! 单路来源失败时降级为空列表并记录在 Selection.degraded 中，其余来源照常融合。

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};

use crate::core::{ResiliencePolicy, Result};
use crate::fusion::{fuse, validate_k, FusionWeights, Modality, RankedItem, RankedLists, RetrievalSource};

/// 一次选择的决策记录（写入任务快照）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub query: String,
    pub items: Vec<RankedItem>,
    pub degraded: Vec<Modality>,
    pub weights: FusionWeights,
    pub k: f64,
}

impl Selection {
    pub fn top(&self) -> Option<&RankedItem> {
        self.items.first()
    }
}

/// 融合选择器：最多三路来源（每种模态一个）
#[derive(Clone)]
pub struct FusionSelector {
    sources: Vec<Arc<dyn RetrievalSource>>,
    weights: FusionWeights,
    k: f64,
    top_k: usize,
}

impl FusionSelector {
    pub fn new(weights: FusionWeights, k: f64, top_k: usize) -> Result<Self> {
        weights.validate()?;
        validate_k(k)?;
        Ok(Self {
            sources: Vec::new(),
            weights,
            k,
            top_k: top_k.max(1),
        })
    }

    /// 注册来源；同一模态重复注册时替换旧来源
    pub fn with_source(mut self, source: Arc<dyn RetrievalSource>) -> Self {
        self.sources.retain(|s| s.modality() != source.modality());
        self.sources.push(source);
        self
    }

    pub fn has_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    pub async fn select(&self, query: &str, policy: &ResiliencePolicy) -> Result<Selection> {
        let top_k = self.top_k;
        let searches = self.sources.iter().map(|source| {
            let source: &dyn RetrievalSource = source.as_ref();
            let dependency = format!("retrieval:{}", source.modality());
            async move {
                let result = policy
                    .call(&dependency, move || source.search(query, top_k))
                    .await;
                (source.modality(), result)
            }
        });

        let mut lists = RankedLists::default();
        let mut degraded = Vec::new();
        for (modality, result) in join_all(searches).await {
            match result {
                Ok(hits) => lists.set(modality, hits),
                Err(e) => {
                    tracing::warn!(%modality, error = %e, "retrieval source degraded to empty list");
                    degraded.push(modality);
                }
            }
        }
        degraded.sort();

        let mut items = fuse(&lists, self.weights, self.k)?;
        items.truncate(self.top_k);
        tracing::debug!(query, candidates = items.len(), "fusion selection finished");
        Ok(Selection {
            query: query.to_string(),
            items,
            degraded,
            weights: self.weights,
            k: self.k,
        })
    }
}
