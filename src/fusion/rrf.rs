//! 加权 RRF（Reciprocal Rank Fusion）
//!
//! 每个候选在来源 s 的排名 r（从 1 开始）贡献 `weight_s / (k + r)`，跨来源求和后降序排列，
//! 分数相同时按候选 id 升序，保证结果确定。纯计算，无 I/O，只会因输入不合法而失败。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{MissionError, Result};

pub const DEFAULT_RRF_K: f64 = 60.0;

/// 三路检索来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    Vector,
    Graph,
    Relational,
}

impl Modality {
    pub const ALL: [Modality; 3] = [Modality::Vector, Modality::Graph, Modality::Relational];

    pub fn name(&self) -> &'static str {
        match self {
            Modality::Vector => "vector",
            Modality::Graph => "graph",
            Modality::Relational => "relational",
        }
    }

    fn index(&self) -> usize {
        match self {
            Modality::Vector => 0,
            Modality::Graph => 1,
            Modality::Relational => 2,
        }
    }
}

impl std::fmt::Display for Modality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    #[default]
    Agent,
    Document,
    Evidence,
}

/// 单个来源返回的一条结果（列表顺序即排名）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceHit {
    pub id: String,
    pub score: f64,
    #[serde(default)]
    pub kind: CandidateKind,
    #[serde(default)]
    pub label: Option<String>,
}

impl SourceHit {
    pub fn new(id: impl Into<String>, score: f64) -> Self {
        Self {
            id: id.into(),
            score,
            kind: CandidateKind::Agent,
            label: None,
        }
    }

    pub fn with_kind(mut self, kind: CandidateKind) -> Self {
        self.kind = kind;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SourceScore {
    pub rank: usize,
    pub score: f64,
}

/// 融合后的候选：保留各来源的排名与原始分数
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedItem {
    pub id: String,
    pub kind: CandidateKind,
    pub label: Option<String>,
    pub vector: Option<SourceScore>,
    pub graph: Option<SourceScore>,
    pub relational: Option<SourceScore>,
    pub fused_score: f64,
}

impl RankedItem {
    fn empty(hit: &SourceHit) -> Self {
        Self {
            id: hit.id.clone(),
            kind: hit.kind,
            label: hit.label.clone(),
            vector: None,
            graph: None,
            relational: None,
            fused_score: 0.0,
        }
    }

    fn slot(&mut self, modality: Modality) -> &mut Option<SourceScore> {
        match modality {
            Modality::Vector => &mut self.vector,
            Modality::Graph => &mut self.graph,
            Modality::Relational => &mut self.relational,
        }
    }
}

/// 三路权重，无需和为 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    pub vector: f64,
    pub graph: f64,
    pub relational: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self::new(0.5, 0.3, 0.2)
    }
}

impl FusionWeights {
    pub fn new(vector: f64, graph: f64, relational: f64) -> Self {
        Self {
            vector,
            graph,
            relational,
        }
    }

    fn as_array(&self) -> [f64; 3] {
        [self.vector, self.graph, self.relational]
    }

    pub fn validate(&self) -> Result<()> {
        for (w, m) in self.as_array().into_iter().zip(Modality::ALL) {
            if !w.is_finite() || w < 0.0 {
                return Err(MissionError::Validation(format!(
                    "fusion weight for {m} must be a non-negative number, got {w}"
                )));
            }
        }
        Ok(())
    }

    /// 实际参与计算的权重：两路及以上非零时按和归一化；全零时退化为仅向量（1, 0, 0）
    pub fn effective(&self) -> [f64; 3] {
        let raw = self.as_array();
        let non_zero = raw.iter().filter(|w| **w > 0.0).count();
        match non_zero {
            0 => [1.0, 0.0, 0.0],
            1 => raw,
            _ => {
                let sum: f64 = raw.iter().sum();
                raw.map(|w| w / sum)
            }
        }
    }
}

/// 三路排名列表（任一可为空）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedLists {
    pub vector: Vec<SourceHit>,
    pub graph: Vec<SourceHit>,
    pub relational: Vec<SourceHit>,
}

impl RankedLists {
    pub fn list(&self, modality: Modality) -> &[SourceHit] {
        match modality {
            Modality::Vector => &self.vector,
            Modality::Graph => &self.graph,
            Modality::Relational => &self.relational,
        }
    }

    pub fn set(&mut self, modality: Modality, hits: Vec<SourceHit>) {
        match modality {
            Modality::Vector => self.vector = hits,
            Modality::Graph => self.graph = hits,
            Modality::Relational => self.relational = hits,
        }
    }
}

pub fn validate_k(k: f64) -> Result<()> {
    if !k.is_finite() || k <= 0.0 {
        return Err(MissionError::Validation(format!(
            "RRF constant k must be positive, got {k}"
        )));
    }
    Ok(())
}

/// 加权 RRF 融合
pub fn fuse(lists: &RankedLists, weights: FusionWeights, k: f64) -> Result<Vec<RankedItem>> {
    weights.validate()?;
    validate_k(k)?;

    let mut effective = weights.effective();
    let populated: Vec<Modality> = Modality::ALL
        .into_iter()
        .filter(|m| !lists.list(*m).is_empty())
        .collect();
    // 只有一路有结果且其权重为 0 时，仍按该路排名输出（保持排名的恒等变换）
    if let [only] = populated.as_slice() {
        if effective[only.index()] == 0.0 {
            effective[only.index()] = 1.0;
        }
    }

    let mut fused: BTreeMap<String, RankedItem> = BTreeMap::new();
    for modality in Modality::ALL {
        let weight = effective[modality.index()];
        // 排名只按去重后的位置计算
        let mut rank = 0;
        for hit in lists.list(modality) {
            let item = fused
                .entry(hit.id.clone())
                .or_insert_with(|| RankedItem::empty(hit));
            let slot = item.slot(modality);
            if slot.is_some() {
                // 同一来源内重复出现，只保留最靠前的排名
                continue;
            }
            rank += 1;
            *slot = Some(SourceScore {
                rank,
                score: hit.score,
            });
            if item.label.is_none() {
                item.label = hit.label.clone();
            }
            item.fused_score += weight / (k + rank as f64);
        }
    }

    let mut items: Vec<RankedItem> = fused.into_values().collect();
    items.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    Ok(items)
}
