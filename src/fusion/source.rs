//! 检索来源接口与内存实现
//!
//! 每种模态（向量相似度 / 图关系邻近度 / 关系型历史表现）一个 RetrievalSource，融合选择器不关心各自如何打分。
//! InMemorySource 以关键词重叠打分，可叠加先验分（如历史成功率），供本地运行与测试使用。

use std::collections::HashSet;

use async_trait::async_trait;

use crate::agent::AgentRole;
use crate::core::Result;
use crate::fusion::{CandidateKind, Modality, SourceHit};

/// 单一模态的检索来源（外部协作方）
#[async_trait]
pub trait RetrievalSource: Send + Sync {
    fn modality(&self) -> Modality;

    /// 返回按相关度降序排列的候选（列表位置即排名）
    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SourceHit>>;
}

/// 内存中的一条候选
#[derive(Debug, Clone)]
pub struct SourceEntry {
    pub id: String,
    pub kind: CandidateKind,
    pub text: String,
    /// 0.0..=1.0 的先验分
    pub prior: f64,
}

/// 关键词重叠 + 先验的内存来源
#[derive(Debug, Clone)]
pub struct InMemorySource {
    modality: Modality,
    entries: Vec<SourceEntry>,
    prior_weight: f64,
}

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

impl InMemorySource {
    pub fn new(modality: Modality) -> Self {
        Self {
            modality,
            entries: Vec::new(),
            prior_weight: 0.0,
        }
    }

    /// 先验分在最终分数中的占比（0 表示纯文本匹配）
    pub fn with_prior_weight(mut self, weight: f64) -> Self {
        self.prior_weight = weight.clamp(0.0, 1.0);
        self
    }

    pub fn with_entry(mut self, entry: SourceEntry) -> Self {
        self.entries.push(entry);
        self
    }

    /// 以智能体角色构建来源：文本为名称 + 描述 + 工具
    pub fn from_roles(modality: Modality, roles: &[AgentRole]) -> Self {
        let mut source = Self::new(modality);
        for role in roles {
            source.entries.push(SourceEntry {
                id: role.id.clone(),
                kind: CandidateKind::Agent,
                text: format!("{} {} {}", role.name, role.description, role.tools.join(" ")),
                prior: 0.5,
            });
        }
        source
    }

    fn score(&self, query_tokens: &HashSet<String>, entry: &SourceEntry) -> f64 {
        if query_tokens.is_empty() {
            return 0.0;
        }
        let overlap = tokenize(&entry.text).intersection(query_tokens).count();
        if overlap == 0 {
            return 0.0;
        }
        let text_score = overlap as f64 / query_tokens.len() as f64;
        text_score * (1.0 - self.prior_weight) + entry.prior * self.prior_weight
    }
}

#[async_trait]
impl RetrievalSource for InMemorySource {
    fn modality(&self) -> Modality {
        self.modality
    }

    async fn search(&self, query: &str, top_k: usize) -> Result<Vec<SourceHit>> {
        let query_tokens = tokenize(query);
        let mut scored: Vec<SourceHit> = self
            .entries
            .iter()
            .filter_map(|e| {
                let score = self.score(&query_tokens, e);
                (score > 0.0).then(|| SourceHit::new(e.id.clone(), score).with_kind(e.kind))
            })
            .collect();
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(top_k);
        Ok(scored)
    }
}
