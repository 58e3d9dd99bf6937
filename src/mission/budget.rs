//! 任务预算账本
//!
//! 每次 LLM 调用与工具调用执行前先预授权：spent + amount 超过 limit 时拒绝且不记账。

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::{MissionError, Result};

const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub limit: f64,
    pub spent: f64,
    /// 按预算科目（"llm"、"tool:<id>"）累计
    #[serde(default)]
    pub lines: BTreeMap<String, f64>,
}

impl BudgetLedger {
    pub fn new(limit: f64) -> Result<Self> {
        if !limit.is_finite() || limit < 0.0 {
            return Err(MissionError::Validation(format!(
                "budget limit must be a non-negative number, got {limit}"
            )));
        }
        Ok(Self {
            limit,
            spent: 0.0,
            lines: BTreeMap::new(),
        })
    }

    pub fn remaining(&self) -> f64 {
        (self.limit - self.spent).max(0.0)
    }

    pub fn authorize(&self, line: &str, amount: f64) -> Result<()> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(MissionError::Validation(format!(
                "invalid cost {amount} for {line}"
            )));
        }
        if self.spent + amount > self.limit + EPSILON {
            return Err(MissionError::BudgetExceeded {
                line: line.to_string(),
                limit: self.limit,
                spent: self.spent,
                requested: amount,
            });
        }
        Ok(())
    }

    pub fn charge(&mut self, line: &str, amount: f64) {
        self.spent += amount;
        *self.lines.entry(line.to_string()).or_insert(0.0) += amount;
    }

    /// 预授权并记账
    pub fn spend(&mut self, line: &str, amount: f64) -> Result<()> {
        self.authorize(line, amount)?;
        self.charge(line, amount);
        Ok(())
    }
}
