//! 智能体角色与层级
//!
//! L1（最高决策层）到 L5（专职执行层）。层级关系建模为按下标索引的有向图：
//! delegate 边指向下一层（level + 1），escalate 边指向上一层（level - 1），均按层级查找解析，
//! 不持有角色之间的引用，避免循环引用。

use serde::{Deserialize, Serialize};

use crate::core::{MissionError, Result};

pub const MIN_LEVEL: u8 = 1;
pub const MAX_LEVEL: u8 = 5;

/// 单个智能体角色（来自配置 [[agents]]）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRole {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// 1..=5
    pub level: u8,
    #[serde(default)]
    pub description: String,
    /// 允许使用的工具；为空表示可使用注册表中的全部工具
    #[serde(default)]
    pub tools: Vec<String>,
}

impl AgentRole {
    pub fn new(id: impl Into<String>, level: u8, description: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            level,
            description: description.into(),
            tools: Vec::new(),
        }
    }

    pub fn with_tools(mut self, tools: &[&str]) -> Self {
        self.tools = tools.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn allows_tool(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool)
    }
}

/// 层级图：roles 按下标存储，边也以下标表示
#[derive(Debug, Clone, Default)]
pub struct AgentHierarchy {
    roles: Vec<AgentRole>,
    delegate_edges: Vec<Vec<usize>>,
    escalate_edges: Vec<Option<usize>>,
}

impl AgentHierarchy {
    /// 构建层级图；level 越界或 id 重复时返回校验错误
    pub fn new(roles: Vec<AgentRole>) -> Result<Self> {
        for (i, role) in roles.iter().enumerate() {
            if !(MIN_LEVEL..=MAX_LEVEL).contains(&role.level) {
                return Err(MissionError::Validation(format!(
                    "agent {} has level {} outside L{}..L{}",
                    role.id, role.level, MIN_LEVEL, MAX_LEVEL
                )));
            }
            if roles[..i].iter().any(|r| r.id == role.id) {
                return Err(MissionError::Validation(format!(
                    "duplicate agent id {}",
                    role.id
                )));
            }
        }

        let delegate_edges = roles
            .iter()
            .map(|from| {
                roles
                    .iter()
                    .enumerate()
                    .filter(|(_, to)| to.level == from.level + 1)
                    .map(|(j, _)| j)
                    .collect()
            })
            .collect();
        let escalate_edges = roles
            .iter()
            .map(|from| {
                if from.level == MIN_LEVEL {
                    return None;
                }
                roles.iter().position(|to| to.level == from.level - 1)
            })
            .collect();

        Ok(Self {
            roles,
            delegate_edges,
            escalate_edges,
        })
    }

    pub fn roles(&self) -> &[AgentRole] {
        &self.roles
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.roles.iter().position(|r| r.id == id)
    }

    pub fn role(&self, index: usize) -> Option<&AgentRole> {
        self.roles.get(index)
    }

    pub fn get(&self, id: &str) -> Option<&AgentRole> {
        self.index_of(id).and_then(|i| self.role(i))
    }

    /// 委派目标：优先指定层级（必须低于当前层级），否则取下一层的第一个角色
    pub fn delegate_target(&self, from: usize, preferred_level: Option<u8>) -> Option<usize> {
        let current = self.roles.get(from)?.level;
        if let Some(level) = preferred_level.filter(|l| *l > current) {
            if let Some(j) = self.roles.iter().position(|r| r.level == level) {
                return Some(j);
            }
        }
        self.delegate_edges.get(from)?.first().copied()
    }

    /// 升级目标：上一层的第一个角色
    pub fn escalation_target(&self, from: usize) -> Option<usize> {
        self.escalate_edges.get(from).copied().flatten()
    }
}

/// 无配置时的内置角色
pub fn default_roles() -> Vec<AgentRole> {
    vec![
        AgentRole::new("coordinator", 1, "plans missions and reviews results"),
        AgentRole::new("analyst", 2, "breaks goals into research tasks"),
        AgentRole::new("researcher", 3, "gathers evidence with tools").with_tools(&["echo"]),
        AgentRole::new("writer", 4, "writes artifacts and reports")
            .with_tools(&["echo", "write_artifact"]),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hierarchy() -> AgentHierarchy {
        AgentHierarchy::new(default_roles()).unwrap()
    }

    #[test]
    fn test_delegate_goes_one_level_down() {
        let h = hierarchy();
        let coordinator = h.index_of("coordinator").unwrap();
        let target = h.delegate_target(coordinator, None).unwrap();
        assert_eq!(h.role(target).unwrap().id, "analyst");
    }

    #[test]
    fn test_delegate_prefers_requested_lower_level() {
        let h = hierarchy();
        let coordinator = h.index_of("coordinator").unwrap();
        let target = h.delegate_target(coordinator, Some(4)).unwrap();
        assert_eq!(h.role(target).unwrap().id, "writer");
        // 不能委派给同级或上级
        let analyst = h.index_of("analyst").unwrap();
        let target = h.delegate_target(analyst, Some(1)).unwrap();
        assert_eq!(h.role(target).unwrap().id, "researcher");
    }

    #[test]
    fn test_escalate_and_top_level() {
        let h = hierarchy();
        let writer = h.index_of("writer").unwrap();
        let up = h.escalation_target(writer).unwrap();
        assert_eq!(h.role(up).unwrap().id, "researcher");
        assert_eq!(h.escalation_target(h.index_of("coordinator").unwrap()), None);
        assert_eq!(h.delegate_target(writer, None), None);
    }

    #[test]
    fn test_invalid_level_rejected() {
        let err = AgentHierarchy::new(vec![AgentRole::new("x", 9, "")]).unwrap_err();
        assert!(matches!(err, MissionError::Validation(_)));
    }

    #[test]
    fn test_tool_allow_list() {
        let h = hierarchy();
        assert!(h.get("writer").unwrap().allows_tool("write_artifact"));
        assert!(!h.get("researcher").unwrap().allows_tool("write_artifact"));
        assert!(h.get("coordinator").unwrap().allows_tool("anything"));
    }
}
