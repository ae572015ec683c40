//! 规则图快照
//!
//! 从若干根规则集出发，沿组引用读取所有可达的规则集与规则。
//! 加载过程容忍环和缺失的引用目标，结构错误留给表达式构建阶段报告。

use sqlx::SqliteConnection;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::Result;
use crate::models::{Rule, RuleSet};
use crate::store::{fetch_rule_set, fetch_rules};

/// 规则图快照，加载后只读
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RuleGraph {
    sets: HashMap<i64, RuleSet>,
    rules: HashMap<i64, Vec<Rule>>,
}

impl RuleGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 加入一个规则集及其规则，规则按 (display_order, id) 排序
    pub fn insert(&mut self, rule_set: RuleSet, mut rules: Vec<Rule>) {
        rules.sort_by_key(|r| (r.display_order, r.id));
        self.rules.insert(rule_set.id, rules);
        self.sets.insert(rule_set.id, rule_set);
    }

    pub fn rule_set(&self, id: i64) -> Option<&RuleSet> {
        self.sets.get(&id)
    }

    /// 规则集拥有的规则，规则集不在快照中时返回空切片
    pub fn rules_of(&self, id: i64) -> &[Rule] {
        self.rules.get(&id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn contains(&self, id: i64) -> bool {
        self.sets.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn rule_set_ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.sets.keys().copied()
    }
}

/// 在给定连接（通常是一个事务）上加载规则图
pub(crate) async fn load_graph_in(
    conn: &mut SqliteConnection,
    root_ids: &[i64],
) -> Result<RuleGraph> {
    let mut graph = RuleGraph::new();
    let mut seen: HashSet<i64> = HashSet::new();
    let mut queue: VecDeque<i64> = root_ids.iter().copied().collect();

    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        let Some(rule_set) = fetch_rule_set(&mut *conn, id).await? else {
            continue;
        };
        let rules = fetch_rules(&mut *conn, id).await?;
        for target in rules.iter().filter_map(|r| r.kind.target_id()) {
            if !seen.contains(&target) {
                queue.push_back(target);
            }
        }
        graph.insert(rule_set, rules);
    }

    Ok(graph)
}
