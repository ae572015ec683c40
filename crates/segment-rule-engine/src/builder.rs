//! 表达式构建器
//!
//! 把规则图中的一个规则集递归解析成 [`ExpressionGroup`]。
//! 递归携带当前路径上的规则集 ID 和深度计数，任何结构错误都会中止整个构建，
//! 不会返回部分解析的树。每个规则集在一棵树里只展开一次：路径上重复是循环，
//! 路径外重复是共享子组，两者都被拒绝，构建代价与规则图大小成线性。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use segment_shared::observability::metrics::record_rule_build;
use tracing::{debug, warn};

use crate::catalog::DescriptorCatalog;
use crate::error::{Result, RuleError};
use crate::expression::{Expression, ExpressionGroup, ExpressionNode};
use crate::graph::RuleGraph;
use crate::models::{Rule, RuleKind, Scope};

/// 表达式构建器，每个作用域一个实例
#[derive(Debug, Clone)]
pub struct ExpressionBuilder {
    scope: Scope,
    catalog: Arc<DescriptorCatalog>,
    max_depth: usize,
}

impl ExpressionBuilder {
    pub fn new(scope: Scope, catalog: Arc<DescriptorCatalog>, max_depth: usize) -> Self {
        Self {
            scope,
            catalog,
            max_depth,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// 构建规则集的表达式树
    pub fn visit_rule_set(&self, graph: &RuleGraph, rule_set_id: i64) -> Result<ExpressionGroup> {
        let start = Instant::now();

        if !graph.contains(rule_set_id) {
            let err = RuleError::RuleSetNotFound(rule_set_id);
            record_rule_build(self.scope.as_str(), err.code(), start.elapsed().as_secs_f64());
            return Err(err);
        }

        let mut visit = Visit::default();
        let result = self.build_group(graph, rule_set_id, &mut visit, 0);

        let elapsed = start.elapsed().as_secs_f64();
        match &result {
            Ok(group) => {
                record_rule_build(self.scope.as_str(), "ok", elapsed);
                debug!(
                    rule_set_id,
                    leaves = group.leaf_count(),
                    depth = group.depth(),
                    "表达式树构建完成"
                );
            }
            Err(e) => {
                record_rule_build(self.scope.as_str(), e.code(), elapsed);
                warn!(rule_set_id, error = %e, "表达式树构建失败");
            }
        }
        result
    }

    fn build_group(
        &self,
        graph: &RuleGraph,
        rule_set_id: i64,
        visit: &mut Visit,
        depth: usize,
    ) -> Result<ExpressionGroup> {
        if visit.path.contains(&rule_set_id) {
            let mut cycle = visit.path.clone();
            cycle.push(rule_set_id);
            return Err(RuleError::CircularReference { path: cycle });
        }
        if !visit.expanded.insert(rule_set_id) {
            return Err(RuleError::SharedSubGroup { rule_set_id });
        }
        if depth > self.max_depth {
            return Err(RuleError::DepthExceeded {
                max_depth: self.max_depth,
                rule_set_id,
            });
        }

        let rule_set = graph
            .rule_set(rule_set_id)
            .ok_or(RuleError::RuleSetNotFound(rule_set_id))?;
        if rule_set.scope != self.scope {
            return Err(RuleError::ScopeMismatch {
                rule_set_id,
                expected: self.scope,
                actual: rule_set.scope,
            });
        }

        let mut group =
            ExpressionGroup::new(rule_set.id, &rule_set.name, rule_set.logical_operator);
        let rules = graph.rules_of(rule_set_id);
        group.children.reserve(rules.len());

        visit.path.push(rule_set_id);
        for rule in rules {
            let node = match &rule.kind {
                RuleKind::GroupRef { target_id } => {
                    if !graph.contains(*target_id) {
                        return Err(RuleError::DanglingGroupReference {
                            rule_id: rule.id,
                            target_id: *target_id,
                        });
                    }
                    let sub = self.build_group(graph, *target_id, visit, depth + 1)?;
                    ExpressionNode::Group(sub)
                }
                RuleKind::Leaf { .. } => ExpressionNode::Expression(self.visit_rule(rule)?),
            };
            group.children.push(node);
        }
        visit.path.pop();

        Ok(group)
    }

    /// 把叶子规则解析为表达式
    ///
    /// 依次解析描述符、按数据类型解析值、校验操作符。
    pub fn visit_rule(&self, rule: &Rule) -> Result<Expression> {
        let RuleKind::Leaf {
            rule_type,
            operator,
            value,
        } = &rule.kind
        else {
            return Err(RuleError::InvalidValue {
                rule_id: rule.id,
                value: rule.kind.to_columns().2,
                reason: "组引用规则不能解析为条件".to_string(),
            });
        };

        let descriptor = self
            .catalog
            .get(rule_type)
            .ok_or_else(|| RuleError::UnknownRuleType {
                rule_id: rule.id,
                rule_type: rule_type.clone(),
            })?;

        let parsed = descriptor
            .parse_value(*operator, value)
            .map_err(|reason| RuleError::InvalidValue {
                rule_id: rule.id,
                value: value.clone(),
                reason,
            })?;

        if !descriptor.allows(*operator) {
            return Err(RuleError::InvalidOperator {
                operator: operator.to_string(),
                rule_type: rule_type.clone(),
            });
        }

        Ok(Expression {
            rule_id: rule.id,
            descriptor,
            operator: *operator,
            value: parsed,
        })
    }
}

/// 单次构建的遍历状态
#[derive(Debug, Default)]
struct Visit {
    /// 根到当前规则集的路径
    path: Vec<i64>,
    /// 本次构建已展开过的规则集
    expanded: HashSet<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogRegistry;
    use crate::models::RuleSet;
    use crate::operators::{LogicalOperator, Operator};
    use crate::value::Value;
    use chrono::Utc;

    fn builder(max_depth: usize) -> ExpressionBuilder {
        let registry = CatalogRegistry::with_builtin_scopes().unwrap();
        ExpressionBuilder::new(
            Scope::Customer,
            registry.catalog(Scope::Customer).unwrap(),
            max_depth,
        )
    }

    fn rule_set(id: i64, scope: Scope, op: LogicalOperator) -> RuleSet {
        RuleSet {
            id,
            scope,
            name: format!("set-{}", id),
            is_active: true,
            is_sub_group: false,
            logical_operator: op,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn rule(id: i64, owner: i64, kind: RuleKind) -> Rule {
        Rule {
            id,
            rule_set_id: owner,
            kind,
            display_order: id,
            version: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn leaf(id: i64, owner: i64, rule_type: &str, op: Operator, value: &str) -> Rule {
        rule(id, owner, RuleKind::leaf(rule_type, op, value))
    }

    /// 构造一条 1 -> 2 -> ... -> n 的链
    fn chain(n: i64) -> RuleGraph {
        let mut graph = RuleGraph::new();
        for id in 1..=n {
            let rules = if id < n {
                vec![rule(id * 100, id, RuleKind::group_ref(id + 1))]
            } else {
                vec![leaf(id * 100, id, "Country", Operator::Equals, "DE")]
            };
            graph.insert(rule_set(id, Scope::Customer, LogicalOperator::And), rules);
        }
        graph
    }

    #[test]
    fn test_build_leaves_in_order() {
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::And),
            vec![
                leaf(2, 1, "TotalOrders", Operator::GreaterThanOrEquals, "5"),
                leaf(1, 1, "Country", Operator::Equals, "DE"),
            ],
        );

        let group = builder(32).visit_rule_set(&graph, 1).unwrap();
        assert_eq!(group.children.len(), 2);
        match &group.children[0] {
            ExpressionNode::Expression(expr) => {
                assert_eq!(expr.rule_id, 1);
                assert_eq!(expr.value, Value::Text("DE".to_string()));
            }
            other => panic!("意外的节点: {:?}", other),
        }
        assert_eq!(
            group.to_string(),
            "(Country Equals \"DE\" AND TotalOrders GreaterThanOrEquals 5)"
        );
    }

    #[test]
    fn test_build_is_deterministic() {
        let graph = chain(4);
        let builder = builder(32);
        assert_eq!(
            builder.visit_rule_set(&graph, 1).unwrap(),
            builder.visit_rule_set(&graph, 1).unwrap()
        );
    }

    #[test]
    fn test_missing_root() {
        let err = builder(32).visit_rule_set(&RuleGraph::new(), 5).unwrap_err();
        assert!(matches!(err, RuleError::RuleSetNotFound(5)));
    }

    #[test]
    fn test_dangling_reference() {
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::Or),
            vec![rule(10, 1, RuleKind::group_ref(42))],
        );
        let err = builder(32).visit_rule_set(&graph, 1).unwrap_err();
        assert!(matches!(
            err,
            RuleError::DanglingGroupReference {
                rule_id: 10,
                target_id: 42
            }
        ));
    }

    #[test]
    fn test_cycle_reports_path() {
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::And),
            vec![rule(10, 1, RuleKind::group_ref(2))],
        );
        graph.insert(
            rule_set(2, Scope::Customer, LogicalOperator::And),
            vec![rule(20, 2, RuleKind::group_ref(1))],
        );
        let err = builder(32).visit_rule_set(&graph, 1).unwrap_err();
        match err {
            RuleError::CircularReference { path } => assert_eq!(path, vec![1, 2, 1]),
            other => panic!("意外的错误: {:?}", other),
        }
    }

    #[test]
    fn test_self_reference() {
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::And),
            vec![rule(10, 1, RuleKind::group_ref(1))],
        );
        let err = builder(32).visit_rule_set(&graph, 1).unwrap_err();
        assert_eq!(err.code(), "CIRCULAR_REFERENCE");
    }

    #[test]
    fn test_shared_sub_group_is_rejected() {
        // 1 同时经由 2 和 3 引用 4
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::Or),
            vec![
                rule(10, 1, RuleKind::group_ref(2)),
                rule(11, 1, RuleKind::group_ref(3)),
            ],
        );
        graph.insert(
            rule_set(2, Scope::Customer, LogicalOperator::And),
            vec![rule(20, 2, RuleKind::group_ref(4))],
        );
        graph.insert(
            rule_set(3, Scope::Customer, LogicalOperator::And),
            vec![rule(30, 3, RuleKind::group_ref(4))],
        );
        graph.insert(
            rule_set(4, Scope::Customer, LogicalOperator::And),
            vec![leaf(40, 4, "Country", Operator::Equals, "DE")],
        );

        let err = builder(32).visit_rule_set(&graph, 1).unwrap_err();
        assert!(matches!(err, RuleError::SharedSubGroup { rule_set_id: 4 }));
        assert!(err.is_structural());
    }

    #[test]
    fn test_doubled_reference_chain_fails_fast() {
        // 每层两次引用下一层，完全展开将有 2^24 个叶子
        let mut graph = RuleGraph::new();
        for id in 1..=24 {
            let rules = vec![
                rule(id * 100, id, RuleKind::group_ref(id + 1)),
                rule(id * 100 + 1, id, RuleKind::group_ref(id + 1)),
            ];
            graph.insert(rule_set(id, Scope::Customer, LogicalOperator::Or), rules);
        }
        graph.insert(
            rule_set(25, Scope::Customer, LogicalOperator::And),
            vec![leaf(2500, 25, "Country", Operator::Equals, "DE")],
        );

        let start = Instant::now();
        let err = builder(32).visit_rule_set(&graph, 1).unwrap_err();
        assert!(matches!(err, RuleError::SharedSubGroup { rule_set_id: 25 }));
        assert!(start.elapsed().as_secs() < 1);
    }

    #[test]
    fn test_sibling_groups_are_independent() {
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::Or),
            vec![
                rule(10, 1, RuleKind::group_ref(2)),
                rule(11, 1, RuleKind::group_ref(3)),
            ],
        );
        graph.insert(
            rule_set(2, Scope::Customer, LogicalOperator::And),
            vec![leaf(20, 2, "Country", Operator::Equals, "DE")],
        );
        graph.insert(
            rule_set(3, Scope::Customer, LogicalOperator::And),
            vec![leaf(30, 3, "Country", Operator::Equals, "AT")],
        );

        let group = builder(32).visit_rule_set(&graph, 1).unwrap();
        assert_eq!(group.leaf_count(), 2);
    }

    #[test]
    fn test_depth_limit() {
        // 根深度为 0，链长 n 的最深规则集深度为 n - 1
        let graph = chain(5);
        assert!(builder(4).visit_rule_set(&graph, 1).is_ok());
        let err = builder(3).visit_rule_set(&graph, 1).unwrap_err();
        assert!(matches!(
            err,
            RuleError::DepthExceeded {
                max_depth: 3,
                rule_set_id: 5
            }
        ));
    }

    #[test]
    fn test_scope_mismatch() {
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::And),
            vec![rule(10, 1, RuleKind::group_ref(2))],
        );
        graph.insert(rule_set(2, Scope::Cart, LogicalOperator::And), vec![]);
        let err = builder(32).visit_rule_set(&graph, 1).unwrap_err();
        assert_eq!(err.code(), "SCOPE_MISMATCH");
    }

    #[test]
    fn test_visit_rule_errors() {
        let builder = builder(32);

        let err = builder
            .visit_rule(&leaf(1, 1, "ShoeSize", Operator::Equals, "42"))
            .unwrap_err();
        assert!(matches!(err, RuleError::UnknownRuleType { rule_id: 1, .. }));

        let err = builder
            .visit_rule(&leaf(2, 1, "TotalOrders", Operator::Equals, "many"))
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidValue { rule_id: 2, .. }));

        let err = builder
            .visit_rule(&leaf(3, 1, "TotalOrders", Operator::Contains, "5"))
            .unwrap_err();
        assert!(matches!(err, RuleError::InvalidOperator { .. }));

        let expr = builder
            .visit_rule(&leaf(4, 1, "Country", Operator::IsEmpty, ""))
            .unwrap();
        assert_eq!(expr.value, Value::Empty);
    }

    #[test]
    fn test_error_aborts_whole_build() {
        let mut graph = RuleGraph::new();
        graph.insert(
            rule_set(1, Scope::Customer, LogicalOperator::Or),
            vec![
                leaf(1, 1, "Country", Operator::Equals, "DE"),
                leaf(2, 1, "Unknown", Operator::Equals, "x"),
            ],
        );
        assert!(builder(32).visit_rule_set(&graph, 1).is_err());
    }
}
