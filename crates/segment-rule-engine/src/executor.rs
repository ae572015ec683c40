//! 内存评估执行器
//!
//! 对单个候选对象（如购物车）短路求值表达式树，可选记录评估追踪。

use serde::Serialize;
use std::time::Instant;

use crate::evaluator::ConditionEvaluator;
use crate::expression::{Expression, ExpressionGroup, ExpressionVisitor};
use crate::operators::LogicalOperator;
use crate::scopes::Candidate;

/// 评估结果
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub matched: bool,
    pub rule_set_id: i64,
    pub rule_set_name: String,
    pub matched_conditions: Vec<String>,
    pub evaluation_trace: Vec<String>,
    pub evaluation_time_us: u64,
}

impl EvaluationResult {
    pub fn new(rule_set_id: i64, rule_set_name: impl Into<String>) -> Self {
        Self {
            matched: false,
            rule_set_id,
            rule_set_name: rule_set_name.into(),
            matched_conditions: Vec::new(),
            evaluation_trace: Vec::new(),
            evaluation_time_us: 0,
        }
    }
}

/// 内存评估器
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryEvaluator {
    /// 是否记录详细评估追踪
    trace_enabled: bool,
}

impl InMemoryEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 启用评估追踪
    pub fn with_trace(mut self) -> Self {
        self.trace_enabled = true;
        self
    }

    /// 只返回是否匹配
    pub fn matches(&self, group: &ExpressionGroup, candidate: &dyn Candidate) -> bool {
        let mut visitor = CandidateVisitor {
            candidate,
            trace_enabled: false,
            result: None,
            path: Vec::new(),
        };
        group.accept(&mut visitor)
    }

    /// 评估并返回匹配的条件和追踪信息
    pub fn evaluate(&self, group: &ExpressionGroup, candidate: &dyn Candidate) -> EvaluationResult {
        let start = Instant::now();
        let mut result = EvaluationResult::new(group.rule_set_id, &group.name);

        let matched = {
            let mut visitor = CandidateVisitor {
                candidate,
                trace_enabled: self.trace_enabled,
                result: Some(&mut result),
                path: Vec::new(),
            };
            group.accept(&mut visitor)
        };

        result.matched = matched;
        result.evaluation_time_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        result
    }
}

struct CandidateVisitor<'a> {
    candidate: &'a dyn Candidate,
    trace_enabled: bool,
    result: Option<&'a mut EvaluationResult>,
    /// 从根到当前节点的子节点下标
    path: Vec<usize>,
}

impl CandidateVisitor<'_> {
    /// 渲染当前路径，如 `root.children[0].children[2]`
    fn path_string(&self) -> String {
        let mut rendered = String::from("root");
        for index in &self.path {
            rendered.push_str(&format!(".children[{}]", index));
        }
        rendered
    }

    fn trace(&mut self, message: impl FnOnce(&str) -> String) {
        if !self.trace_enabled {
            return;
        }
        let path = self.path_string();
        if let Some(result) = self.result.as_deref_mut() {
            result.evaluation_trace.push(message(&path));
        }
    }
}

impl ExpressionVisitor for CandidateVisitor<'_> {
    type Output = bool;

    /// 逻辑组短路求值，空 And 组为真，空 Or 组为假
    fn visit_group(&mut self, group: &ExpressionGroup) -> bool {
        let operator = group.logical_operator;
        let total = group.children.len();
        self.trace(|path| {
            format!(
                "{}: 开始评估 {} 组 #{} (共 {} 个子节点)",
                path, operator, group.rule_set_id, total
            )
        });

        // And 遇到 false 立即返回，Or 遇到 true 立即返回
        let short_circuit_on = operator == LogicalOperator::Or;
        for (i, child) in group.children.iter().enumerate() {
            self.path.push(i);
            let child_matched = child.accept(self);
            self.path.pop();

            if child_matched == short_circuit_on {
                self.trace(|path| {
                    format!("{}: {} 短路 - 子节点 {} 结果为 {}", path, operator, i, child_matched)
                });
                return short_circuit_on;
            }
        }

        let matched = !short_circuit_on;
        self.trace(|path| format!("{}: {} 组结果 {}", path, operator, matched));
        matched
    }

    fn visit_expression(&mut self, expression: &Expression) -> bool {
        let attribute = self.candidate.attribute(expression.attribute());
        let matched = ConditionEvaluator::evaluate(
            attribute.as_ref(),
            expression.operator,
            &expression.value,
        );

        self.trace(|path| {
            format!(
                "{}: {} => {}",
                path,
                expression,
                if matched { "MATCHED" } else { "NOT_MATCHED" }
            )
        });

        if matched && self.result.is_some() {
            let path = self.path_string();
            if let Some(result) = self.result.as_deref_mut() {
                result
                    .matched_conditions
                    .push(format!("{}: {}", path, expression));
            }
        }

        matched
    }
}
