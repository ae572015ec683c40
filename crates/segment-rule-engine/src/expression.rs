//! 表达式树
//!
//! 由规则图解析得到的可评估结构，只在一次请求内存在，从不持久化。
//! 评估逻辑通过 [`ExpressionVisitor`] 从外部实现，树本身不知道自己如何被评估。

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::catalog::RuleDescriptor;
use crate::operators::{LogicalOperator, Operator};
use crate::value::Value;

/// 叶子条件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Expression {
    pub rule_id: i64,
    pub descriptor: Arc<RuleDescriptor>,
    pub operator: Operator,
    pub value: Value,
}

impl Expression {
    pub fn attribute(&self) -> &str {
        &self.descriptor.attribute
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.operator.is_unary() {
            write!(f, "{} {}", self.descriptor.rule_type, self.operator)
        } else {
            write!(
                f,
                "{} {} {}",
                self.descriptor.rule_type, self.operator, self.value
            )
        }
    }
}

/// 逻辑组
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExpressionGroup {
    pub rule_set_id: i64,
    pub name: String,
    pub logical_operator: LogicalOperator,
    pub children: Vec<ExpressionNode>,
}

impl ExpressionGroup {
    pub fn new(
        rule_set_id: i64,
        name: impl Into<String>,
        logical_operator: LogicalOperator,
    ) -> Self {
        Self {
            rule_set_id,
            name: name.into(),
            logical_operator,
            children: Vec::new(),
        }
    }

    /// 叶子条件总数
    pub fn leaf_count(&self) -> usize {
        self.children
            .iter()
            .map(|child| match child {
                ExpressionNode::Expression(_) => 1,
                ExpressionNode::Group(group) => group.leaf_count(),
            })
            .sum()
    }

    /// 组嵌套深度，只有叶子的组深度为 1
    pub fn depth(&self) -> usize {
        1 + self
            .children
            .iter()
            .filter_map(|child| match child {
                ExpressionNode::Group(group) => Some(group.depth()),
                ExpressionNode::Expression(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub fn accept<V: ExpressionVisitor + ?Sized>(&self, visitor: &mut V) -> V::Output {
        visitor.visit_group(self)
    }
}

impl fmt::Display for ExpressionGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, child) in self.children.iter().enumerate() {
            if i > 0 {
                write!(f, " {} ", self.logical_operator)?;
            }
            write!(f, "{}", child)?;
        }
        f.write_str(")")
    }
}

/// 表达式树节点
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum ExpressionNode {
    Expression(Expression),
    Group(ExpressionGroup),
}

impl ExpressionNode {
    pub fn accept<V: ExpressionVisitor + ?Sized>(&self, visitor: &mut V) -> V::Output {
        match self {
            Self::Expression(expr) => visitor.visit_expression(expr),
            Self::Group(group) => visitor.visit_group(group),
        }
    }
}

impl fmt::Display for ExpressionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expression(expr) => write!(f, "{}", expr),
            Self::Group(group) => write!(f, "{}", group),
        }
    }
}

/// 表达式树访问者，每种评估后端一个实现
pub trait ExpressionVisitor {
    type Output;

    fn visit_group(&mut self, group: &ExpressionGroup) -> Self::Output;
    fn visit_expression(&mut self, expression: &Expression) -> Self::Output;
}
