//! 条件评估器
//!
//! 实现各操作符在类型化值上的语义。评估是全函数：属性缺失或类型不符时
//! 条件不匹配，不会返回错误，也不会 panic。

use std::cmp::Ordering;

use crate::operators::Operator;
use crate::value::Value;

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// # Arguments
    /// * `attribute` - 从候选对象读取的属性值
    /// * `operator` - 操作符
    /// * `expected` - 规则中解析出的期望值
    pub fn evaluate(attribute: Option<&Value>, operator: Operator, expected: &Value) -> bool {
        // 空值检查的语义就是检查属性是否存在
        if operator == Operator::IsEmpty {
            return attribute.is_none_or(Value::is_empty_value);
        }

        // 属性不存在时其余操作符都不匹配
        let Some(attribute) = attribute else {
            return false;
        };

        match operator {
            Operator::Equals => Self::ordering(attribute, expected) == Some(Ordering::Equal),
            Operator::NotEquals => matches!(
                Self::ordering(attribute, expected),
                Some(Ordering::Less | Ordering::Greater)
            ),
            Operator::GreaterThan => Self::ordering(attribute, expected) == Some(Ordering::Greater),
            Operator::GreaterThanOrEquals => matches!(
                Self::ordering(attribute, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::LessThan => Self::ordering(attribute, expected) == Some(Ordering::Less),
            Operator::LessThanOrEquals => matches!(
                Self::ordering(attribute, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::Contains => Self::text(attribute, expected, |a, b| a.contains(b)),
            Operator::StartsWith => Self::text(attribute, expected, |a, b| a.starts_with(b)),
            Operator::EndsWith => Self::text(attribute, expected, |a, b| a.ends_with(b)),
            Operator::In => Self::in_list(attribute, expected).unwrap_or(false),
            Operator::NotIn => Self::in_list(attribute, expected).is_some_and(|found| !found),
            Operator::IsEmpty => unreachable!(),
        }
    }

    /// 类型不兼容时为 None
    fn ordering(attribute: &Value, expected: &Value) -> Option<Ordering> {
        attribute.compare(expected)
    }

    fn text<F>(attribute: &Value, expected: &Value, f: F) -> bool
    where
        F: Fn(&str, &str) -> bool,
    {
        match (attribute.as_text(), expected.as_text()) {
            (Some(a), Some(b)) => f(a, b),
            _ => false,
        }
    }

    /// 集合成员检查
    ///
    /// 标量属性检查是否在集合中，集合属性检查是否有交集。类型不符时返回 None。
    fn in_list(attribute: &Value, expected: &Value) -> Option<bool> {
        match (attribute, expected) {
            (Value::Text(a), Value::TextList(list)) => Some(list.contains(a)),
            (Value::Int(a), Value::IdList(list)) => Some(list.contains(a)),
            (Value::TextList(items), Value::TextList(list)) => {
                Some(items.iter().any(|item| list.contains(item)))
            }
            (Value::IdList(ids), Value::IdList(list)) => {
                Some(ids.iter().any(|id| list.contains(id)))
            }
            _ => None,
        }
    }
}
