//! 规则操作符定义

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 条件操作符
///
/// 持久化为 PascalCase 文本（如 `GreaterThanOrEquals`）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operator {
    // 通用比较
    Equals,
    NotEquals,

    // 字符串操作
    Contains,
    StartsWith,
    EndsWith,

    // 有序比较（数值、日期）
    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,

    // 空值检查
    IsEmpty,

    // 集合成员
    In,
    NotIn,
}

impl Operator {
    pub const ALL: [Operator; 12] = [
        Self::Equals,
        Self::NotEquals,
        Self::Contains,
        Self::StartsWith,
        Self::EndsWith,
        Self::GreaterThan,
        Self::GreaterThanOrEquals,
        Self::LessThan,
        Self::LessThanOrEquals,
        Self::IsEmpty,
        Self::In,
        Self::NotIn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "Equals",
            Self::NotEquals => "NotEquals",
            Self::Contains => "Contains",
            Self::StartsWith => "StartsWith",
            Self::EndsWith => "EndsWith",
            Self::GreaterThan => "GreaterThan",
            Self::GreaterThanOrEquals => "GreaterThanOrEquals",
            Self::LessThan => "LessThan",
            Self::LessThanOrEquals => "LessThanOrEquals",
            Self::IsEmpty => "IsEmpty",
            Self::In => "In",
            Self::NotIn => "NotIn",
        }
    }

    /// 是否不需要操作数
    pub fn is_unary(&self) -> bool {
        matches!(self, Self::IsEmpty)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| s.to_string())
    }
}

/// 逻辑操作符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LogicalOperator {
    And,
    Or,
}

impl LogicalOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::And => "And",
            Self::Or => "Or",
        }
    }
}

impl fmt::Display for LogicalOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And => write!(f, "AND"),
            Self::Or => write!(f, "OR"),
        }
    }
}

impl FromStr for LogicalOperator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "And" => Ok(Self::And),
            "Or" => Ok(Self::Or),
            other => Err(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_round_trip_through_text() {
        for op in Operator::ALL {
            assert_eq!(op.as_str().parse::<Operator>(), Ok(op));
        }
        assert_eq!("Between".parse::<Operator>(), Err("Between".to_string()));
    }

    #[test]
    fn test_logical_operator_parse() {
        assert_eq!("Or".parse::<LogicalOperator>(), Ok(LogicalOperator::Or));
        assert!("AND".parse::<LogicalOperator>().is_err());
        assert_eq!(LogicalOperator::And.to_string(), "AND");
    }
}
