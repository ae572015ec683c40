//! 规则引擎错误类型

use std::time::Duration;

use thiserror::Error;

use crate::models::Scope;

#[derive(Debug, Error)]
pub enum RuleError {
    // ==================== 构建错误 ====================
    #[error("未知的规则类型: rule_id={rule_id}, rule_type={rule_type}")]
    UnknownRuleType { rule_id: i64, rule_type: String },

    #[error("无效的操作符: {operator} 不适用于规则类型 {rule_type}")]
    InvalidOperator { operator: String, rule_type: String },

    #[error("无效的规则值: rule_id={rule_id}, value='{value}': {reason}")]
    InvalidValue {
        rule_id: i64,
        value: String,
        reason: String,
    },

    #[error("规则组循环引用: {}", format_path(path))]
    CircularReference { path: Vec<i64> },

    #[error("规则组在同一棵树中被多处引用: rule_set_id={rule_set_id}")]
    SharedSubGroup { rule_set_id: i64 },

    #[error("规则组嵌套超过最大深度 {max_depth}: rule_set_id={rule_set_id}")]
    DepthExceeded { max_depth: usize, rule_set_id: i64 },

    #[error("规则组引用的规则集不存在: rule_id={rule_id}, target_id={target_id}")]
    DanglingGroupReference { rule_id: i64, target_id: i64 },

    #[error("规则集作用域不匹配: rule_set_id={rule_set_id}, 期望 {expected}, 实际 {actual}")]
    ScopeMismatch {
        rule_set_id: i64,
        expected: Scope,
        actual: Scope,
    },

    // ==================== 存储错误 ====================
    #[error("规则集不存在: {0}")]
    RuleSetNotFound(i64),

    #[error("规则不存在: {0}")]
    RuleNotFound(i64),

    #[error("并发冲突: {entity} id={id}, {reason}")]
    Conflict {
        entity: &'static str,
        id: i64,
        reason: String,
    },

    #[error("存储不可用: {0}")]
    StoreUnavailable(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // ==================== 查询错误 ====================
    #[error("查询超时: {0:?}")]
    Timeout(Duration),

    #[error("查询已取消")]
    Cancelled,

    #[error("无效的分页参数: {0}")]
    InvalidPage(String),

    #[error("作用域 {0} 不支持查询下推")]
    NotQueryable(Scope),

    // ==================== 注册错误 ====================
    #[error("无效的规则描述符: {key}: {reason}")]
    InvalidDescriptor { key: String, reason: String },
}

fn format_path(path: &[i64]) -> String {
    path.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, RuleError>;

impl RuleError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownRuleType { .. } => "UNKNOWN_RULE_TYPE",
            Self::InvalidOperator { .. } => "INVALID_OPERATOR",
            Self::InvalidValue { .. } => "INVALID_VALUE",
            Self::CircularReference { .. } => "CIRCULAR_REFERENCE",
            Self::SharedSubGroup { .. } => "SHARED_SUB_GROUP",
            Self::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            Self::DanglingGroupReference { .. } => "DANGLING_GROUP_REFERENCE",
            Self::ScopeMismatch { .. } => "SCOPE_MISMATCH",
            Self::RuleSetNotFound(_) => "RULE_SET_NOT_FOUND",
            Self::RuleNotFound(_) => "RULE_NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            Self::Migration(_) => "MIGRATION_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::Cancelled => "CANCELLED",
            Self::InvalidPage(_) => "INVALID_PAGE",
            Self::NotQueryable(_) => "NOT_QUERYABLE",
            Self::InvalidDescriptor { .. } => "INVALID_DESCRIPTOR",
        }
    }

    /// 是否为规则图结构性错误（构建阶段发现，整个请求中止）
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Self::UnknownRuleType { .. }
                | Self::InvalidOperator { .. }
                | Self::InvalidValue { .. }
                | Self::CircularReference { .. }
                | Self::SharedSubGroup { .. }
                | Self::DepthExceeded { .. }
                | Self::DanglingGroupReference { .. }
                | Self::ScopeMismatch { .. }
        )
    }

    /// 是否为可重试错误
    ///
    /// 冲突不可重试：重放一次冲突写入会掩盖真实的并发编辑。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(sqlx::Error::PoolTimedOut) | Self::Timeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_reference_message() {
        let err = RuleError::CircularReference {
            path: vec![1, 2, 1],
        };
        assert_eq!(err.to_string(), "规则组循环引用: 1 -> 2 -> 1");
        assert_eq!(err.code(), "CIRCULAR_REFERENCE");
    }

    #[test]
    fn test_structural_errors() {
        let dangling = RuleError::DanglingGroupReference {
            rule_id: 7,
            target_id: 42,
        };
        assert!(dangling.is_structural());
        assert!(!dangling.is_retryable());

        let shared = RuleError::SharedSubGroup { rule_set_id: 4 };
        assert!(shared.is_structural());
        assert_eq!(shared.code(), "SHARED_SUB_GROUP");

        let conflict = RuleError::Conflict {
            entity: "RuleSet",
            id: 1,
            reason: "版本已变更".to_string(),
        };
        assert!(!conflict.is_structural());
        assert!(!conflict.is_retryable());
    }

    #[test]
    fn test_retryable_errors() {
        assert!(RuleError::StoreUnavailable(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(RuleError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RuleError::Cancelled.is_retryable());
    }
}
