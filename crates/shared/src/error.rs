//! 统一错误处理模块
//!
//! 基础设施层（配置加载、数据库连接）的错误类型。

use thiserror::Error;

/// 基础设施错误类型
#[derive(Debug, Error)]
pub enum SharedError {
    #[error("配置加载失败: {0}")]
    Config(#[from] config::ConfigError),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("无效的数据库地址: {0}")]
    InvalidDatabaseUrl(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, SharedError>;

impl SharedError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Database(_) => "DATABASE_ERROR",
            Self::InvalidDatabaseUrl(_) => "INVALID_DATABASE_URL",
        }
    }

    /// 是否为可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(sqlx::Error::PoolTimedOut) | Self::Database(sqlx::Error::Io(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code() {
        let err = SharedError::InvalidDatabaseUrl("mysql://x".to_string());
        assert_eq!(err.code(), "INVALID_DATABASE_URL");
    }

    #[test]
    fn test_is_retryable() {
        let timed_out = SharedError::Database(sqlx::Error::PoolTimedOut);
        assert!(timed_out.is_retryable());

        let not_found = SharedError::Database(sqlx::Error::RowNotFound);
        assert!(!not_found.is_retryable());
    }
}
