//! 共享库
//!
//! 包含分群规则引擎共用的配置、错误处理、数据库连接和可观测性基础设施代码。

pub mod config;
pub mod database;
pub mod error;
pub mod observability;
