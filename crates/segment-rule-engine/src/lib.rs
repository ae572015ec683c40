//! 分群规则引擎
//!
//! 按管理员定义的树形规则集对实体（客户、购物车）分群：
//! - 按作用域注册的规则描述符目录
//! - 规则集与规则的持久化存储
//! - 规则图到表达式树的解析，带环检测和深度限制
//! - 单个候选对象的内存短路求值
//! - 大规模客户集合的查询下推与分页

pub mod builder;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod expression;
pub mod graph;
pub mod models;
pub mod operators;
pub mod pushdown;
pub mod scopes;
pub mod store;
pub mod value;

pub use builder::ExpressionBuilder;
pub use catalog::{CatalogRegistry, DataType, DescriptorCatalog, RuleDescriptor};
pub use engine::SegmentEngine;
pub use error::{Result, RuleError};
pub use executor::{EvaluationResult, InMemoryEvaluator};
pub use expression::{Expression, ExpressionGroup, ExpressionNode, ExpressionVisitor};
pub use graph::RuleGraph;
pub use models::{PageRequest, PagedResult, Rule, RuleKind, RuleSet, Scope};
pub use operators::{LogicalOperator, Operator};
pub use pushdown::{CustomerSegmentQuery, QueryOptions, SqlFilter};
pub use scopes::{Candidate, Cart, CartItem, Customer};
pub use store::{RuleGraphRepository, SqliteRuleStore, migrate};
pub use value::Value;
