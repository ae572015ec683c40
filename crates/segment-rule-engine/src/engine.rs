//! 分群引擎门面
//!
//! 组合描述符目录、规则图仓储和引擎配置。每次评估都重新加载规则图并构建
//! 表达式树，规则的修改在下一次评估时立即生效。

use std::sync::Arc;

use segment_shared::config::EngineConfig;
use segment_shared::observability::metrics::record_candidate_evaluation;
use tracing::{debug, instrument};

use crate::builder::ExpressionBuilder;
use crate::catalog::CatalogRegistry;
use crate::error::{Result, RuleError};
use crate::executor::{EvaluationResult, InMemoryEvaluator};
use crate::expression::ExpressionGroup;
use crate::graph::RuleGraph;
use crate::models::Scope;
use crate::scopes::{Candidate, Cart};
use crate::store::RuleGraphRepository;

/// 分群引擎
#[derive(Clone)]
pub struct SegmentEngine {
    catalogs: Arc<CatalogRegistry>,
    repository: Arc<dyn RuleGraphRepository>,
    config: EngineConfig,
}

impl SegmentEngine {
    pub fn new(
        catalogs: Arc<CatalogRegistry>,
        repository: Arc<dyn RuleGraphRepository>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalogs,
            repository,
            config,
        }
    }

    pub fn catalogs(&self) -> &Arc<CatalogRegistry> {
        &self.catalogs
    }

    pub fn repository(&self) -> &Arc<dyn RuleGraphRepository> {
        &self.repository
    }

    /// 作用域的表达式构建器
    pub fn builder(&self, scope: Scope) -> Result<ExpressionBuilder> {
        let catalog = self.catalogs.catalog(scope).ok_or_else(|| RuleError::InvalidDescriptor {
            key: scope.to_string(),
            reason: "作用域没有注册描述符目录".to_string(),
        })?;
        Ok(ExpressionBuilder::new(
            scope,
            catalog,
            self.config.max_group_depth,
        ))
    }

    /// 构建单个规则集的表达式树
    #[instrument(skip(self))]
    pub async fn build(&self, scope: Scope, rule_set_id: i64) -> Result<ExpressionGroup> {
        let builder = self.builder(scope)?;
        let graph = self.repository.load_graph(&[rule_set_id]).await?;
        builder.visit_rule_set(&graph, rule_set_id)
    }

    /// 构建多个规则集，任一失败则整体失败
    #[instrument(skip(self))]
    pub async fn build_many(
        &self,
        scope: Scope,
        rule_set_ids: &[i64],
    ) -> Result<Vec<ExpressionGroup>> {
        let builder = self.builder(scope)?;
        let graph = self.repository.load_graph(rule_set_ids).await?;
        build_all(&builder, &graph, rule_set_ids)
    }

    /// 评估单个候选对象
    #[instrument(skip(self, candidate))]
    pub async fn evaluate(
        &self,
        scope: Scope,
        rule_set_id: i64,
        candidate: &(dyn Candidate + Sync),
    ) -> Result<EvaluationResult> {
        let tree = self.build(scope, rule_set_id).await?;
        let result = InMemoryEvaluator::new().evaluate(&tree, candidate);

        record_candidate_evaluation(scope.as_str(), result.matched);
        debug!(matched = result.matched, "候选对象评估完成");
        Ok(result)
    }

    /// 购物车是否满足规则集
    pub async fn evaluate_cart(&self, rule_set_id: i64, cart: &Cart) -> Result<bool> {
        Ok(self.evaluate(Scope::Cart, rule_set_id, cart).await?.matched)
    }

    /// 购物车是否满足任一规则集，没有规则集时不匹配
    #[instrument(skip(self, cart))]
    pub async fn evaluate_cart_any(&self, rule_set_ids: &[i64], cart: &Cart) -> Result<bool> {
        let trees = self.build_many(Scope::Cart, rule_set_ids).await?;
        let evaluator = InMemoryEvaluator::new();
        let matched = trees.iter().any(|tree| evaluator.matches(tree, cart));

        record_candidate_evaluation(Scope::Cart.as_str(), matched);
        Ok(matched)
    }
}

fn build_all(
    builder: &ExpressionBuilder,
    graph: &RuleGraph,
    rule_set_ids: &[i64],
) -> Result<Vec<ExpressionGroup>> {
    rule_set_ids
        .iter()
        .map(|&id| builder.visit_rule_set(graph, id))
        .collect()
}
