//! 查询下推评估
//!
//! 把表达式树编译成可组合的 SQL 过滤片段，在数据库端筛选客户并分页，
//! 不在内存中物化全部行。生成的 SQL 与内存评估语义一致，包括 NULL 的处理：
//! 缺失的列让条件为 NULL，在只含 AND/OR 的组合中等价于不匹配。

use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use segment_shared::config::EngineConfig;
use segment_shared::observability::metrics::record_pushdown_query;

use crate::builder::ExpressionBuilder;
use crate::catalog::{CatalogRegistry, DataType};
use crate::error::{Result, RuleError};
use crate::expression::{Expression, ExpressionGroup, ExpressionVisitor};
use crate::graph::{RuleGraph, load_graph_in};
use crate::models::{PageRequest, PagedResult, Scope};
use crate::operators::{LogicalOperator, Operator};
use crate::scopes::customer::{CUSTOMER_COLUMNS, CUSTOMER_TABLE, Customer};
use crate::value::{DATE_FORMAT, Value};

/// 单个列条件
#[derive(Debug, Clone, PartialEq)]
pub struct SqlPredicate {
    pub column: String,
    pub operator: Operator,
    pub value: Value,
    pub data_type: DataType,
}

/// SQL 过滤片段树
#[derive(Debug, Clone, PartialEq)]
pub enum SqlFilter {
    /// 匹配全部（空 And 组）
    All,
    /// 不匹配任何行（空 Or 组）
    Nothing,
    Predicate(SqlPredicate),
    And(Vec<SqlFilter>),
    Or(Vec<SqlFilter>),
}

impl SqlFilter {
    /// 编译表达式树
    pub fn compile(group: &ExpressionGroup) -> Self {
        group.accept(&mut FilterCompiler)
    }

    /// 合取，吸收 All，遇到 Nothing 整体为 Nothing
    pub fn all_of(children: Vec<SqlFilter>) -> Self {
        let mut kept = Vec::with_capacity(children.len());
        for child in children {
            match child {
                SqlFilter::All => {}
                SqlFilter::Nothing => return SqlFilter::Nothing,
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => SqlFilter::All,
            1 => kept.remove(0),
            _ => SqlFilter::And(kept),
        }
    }

    /// 析取，吸收 Nothing，遇到 All 整体为 All
    pub fn any_of(children: Vec<SqlFilter>) -> Self {
        let mut kept = Vec::with_capacity(children.len());
        for child in children {
            match child {
                SqlFilter::Nothing => {}
                SqlFilter::All => return SqlFilter::All,
                other => kept.push(other),
            }
        }
        match kept.len() {
            0 => SqlFilter::Nothing,
            1 => kept.remove(0),
            _ => SqlFilter::Or(kept),
        }
    }

    /// 把片段追加到查询构建器，值全部以绑定参数传入
    pub fn push_to<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>) {
        match self {
            SqlFilter::All => {
                qb.push("1 = 1");
            }
            SqlFilter::Nothing => {
                qb.push("1 = 0");
            }
            SqlFilter::Predicate(predicate) => predicate.push_to(qb),
            SqlFilter::And(children) => push_joined(qb, children, " AND "),
            SqlFilter::Or(children) => push_joined(qb, children, " OR "),
        }
    }

    /// 渲染 SQL 文本（参数为占位符）
    pub fn to_sql(&self) -> String {
        let mut qb = QueryBuilder::<Sqlite>::new("");
        self.push_to(&mut qb);
        qb.sql().to_string()
    }
}

/// 单层 AND/OR 链的最大项数
///
/// SQLite 把 `a OR b OR c` 解析成左深二叉树，链长直接计入表达式深度
/// （`SQLITE_MAX_EXPR_DEPTH` 默认 1000）。更宽的组拆成带括号的嵌套子链，
/// 深度随宽度对数增长。
pub const MAX_CHAIN_LEN: usize = 16;

fn push_joined<'args>(
    qb: &mut QueryBuilder<'args, Sqlite>,
    children: &[SqlFilter],
    separator: &str,
) {
    qb.push("(");
    if children.len() <= MAX_CHAIN_LEN {
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                qb.push(separator);
            }
            child.push_to(qb);
        }
    } else {
        let chunk_len = children.len().div_ceil(MAX_CHAIN_LEN);
        for (i, chunk) in children.chunks(chunk_len).enumerate() {
            if i > 0 {
                qb.push(separator);
            }
            push_joined(qb, chunk, separator);
        }
    }
    qb.push(")");
}

impl SqlPredicate {
    fn push_to<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>) {
        let column = self.column.as_str();
        match self.operator {
            Operator::Equals => self.push_comparison(qb, "="),
            Operator::NotEquals => self.push_comparison(qb, "<>"),
            Operator::GreaterThan => self.push_comparison(qb, ">"),
            Operator::GreaterThanOrEquals => self.push_comparison(qb, ">="),
            Operator::LessThan => self.push_comparison(qb, "<"),
            Operator::LessThanOrEquals => self.push_comparison(qb, "<="),
            Operator::Contains => {
                qb.push(format!("instr({}, ", column));
                push_value(qb, &self.value);
                qb.push(") > 0");
            }
            Operator::StartsWith => {
                qb.push(format!("substr({}, 1, length(", column));
                push_value(qb, &self.value);
                qb.push(")) = ");
                push_value(qb, &self.value);
            }
            Operator::EndsWith => {
                qb.push(format!("(length({}) >= length(", column));
                push_value(qb, &self.value);
                qb.push(format!(") AND substr({c}, length({c}) - length(", c = column));
                push_value(qb, &self.value);
                qb.push(") + 1) = ");
                push_value(qb, &self.value);
                qb.push(")");
            }
            Operator::IsEmpty => {
                if self.data_type == DataType::String {
                    qb.push(format!("({c} IS NULL OR {c} = '')", c = column));
                } else {
                    qb.push(format!("{} IS NULL", column));
                }
            }
            Operator::In | Operator::NotIn => self.push_membership(qb),
        }
    }

    fn push_comparison<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>, op: &str) {
        qb.push(format!("{} {} ", self.column, op));
        push_value(qb, &self.value);
    }

    fn push_membership<'args>(&self, qb: &mut QueryBuilder<'args, Sqlite>) {
        let negated = self.operator == Operator::NotIn;
        let len = match &self.value {
            Value::TextList(items) => items.len(),
            Value::IdList(ids) => ids.len(),
            _ => 0,
        };
        if len == 0 {
            // 空集合：In 恒假，NotIn 对存在的值恒真
            if negated {
                qb.push(format!("{} IS NOT NULL", self.column));
            } else {
                qb.push("1 = 0");
            }
            return;
        }

        qb.push(format!(
            "{} {} (",
            self.column,
            if negated { "NOT IN" } else { "IN" }
        ));
        let mut separated = qb.separated(", ");
        match &self.value {
            Value::TextList(items) => {
                for item in items {
                    separated.push_bind(item.clone());
                }
            }
            Value::IdList(ids) => {
                for id in ids {
                    separated.push_bind(*id);
                }
            }
            _ => {}
        }
        separated.push_unseparated(")");
    }
}

fn push_value<'args>(qb: &mut QueryBuilder<'args, Sqlite>, value: &Value) {
    match value {
        Value::Text(s) => {
            qb.push_bind(s.clone());
        }
        Value::Int(n) => {
            qb.push_bind(*n);
        }
        Value::Decimal(n) => {
            qb.push_bind(*n);
        }
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Date(d) => {
            qb.push_bind(d.format(DATE_FORMAT).to_string());
        }
        Value::TextList(_) | Value::IdList(_) | Value::Empty => {
            qb.push("NULL");
        }
    }
}

/// 表达式树到过滤片段的编译访问者
struct FilterCompiler;

impl ExpressionVisitor for FilterCompiler {
    type Output = SqlFilter;

    fn visit_group(&mut self, group: &ExpressionGroup) -> SqlFilter {
        let children = group
            .children
            .iter()
            .map(|child| child.accept(self))
            .collect();
        match group.logical_operator {
            LogicalOperator::And => SqlFilter::all_of(children),
            LogicalOperator::Or => SqlFilter::any_of(children),
        }
    }

    fn visit_expression(&mut self, expression: &Expression) -> SqlFilter {
        SqlFilter::Predicate(SqlPredicate {
            column: expression.descriptor.attribute.clone(),
            operator: expression.operator,
            value: expression.value.clone(),
            data_type: expression.descriptor.data_type,
        })
    }
}

/// 查询选项
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// 覆盖配置中的查询超时
    pub timeout: Option<Duration>,
    /// 取消信号，值变为 true 时中止查询
    pub cancel: Option<watch::Receiver<bool>>,
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// 客户分群查询
#[derive(Clone)]
pub struct CustomerSegmentQuery {
    pool: SqlitePool,
    catalogs: Arc<CatalogRegistry>,
    config: EngineConfig,
}

impl CustomerSegmentQuery {
    pub fn new(pool: SqlitePool, catalogs: Arc<CatalogRegistry>, config: EngineConfig) -> Self {
        Self {
            pool,
            catalogs,
            config,
        }
    }

    /// 把若干规则集编译成一个过滤条件（规则集之间为 Or）
    pub fn build_filter(&self, graph: &RuleGraph, rule_set_ids: &[i64]) -> Result<SqlFilter> {
        let catalog = self
            .catalogs
            .catalog(Scope::Customer)
            .ok_or(RuleError::NotQueryable(Scope::Customer))?;
        let builder = ExpressionBuilder::new(Scope::Customer, catalog, self.config.max_group_depth);

        let mut filters = Vec::with_capacity(rule_set_ids.len());
        for &id in rule_set_ids {
            if let Some(rule_set) = graph.rule_set(id) {
                if rule_set.scope != Scope::Customer {
                    return Err(RuleError::NotQueryable(rule_set.scope));
                }
            }
            let tree = builder.visit_rule_set(graph, id)?;
            filters.push(SqlFilter::compile(&tree));
        }
        Ok(SqlFilter::any_of(filters))
    }

    /// 分页查询匹配任一规则集的客户，按 id 升序
    #[instrument(skip(self, options), fields(rule_set_ids = ?rule_set_ids, page = page.page_index))]
    pub async fn find_customers(
        &self,
        rule_set_ids: &[i64],
        page: PageRequest,
        options: QueryOptions,
    ) -> Result<PagedResult<Customer>> {
        page.validate(self.config.max_page_size)?;

        let start = Instant::now();
        let result = self
            .guarded(self.run_find(rule_set_ids, page), options)
            .await;
        self.record(&result, start);

        let result = result?;
        info!(
            total = result.total_count,
            returned = result.items.len(),
            "客户分群查询完成"
        );
        Ok(result)
    }

    /// 只统计匹配数量
    #[instrument(skip(self, options), fields(rule_set_ids = ?rule_set_ids))]
    pub async fn count_matches(&self, rule_set_ids: &[i64], options: QueryOptions) -> Result<i64> {
        let start = Instant::now();
        let result = self.guarded(self.run_count(rule_set_ids), options).await;
        self.record(&result, start);
        result
    }

    async fn run_find(
        &self,
        rule_set_ids: &[i64],
        page: PageRequest,
    ) -> Result<PagedResult<Customer>> {
        let mut tx = self.pool.begin().await?;
        let graph = load_graph_in(&mut tx, rule_set_ids).await?;
        let filter = self.build_filter(&graph, rule_set_ids)?;

        let mut count = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE ",
            CUSTOMER_TABLE
        ));
        filter.push_to(&mut count);
        let total_count: i64 = count.build_query_scalar().fetch_one(&mut *tx).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {} FROM {} WHERE ",
            CUSTOMER_COLUMNS, CUSTOMER_TABLE
        ));
        filter.push_to(&mut select);
        select
            .push(" ORDER BY id ASC LIMIT ")
            .push_bind(page.limit())
            .push(" OFFSET ")
            .push_bind(page.offset());
        let items = select
            .build_query_as::<Customer>()
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(PagedResult::new(items, page, total_count))
    }

    async fn run_count(&self, rule_set_ids: &[i64]) -> Result<i64> {
        let mut tx = self.pool.begin().await?;
        let graph = load_graph_in(&mut tx, rule_set_ids).await?;
        let filter = self.build_filter(&graph, rule_set_ids)?;

        let mut count = QueryBuilder::<Sqlite>::new(format!(
            "SELECT COUNT(*) FROM {} WHERE ",
            CUSTOMER_TABLE
        ));
        filter.push_to(&mut count);
        let total: i64 = count.build_query_scalar().fetch_one(&mut *tx).await?;

        tx.commit().await?;
        Ok(total)
    }

    /// 施加超时与取消，任一触发时丢弃进行中的查询（事务随之回滚）
    async fn guarded<T>(
        &self,
        query: impl Future<Output = Result<T>>,
        options: QueryOptions,
    ) -> Result<T> {
        let timeout = options.timeout.or(self.config.query_timeout());
        let timed = async move {
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, query).await {
                    Ok(result) => result,
                    Err(_) => Err(RuleError::Timeout(limit)),
                },
                None => query.await,
            }
        };

        let Some(mut cancel) = options.cancel else {
            return timed.await;
        };
        if *cancel.borrow() {
            return Err(RuleError::Cancelled);
        }

        tokio::select! {
            biased;

            _ = wait_for_cancel(&mut cancel) => {
                warn!("收到取消信号，查询中止");
                Err(RuleError::Cancelled)
            }

            result = timed => result,
        }
    }

    fn record<T>(&self, result: &Result<T>, start: Instant) {
        let status = match result {
            Ok(_) => "ok",
            Err(e) => e.code(),
        };
        record_pushdown_query(status, start.elapsed().as_secs_f64());
    }
}

/// 等待取消信号；发送端关闭后永不返回
async fn wait_for_cancel(cancel: &mut watch::Receiver<bool>) {
    loop {
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *cancel.borrow() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::RuleDescriptor;
    use crate::expression::ExpressionNode;
    use chrono::NaiveDate;

    fn predicate(column: &str, data_type: DataType, operator: Operator, value: Value) -> SqlFilter {
        SqlFilter::Predicate(SqlPredicate {
            column: column.to_string(),
            operator,
            value,
            data_type,
        })
    }

    #[test]
    fn test_empty_groups_compile_to_constants() {
        let and = ExpressionGroup::new(1, "a", LogicalOperator::And);
        let or = ExpressionGroup::new(2, "o", LogicalOperator::Or);
        assert_eq!(SqlFilter::compile(&and), SqlFilter::All);
        assert_eq!(SqlFilter::compile(&or), SqlFilter::Nothing);
        assert_eq!(SqlFilter::All.to_sql(), "1 = 1");
        assert_eq!(SqlFilter::Nothing.to_sql(), "1 = 0");
    }

    #[test]
    fn test_any_of_and_all_of_simplify() {
        let p = predicate("country", DataType::String, Operator::Equals, Value::Text("DE".into()));
        assert_eq!(SqlFilter::any_of(vec![]), SqlFilter::Nothing);
        assert_eq!(SqlFilter::any_of(vec![SqlFilter::Nothing, p.clone()]), p);
        assert_eq!(SqlFilter::any_of(vec![p.clone(), SqlFilter::All]), SqlFilter::All);
        assert_eq!(SqlFilter::all_of(vec![SqlFilter::All, p.clone()]), p);
        assert_eq!(SqlFilter::all_of(vec![p, SqlFilter::Nothing]), SqlFilter::Nothing);
    }

    #[test]
    fn test_predicate_sql() {
        let text = |op, v: &str| predicate("email", DataType::String, op, Value::Text(v.into()));
        assert_eq!(text(Operator::Equals, "x").to_sql(), "email = ?");
        assert_eq!(text(Operator::Contains, "x").to_sql(), "instr(email, ?) > 0");
        assert_eq!(
            text(Operator::StartsWith, "x").to_sql(),
            "substr(email, 1, length(?)) = ?"
        );
        assert_eq!(
            text(Operator::EndsWith, "x").to_sql(),
            "(length(email) >= length(?) AND substr(email, length(email) - length(?) + 1) = ?)"
        );
        assert_eq!(
            predicate("email", DataType::String, Operator::IsEmpty, Value::Empty).to_sql(),
            "(email IS NULL OR email = '')"
        );
        assert_eq!(
            predicate("total_orders", DataType::Int, Operator::IsEmpty, Value::Empty).to_sql(),
            "total_orders IS NULL"
        );
        assert_eq!(
            predicate(
                "store_id",
                DataType::EntityId,
                Operator::NotIn,
                Value::IdList(vec![1, 2, 3])
            )
            .to_sql(),
            "store_id NOT IN (?, ?, ?)"
        );
        assert_eq!(
            predicate(
                "registered_on",
                DataType::Date,
                Operator::LessThan,
                Value::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
            )
            .to_sql(),
            "registered_on < ?"
        );
    }

    #[test]
    fn test_nested_groups_render_parenthesized() {
        let leaf = |column: &str, v: &str| {
            ExpressionNode::Expression(Expression {
                rule_id: 1,
                descriptor: Arc::new(RuleDescriptor::new(
                    Scope::Customer,
                    column,
                    DataType::String,
                    column,
                )),
                operator: Operator::Equals,
                value: Value::Text(v.into()),
            })
        };
        let mut inner = ExpressionGroup::new(2, "inner", LogicalOperator::Or);
        inner.children = vec![leaf("country", "DE"), leaf("country", "AT")];
        let mut root = ExpressionGroup::new(1, "root", LogicalOperator::And);
        root.children = vec![leaf("email", "a@b.c"), ExpressionNode::Group(inner)];

        assert_eq!(
            SqlFilter::compile(&root).to_sql(),
            "(email = ? AND (country = ? OR country = ?))"
        );
    }

    /// 每层括号内最长的操作数链
    fn longest_chain(sql: &str, separator: &str) -> usize {
        let mut stack = vec![0usize];
        let mut longest = 0;
        let mut rest = sql;
        while let Some(c) = rest.chars().next() {
            if rest.starts_with(separator) {
                *stack.last_mut().unwrap() += 1;
                rest = &rest[separator.len()..];
                continue;
            }
            match c {
                '(' => stack.push(0),
                ')' => longest = longest.max(stack.pop().unwrap()),
                _ => {}
            }
            rest = &rest[c.len_utf8()..];
        }
        longest.max(stack[0]) + 1
    }

    #[test]
    fn test_wide_groups_split_into_nested_chains() {
        let orders = |n: i64| {
            predicate("total_orders", DataType::Int, Operator::Equals, Value::Int(n))
        };

        let narrow = SqlFilter::any_of((0..MAX_CHAIN_LEN as i64).map(orders).collect());
        let sql = narrow.to_sql();
        assert!(!sql.starts_with("(("));
        assert_eq!(longest_chain(&sql, " OR "), MAX_CHAIN_LEN);

        let wide = SqlFilter::any_of((0..1_100).map(orders).collect());
        let sql = wide.to_sql();
        assert!(sql.starts_with("(("));
        assert_eq!(sql.matches("total_orders = ?").count(), 1_100);
        assert!(longest_chain(&sql, " OR ") <= MAX_CHAIN_LEN);

        let wide_and = SqlFilter::all_of((0..300).map(orders).collect());
        let sql = wide_and.to_sql();
        assert_eq!(sql.matches("total_orders = ?").count(), 300);
        assert!(longest_chain(&sql, " AND ") <= MAX_CHAIN_LEN);
    }
}
