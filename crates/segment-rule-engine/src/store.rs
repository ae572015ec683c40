//! 规则图存储
//!
//! 规则集与规则的持久化。所有更新都携带期望版本号，版本不符时返回
//! [`RuleError::Conflict`]；规则的增删改同时递增所属规则集的版本号，
//! 使同一规则集上的并发编辑可被检测。存储错误直接上抛，不做自动重试。
//!
//! 组引用在写入时校验：目标必须存在、与所属规则集同作用域，且不能已被
//! 其它组规则引用。被引用的规则集标记为子规则组。

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::HashSet;
use tracing::{info, instrument, warn};

use crate::error::{Result, RuleError};
use crate::graph::{RuleGraph, load_graph_in};
use crate::models::{
    GROUP_RULE_TYPE, NewRule, NewRuleSet, Rule, RuleKind, RuleRow, RuleSet, RuleSetDetails,
    RuleSetRow, Scope, UpdateRule, UpdateRuleSet,
};
use crate::operators::LogicalOperator;

const RULE_SET_COLUMNS: &str =
    "id, scope, name, is_active, is_sub_group, logical_operator, version, created_at, updated_at";

const RULE_COLUMNS: &str =
    "id, rule_set_id, rule_type, operator, value, display_order, version, created_at, updated_at";

/// 规则图仓储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RuleGraphRepository: Send + Sync {
    // 规则集
    async fn create_rule_set(&self, new: NewRuleSet) -> Result<RuleSet>;
    async fn update_rule_set(&self, update: UpdateRuleSet) -> Result<RuleSet>;
    async fn set_logical_operator(
        &self,
        id: i64,
        logical_operator: LogicalOperator,
        expected_version: i64,
    ) -> Result<RuleSet>;
    async fn get_rule_set_by_id(
        &self,
        id: i64,
        include_rules: bool,
        include_sub_groups: bool,
    ) -> Result<Option<RuleSetDetails>>;
    async fn list_rule_sets(&self, scope: Scope) -> Result<Vec<RuleSet>>;
    async fn delete_rule_set(&self, id: i64) -> Result<bool>;
    async fn force_delete_rule_set(&self, id: i64) -> Result<bool>;

    // 规则
    async fn get_rule(&self, id: i64) -> Result<Option<Rule>>;
    async fn insert_rule(&self, new: NewRule) -> Result<Rule>;
    async fn update_rule(&self, update: UpdateRule) -> Result<Rule>;
    async fn delete_rule(&self, id: i64, expected_set_version: Option<i64>) -> Result<bool>;

    // 子规则组
    async fn create_sub_group(
        &self,
        parent_id: i64,
        name: &str,
        logical_operator: LogicalOperator,
    ) -> Result<(RuleSet, Rule)>;
    async fn delete_sub_group(&self, group_rule_id: i64) -> Result<bool>;

    // 快照
    async fn load_graph(&self, root_ids: &[i64]) -> Result<RuleGraph>;
}

/// 基于 SQLite 的规则图存储
#[derive(Clone)]
pub struct SqliteRuleStore {
    pool: SqlitePool,
}

impl SqliteRuleStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// 执行内置迁移
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    info!("数据库迁移完成");
    Ok(())
}

// ==================== 连接级查询 ====================

pub(crate) async fn fetch_rule_set(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<RuleSet>> {
    let row = sqlx::query_as::<_, RuleSetRow>(&format!(
        "SELECT {} FROM rule_sets WHERE id = ?",
        RULE_SET_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(RuleSet::try_from).transpose()
}

pub(crate) async fn fetch_rules(
    conn: &mut SqliteConnection,
    rule_set_id: i64,
) -> Result<Vec<Rule>> {
    let rows = sqlx::query_as::<_, RuleRow>(&format!(
        "SELECT {} FROM rules WHERE rule_set_id = ? ORDER BY display_order ASC, id ASC",
        RULE_COLUMNS
    ))
    .bind(rule_set_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter().map(Rule::try_from).collect()
}

async fn fetch_rule(conn: &mut SqliteConnection, id: i64) -> Result<Option<Rule>> {
    let sql = format!("SELECT {} FROM rules WHERE id = ?", RULE_COLUMNS);
    let row = sqlx::query_as::<_, RuleRow>(&sql)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;

    row.map(Rule::try_from).transpose()
}

async fn rule_set_exists(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rule_sets WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count > 0)
}

/// 统计引用某规则集的组规则数量，排除指定规则集自身拥有的规则
async fn count_group_references(
    conn: &mut SqliteConnection,
    target_id: i64,
    excluding_owner: i64,
) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM rules WHERE rule_type = ? AND value = ? AND rule_set_id <> ?",
    )
    .bind(GROUP_RULE_TYPE)
    .bind(target_id.to_string())
    .bind(excluding_owner)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// 递增规则集版本号，给出期望版本时版本不符即冲突
async fn bump_rule_set_version(
    conn: &mut SqliteConnection,
    id: i64,
    expected_version: Option<i64>,
) -> Result<()> {
    let result = sqlx::query(
        "UPDATE rule_sets SET version = version + 1, updated_at = ? \
         WHERE id = ? AND (? IS NULL OR version = ?)",
    )
    .bind(Utc::now())
    .bind(id)
    .bind(expected_version)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(());
    }
    Err(match expected_version {
        Some(version) => rule_set_write_failure(conn, id, version).await,
        None => RuleError::RuleSetNotFound(id),
    })
}

/// 把组引用挂到目标规则集上
///
/// 目标必须存在、与所属规则集同作用域，且除 `replacing_rule` 外没有其它组规则
/// 引用它。通过后目标被标记为子规则组。
async fn attach_group_reference(
    conn: &mut SqliteConnection,
    owner: &RuleSet,
    target_id: i64,
    replacing_rule: Option<i64>,
) -> Result<()> {
    let target = fetch_rule_set(conn, target_id)
        .await?
        .ok_or(RuleError::RuleSetNotFound(target_id))?;
    if target.scope != owner.scope {
        return Err(RuleError::ScopeMismatch {
            rule_set_id: target_id,
            expected: owner.scope,
            actual: target.scope,
        });
    }

    // 规则 ID 从 1 开始，0 表示不排除任何规则
    let references: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM rules WHERE rule_type = ? AND value = ? AND id <> ?",
    )
    .bind(GROUP_RULE_TYPE)
    .bind(target_id.to_string())
    .bind(replacing_rule.unwrap_or(0))
    .fetch_one(&mut *conn)
    .await?;
    if references > 0 {
        return Err(RuleError::Conflict {
            entity: "RuleSet",
            id: target_id,
            reason: format!("已被 {} 条组规则引用", references),
        });
    }

    if !target.is_sub_group {
        sqlx::query("UPDATE rule_sets SET is_sub_group = 1, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(target_id)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn insert_rule_set_in(
    conn: &mut SqliteConnection,
    new: &NewRuleSet,
    is_sub_group: bool,
) -> Result<RuleSet> {
    let now = Utc::now();
    let row = sqlx::query_as::<_, RuleSetRow>(&format!(
        r#"
        INSERT INTO rule_sets
            (scope, name, is_active, is_sub_group, logical_operator, version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        RETURNING {}
        "#,
        RULE_SET_COLUMNS
    ))
    .bind(new.scope.as_str())
    .bind(&new.name)
    .bind(new.is_active)
    .bind(is_sub_group)
    .bind(new.logical_operator.as_str())
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    RuleSet::try_from(row)
}

async fn insert_rule_in(
    conn: &mut SqliteConnection,
    rule_set_id: i64,
    kind: &RuleKind,
    display_order: Option<i64>,
) -> Result<Rule> {
    let display_order = match display_order {
        Some(order) => order,
        None => {
            sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(display_order) + 1, 0) FROM rules WHERE rule_set_id = ?",
            )
            .bind(rule_set_id)
            .fetch_one(&mut *conn)
            .await?
        }
    };

    let (rule_type, operator, value) = kind.to_columns();
    let now = Utc::now();
    let row = sqlx::query_as::<_, RuleRow>(&format!(
        r#"
        INSERT INTO rules
            (rule_set_id, rule_type, operator, value, display_order, version, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        RETURNING {}
        "#,
        RULE_COLUMNS
    ))
    .bind(rule_set_id)
    .bind(rule_type)
    .bind(operator)
    .bind(value)
    .bind(display_order)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Rule::try_from(row)
}

/// 删除规则集及其拥有的规则
async fn delete_rule_set_rows(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    sqlx::query("DELETE FROM rules WHERE rule_set_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    let result = sqlx::query("DELETE FROM rule_sets WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// 版本更新影响 0 行时区分"不存在"与"版本冲突"
async fn rule_set_write_failure(
    conn: &mut SqliteConnection,
    id: i64,
    expected_version: i64,
) -> RuleError {
    match rule_set_exists(conn, id).await {
        Ok(true) => RuleError::Conflict {
            entity: "RuleSet",
            id,
            reason: format!("期望版本 {} 已过期", expected_version),
        },
        Ok(false) => RuleError::RuleSetNotFound(id),
        Err(e) => e,
    }
}

fn assemble_details(
    graph: &RuleGraph,
    id: i64,
    include_rules: bool,
    path: &mut HashSet<i64>,
) -> Option<RuleSetDetails> {
    let rule_set = graph.rule_set(id)?.clone();
    let rules = graph.rules_of(id);

    path.insert(id);
    let targets: Vec<i64> = rules
        .iter()
        .filter_map(|r| r.kind.target_id())
        .filter(|target| !path.contains(target))
        .collect();
    let mut sub_groups = Vec::with_capacity(targets.len());
    for target in targets {
        if let Some(details) = assemble_details(graph, target, include_rules, path) {
            sub_groups.push(details);
        }
    }
    path.remove(&id);

    Some(RuleSetDetails {
        rule_set,
        rules: include_rules.then(|| rules.to_vec()),
        sub_groups: Some(sub_groups),
    })
}

#[async_trait]
impl RuleGraphRepository for SqliteRuleStore {
    #[instrument(skip(self, new), fields(scope = %new.scope, name = %new.name))]
    async fn create_rule_set(&self, new: NewRuleSet) -> Result<RuleSet> {
        let mut conn = self.pool.acquire().await?;
        let rule_set = insert_rule_set_in(&mut conn, &new, false).await?;

        info!(rule_set_id = rule_set.id, "规则集已创建");
        Ok(rule_set)
    }

    #[instrument(skip(self, update), fields(rule_set_id = update.id))]
    async fn update_rule_set(&self, update: UpdateRuleSet) -> Result<RuleSet> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, RuleSetRow>(&format!(
            r#"
            UPDATE rule_sets
            SET name = ?, is_active = ?, logical_operator = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING {}
            "#,
            RULE_SET_COLUMNS
        ))
        .bind(&update.name)
        .bind(update.is_active)
        .bind(update.logical_operator.as_str())
        .bind(Utc::now())
        .bind(update.id)
        .bind(update.expected_version)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => {
                let rule_set = RuleSet::try_from(row)?;
                info!(version = rule_set.version, "规则集已更新");
                Ok(rule_set)
            }
            None => {
                let err =
                    rule_set_write_failure(&mut conn, update.id, update.expected_version).await;
                warn!(error = %err, "规则集更新失败");
                Err(err)
            }
        }
    }

    #[instrument(skip(self))]
    async fn set_logical_operator(
        &self,
        id: i64,
        logical_operator: LogicalOperator,
        expected_version: i64,
    ) -> Result<RuleSet> {
        let mut conn = self.pool.acquire().await?;
        let row = sqlx::query_as::<_, RuleSetRow>(&format!(
            r#"
            UPDATE rule_sets
            SET logical_operator = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING {}
            "#,
            RULE_SET_COLUMNS
        ))
        .bind(logical_operator.as_str())
        .bind(Utc::now())
        .bind(id)
        .bind(expected_version)
        .fetch_optional(&mut *conn)
        .await?;

        match row {
            Some(row) => RuleSet::try_from(row),
            None => Err(rule_set_write_failure(&mut conn, id, expected_version).await),
        }
    }

    #[instrument(skip(self))]
    async fn get_rule_set_by_id(
        &self,
        id: i64,
        include_rules: bool,
        include_sub_groups: bool,
    ) -> Result<Option<RuleSetDetails>> {
        let mut tx = self.pool.begin().await?;

        let details = if include_sub_groups {
            let graph = load_graph_in(&mut tx, &[id]).await?;
            assemble_details(&graph, id, include_rules, &mut HashSet::new())
        } else {
            match fetch_rule_set(&mut tx, id).await? {
                Some(rule_set) => {
                    let rules = if include_rules {
                        Some(fetch_rules(&mut tx, id).await?)
                    } else {
                        None
                    };
                    Some(RuleSetDetails {
                        rule_set,
                        rules,
                        sub_groups: None,
                    })
                }
                None => None,
            }
        };

        tx.commit().await?;
        Ok(details)
    }

    #[instrument(skip(self))]
    async fn list_rule_sets(&self, scope: Scope) -> Result<Vec<RuleSet>> {
        let rows = sqlx::query_as::<_, RuleSetRow>(&format!(
            "SELECT {} FROM rule_sets WHERE scope = ? AND is_sub_group = 0 ORDER BY name ASC, id ASC",
            RULE_SET_COLUMNS
        ))
        .bind(scope.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RuleSet::try_from).collect()
    }

    #[instrument(skip(self))]
    async fn delete_rule_set(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        if !rule_set_exists(&mut tx, id).await? {
            return Ok(false);
        }

        let references = count_group_references(&mut tx, id, id).await?;
        if references > 0 {
            warn!(references, "规则集仍被组规则引用，拒绝删除");
            return Err(RuleError::Conflict {
                entity: "RuleSet",
                id,
                reason: format!("仍被 {} 条组规则引用", references),
            });
        }

        let deleted = delete_rule_set_rows(&mut tx, id).await?;
        tx.commit().await?;

        info!("规则集已删除");
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn force_delete_rule_set(&self, id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let deleted = delete_rule_set_rows(&mut tx, id).await?;
        tx.commit().await?;

        if deleted {
            warn!("规则集已强制删除，引用它的组规则将悬空");
        }
        Ok(deleted)
    }

    #[instrument(skip(self))]
    async fn get_rule(&self, id: i64) -> Result<Option<Rule>> {
        let mut conn = self.pool.acquire().await?;
        fetch_rule(&mut conn, id).await
    }

    #[instrument(skip(self, new), fields(rule_set_id = new.rule_set_id))]
    async fn insert_rule(&self, new: NewRule) -> Result<Rule> {
        let mut tx = self.pool.begin().await?;

        let owner = fetch_rule_set(&mut tx, new.rule_set_id)
            .await?
            .ok_or(RuleError::RuleSetNotFound(new.rule_set_id))?;
        if let Some(target_id) = new.kind.target_id() {
            attach_group_reference(&mut tx, &owner, target_id, None).await?;
        }

        let rule = insert_rule_in(&mut tx, owner.id, &new.kind, new.display_order).await?;
        if let Err(err) = bump_rule_set_version(&mut tx, owner.id, new.expected_version).await {
            warn!(error = %err, "规则添加失败");
            return Err(err);
        }
        tx.commit().await?;

        info!(rule_id = rule.id, "规则已添加");
        Ok(rule)
    }

    #[instrument(skip(self, update), fields(rule_id = update.id))]
    async fn update_rule(&self, update: UpdateRule) -> Result<Rule> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_rule(&mut tx, update.id)
            .await?
            .ok_or(RuleError::RuleNotFound(update.id))?;
        if let Some(target_id) = update.kind.target_id() {
            let owner = fetch_rule_set(&mut tx, current.rule_set_id)
                .await?
                .ok_or(RuleError::RuleSetNotFound(current.rule_set_id))?;
            attach_group_reference(&mut tx, &owner, target_id, Some(update.id)).await?;
        }

        let (rule_type, operator, value) = update.kind.to_columns();
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            r#"
            UPDATE rules
            SET rule_type = ?, operator = ?, value = ?, display_order = ?,
                version = version + 1, updated_at = ?
            WHERE id = ? AND version = ?
            RETURNING {}
            "#,
            RULE_COLUMNS
        ))
        .bind(rule_type)
        .bind(operator)
        .bind(value)
        .bind(update.display_order)
        .bind(Utc::now())
        .bind(update.id)
        .bind(update.expected_version)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let err = RuleError::Conflict {
                entity: "Rule",
                id: update.id,
                reason: format!("期望版本 {} 已过期", update.expected_version),
            };
            warn!(error = %err, "规则更新失败");
            return Err(err);
        };

        let rule = Rule::try_from(row)?;
        bump_rule_set_version(&mut tx, rule.rule_set_id, None).await?;
        tx.commit().await?;

        info!(version = rule.version, "规则已更新");
        Ok(rule)
    }

    #[instrument(skip(self))]
    async fn delete_rule(&self, id: i64, expected_set_version: Option<i64>) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let owner: Option<i64> = sqlx::query_scalar("SELECT rule_set_id FROM rules WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(owner) = owner else {
            return Ok(false);
        };

        sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if let Err(err) = bump_rule_set_version(&mut tx, owner, expected_set_version).await {
            warn!(error = %err, "规则删除失败");
            return Err(err);
        }
        tx.commit().await?;

        info!(rule_set_id = owner, "规则已删除");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn create_sub_group(
        &self,
        parent_id: i64,
        name: &str,
        logical_operator: LogicalOperator,
    ) -> Result<(RuleSet, Rule)> {
        let mut tx = self.pool.begin().await?;

        let parent = fetch_rule_set(&mut tx, parent_id)
            .await?
            .ok_or(RuleError::RuleSetNotFound(parent_id))?;

        let new = NewRuleSet::new(parent.scope, name, logical_operator);
        let sub_group = insert_rule_set_in(&mut tx, &new, true).await?;
        let group_ref = RuleKind::group_ref(sub_group.id);
        let rule = insert_rule_in(&mut tx, parent_id, &group_ref, None).await?;
        bump_rule_set_version(&mut tx, parent_id, None).await?;
        tx.commit().await?;

        info!(sub_group_id = sub_group.id, rule_id = rule.id, "子规则组已创建");
        Ok((sub_group, rule))
    }

    #[instrument(skip(self))]
    async fn delete_sub_group(&self, group_rule_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        let Some(rule) = fetch_rule(&mut tx, group_rule_id).await? else {
            return Ok(false);
        };
        let Some(target_id) = rule.kind.target_id() else {
            return Err(RuleError::InvalidValue {
                rule_id: group_rule_id,
                value: rule.kind.to_columns().2,
                reason: "不是组引用规则".to_string(),
            });
        };

        // 先删引用规则，再删被引用的规则集
        sqlx::query("DELETE FROM rules WHERE id = ?")
            .bind(group_rule_id)
            .execute(&mut *tx)
            .await?;
        bump_rule_set_version(&mut tx, rule.rule_set_id, None).await?;

        // 只级联删除不再被其它规则引用的子规则组
        let mut visited: HashSet<i64> = HashSet::new();
        let mut pending = vec![target_id];
        let mut removed = 0usize;
        while let Some(set_id) = pending.pop() {
            if !visited.insert(set_id) {
                continue;
            }
            let Some(set) = fetch_rule_set(&mut tx, set_id).await? else {
                continue;
            };
            if !set.is_sub_group || count_group_references(&mut tx, set_id, set_id).await? > 0 {
                continue;
            }
            let children: Vec<i64> = fetch_rules(&mut tx, set_id)
                .await?
                .iter()
                .filter_map(|r| r.kind.target_id())
                .collect();
            delete_rule_set_rows(&mut tx, set_id).await?;
            removed += 1;
            pending.extend(children);
        }

        tx.commit().await?;

        info!(target_id, removed, "子规则组已删除");
        Ok(true)
    }

    #[instrument(skip(self))]
    async fn load_graph(&self, root_ids: &[i64]) -> Result<RuleGraph> {
        let mut tx = self.pool.begin().await?;
        let graph = load_graph_in(&mut tx, root_ids).await?;
        tx.commit().await?;
        Ok(graph)
    }
}
