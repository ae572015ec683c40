//! 规则引擎领域模型
//!
//! 持久化的规则集与规则、分页请求与结果。数据库行（`*Row`）只在存储层出现，
//! 读出后立即转换为领域类型，`"Group"` 魔法字符串在这里转换成 [`RuleKind::GroupRef`]。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, RuleError};
use crate::operators::{LogicalOperator, Operator};

/// 组引用规则的保留规则类型
pub const GROUP_RULE_TYPE: &str = "Group";

/// 评估作用域
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
pub enum Scope {
    Customer,
    Cart,
}

impl Scope {
    pub const ALL: [Scope; 2] = [Scope::Customer, Scope::Cart];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "Customer",
            Self::Cart => "Cart",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Customer" => Ok(Self::Customer),
            "Cart" => Ok(Self::Cart),
            other => Err(other.to_string()),
        }
    }
}

/// 规则集
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSet {
    pub id: i64,
    pub scope: Scope,
    pub name: String,
    pub is_active: bool,
    pub is_sub_group: bool,
    pub logical_operator: LogicalOperator,
    /// 乐观并发版本号，每次变更递增
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 规则内容：叶子条件或对子规则集的引用
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleKind {
    Leaf {
        rule_type: String,
        operator: Operator,
        value: String,
    },
    GroupRef {
        target_id: i64,
    },
}

impl RuleKind {
    pub fn leaf(
        rule_type: impl Into<String>,
        operator: Operator,
        value: impl Into<String>,
    ) -> Self {
        Self::Leaf {
            rule_type: rule_type.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn group_ref(target_id: i64) -> Self {
        Self::GroupRef { target_id }
    }

    pub fn target_id(&self) -> Option<i64> {
        match self {
            Self::GroupRef { target_id } => Some(*target_id),
            Self::Leaf { .. } => None,
        }
    }

    /// 转换为持久层的 (rule_type, operator, value) 三元组
    pub(crate) fn to_columns(&self) -> (String, String, String) {
        match self {
            Self::Leaf {
                rule_type,
                operator,
                value,
            } => (rule_type.clone(), operator.to_string(), value.clone()),
            Self::GroupRef { target_id } => (
                GROUP_RULE_TYPE.to_string(),
                Operator::Equals.to_string(),
                target_id.to_string(),
            ),
        }
    }
}

/// 规则
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Rule {
    pub id: i64,
    pub rule_set_id: i64,
    pub kind: RuleKind,
    pub display_order: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 规则集详情（按需包含规则与子规则组）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleSetDetails {
    pub rule_set: RuleSet,
    pub rules: Option<Vec<Rule>>,
    pub sub_groups: Option<Vec<RuleSetDetails>>,
}

// ==================== 写入参数 ====================

/// 新建规则集
#[derive(Debug, Clone, Deserialize)]
pub struct NewRuleSet {
    pub scope: Scope,
    pub name: String,
    pub logical_operator: LogicalOperator,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

impl NewRuleSet {
    pub fn new(scope: Scope, name: impl Into<String>, logical_operator: LogicalOperator) -> Self {
        Self {
            scope,
            name: name.into(),
            logical_operator,
            is_active: true,
        }
    }
}

/// 更新规则集（携带期望版本号）
#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRuleSet {
    pub id: i64,
    pub name: String,
    pub is_active: bool,
    pub logical_operator: LogicalOperator,
    pub expected_version: i64,
}

impl UpdateRuleSet {
    /// 以当前状态为基础构造更新
    pub fn from_current(rule_set: &RuleSet) -> Self {
        Self {
            id: rule_set.id,
            name: rule_set.name.clone(),
            is_active: rule_set.is_active,
            logical_operator: rule_set.logical_operator,
            expected_version: rule_set.version,
        }
    }
}

/// 新建规则
#[derive(Debug, Clone)]
pub struct NewRule {
    pub rule_set_id: i64,
    pub kind: RuleKind,
    /// 为空时追加到末尾
    pub display_order: Option<i64>,
    /// 所属规则集的期望版本号，为空时不校验
    pub expected_version: Option<i64>,
}

impl NewRule {
    pub fn leaf(
        rule_set_id: i64,
        rule_type: impl Into<String>,
        operator: Operator,
        value: impl Into<String>,
    ) -> Self {
        Self {
            rule_set_id,
            kind: RuleKind::leaf(rule_type, operator, value),
            display_order: None,
            expected_version: None,
        }
    }

    pub fn group_ref(rule_set_id: i64, target_id: i64) -> Self {
        Self {
            rule_set_id,
            kind: RuleKind::group_ref(target_id),
            display_order: None,
            expected_version: None,
        }
    }

    /// 要求所属规则集仍处于给定版本
    pub fn with_expected_version(mut self, version: i64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// 更新规则（携带期望版本号）
#[derive(Debug, Clone)]
pub struct UpdateRule {
    pub id: i64,
    pub kind: RuleKind,
    pub display_order: i64,
    pub expected_version: i64,
}

impl UpdateRule {
    /// 以当前状态为基础构造更新
    pub fn from_current(rule: &Rule) -> Self {
        Self {
            id: rule.id,
            kind: rule.kind.clone(),
            display_order: rule.display_order,
            expected_version: rule.version,
        }
    }

    /// 只替换操作符（叶子规则）
    pub fn with_operator(mut self, new_operator: Operator) -> Self {
        if let RuleKind::Leaf { operator, .. } = &mut self.kind {
            *operator = new_operator;
        }
        self
    }

    /// 只替换值（叶子规则）
    pub fn with_value(mut self, new_value: impl Into<String>) -> Self {
        if let RuleKind::Leaf { value, .. } = &mut self.kind {
            *value = new_value.into();
        }
        self
    }
}

// ==================== 数据库行 ====================

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RuleSetRow {
    pub id: i64,
    pub scope: String,
    pub name: String,
    pub is_active: bool,
    pub is_sub_group: bool,
    pub logical_operator: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RuleSetRow> for RuleSet {
    type Error = RuleError;

    fn try_from(row: RuleSetRow) -> Result<Self> {
        let scope = row.scope.parse::<Scope>().map_err(|s| RuleError::InvalidValue {
            rule_id: 0,
            value: s,
            reason: format!("规则集 {} 的作用域无效", row.id),
        })?;
        let logical_operator =
            row.logical_operator
                .parse::<LogicalOperator>()
                .map_err(|op| RuleError::InvalidOperator {
                    operator: op,
                    rule_type: format!("RuleSet#{}", row.id),
                })?;

        Ok(RuleSet {
            id: row.id,
            scope,
            name: row.name,
            is_active: row.is_active,
            is_sub_group: row.is_sub_group,
            logical_operator,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct RuleRow {
    pub id: i64,
    pub rule_set_id: i64,
    pub rule_type: String,
    pub operator: String,
    pub value: String,
    pub display_order: i64,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<RuleRow> for Rule {
    type Error = RuleError;

    fn try_from(row: RuleRow) -> Result<Self> {
        let kind = if row.rule_type == GROUP_RULE_TYPE {
            let target_id = row
                .value
                .trim()
                .parse::<i64>()
                .map_err(|e| RuleError::InvalidValue {
                    rule_id: row.id,
                    value: row.value.clone(),
                    reason: format!("组引用必须是规则集 ID: {}", e),
                })?;
            RuleKind::GroupRef { target_id }
        } else {
            let operator =
                row.operator
                    .parse::<Operator>()
                    .map_err(|op| RuleError::InvalidOperator {
                        operator: op,
                        rule_type: row.rule_type.clone(),
                    })?;
            RuleKind::Leaf {
                rule_type: row.rule_type,
                operator,
                value: row.value,
            }
        };

        Ok(Rule {
            id: row.id,
            rule_set_id: row.rule_set_id,
            kind,
            display_order: row.display_order,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

// ==================== 分页 ====================

/// 分页请求，页码从 0 开始
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page_index: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn new(page_index: u32, page_size: u32) -> Self {
        Self {
            page_index,
            page_size,
        }
    }

    /// 校验分页参数
    pub fn validate(&self, max_page_size: u32) -> Result<()> {
        if self.page_size == 0 {
            return Err(RuleError::InvalidPage("page_size 必须大于 0".to_string()));
        }
        if self.page_size > max_page_size {
            return Err(RuleError::InvalidPage(format!(
                "page_size {} 超过上限 {}",
                self.page_size, max_page_size
            )));
        }
        Ok(())
    }

    pub fn offset(&self) -> i64 {
        i64::from(self.page_index) * i64::from(self.page_size)
    }

    pub fn limit(&self) -> i64 {
        i64::from(self.page_size)
    }
}

/// 分页结果
#[derive(Debug, Clone, Serialize)]
pub struct PagedResult<T> {
    pub items: Vec<T>,
    pub page_index: u32,
    pub page_size: u32,
    pub total_count: i64,
}

impl<T> PagedResult<T> {
    pub fn new(items: Vec<T>, page: PageRequest, total_count: i64) -> Self {
        Self {
            items,
            page_index: page.page_index,
            page_size: page.page_size,
            total_count,
        }
    }

    pub fn total_pages(&self) -> i64 {
        if self.page_size == 0 {
            return 0;
        }
        let size = i64::from(self.page_size);
        (self.total_count + size - 1) / size
    }

    pub fn has_next_page(&self) -> bool {
        i64::from(self.page_index) + 1 < self.total_pages()
    }
}
