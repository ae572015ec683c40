//! 规则描述符目录
//!
//! 每个作用域一张目录，注册该作用域下可用的规则类型：数据类型、允许的操作符、
//! 默认操作符、展示信息，以及对应的候选属性名。目录在启动时构建，之后只读共享。

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Result, RuleError};
use crate::models::{GROUP_RULE_TYPE, Scope};
use crate::operators::Operator;
use crate::value::Value;

/// 规则操作数的数据类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DataType {
    String,
    Int,
    Decimal,
    Bool,
    Date,
    /// 取自固定选项的集合
    Enumeration,
    /// 实体 ID 集合
    EntityId,
}

impl DataType {
    /// 该数据类型允许的操作符
    pub fn legal_operators(&self) -> &'static [Operator] {
        use Operator::*;
        match self {
            DataType::String => &[Equals, NotEquals, Contains, StartsWith, EndsWith, IsEmpty],
            DataType::Int | DataType::Decimal | DataType::Date => &[
                Equals,
                NotEquals,
                GreaterThan,
                GreaterThanOrEquals,
                LessThan,
                LessThanOrEquals,
                IsEmpty,
            ],
            DataType::Enumeration | DataType::EntityId => &[In, NotIn],
            DataType::Bool => &[Equals, NotEquals],
        }
    }
}

/// 下拉选项
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectOption {
    pub value: String,
    pub label: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
        }
    }
}

/// 规则描述符
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDescriptor {
    /// 规则类型键，作用域内唯一
    pub rule_type: String,
    pub scope: Scope,
    pub data_type: DataType,
    /// 允许的操作符，是数据类型合法操作符的子集
    pub operators: Vec<Operator>,
    pub default_operator: Operator,
    pub display_name: String,
    pub display_group: String,
    pub select_options: Vec<SelectOption>,
    /// 候选对象的属性名，Customer 作用域下同时是数据库列名
    pub attribute: String,
}

impl RuleDescriptor {
    /// 以数据类型的全部合法操作符创建描述符，第一个作为默认操作符
    pub fn new(
        scope: Scope,
        rule_type: impl Into<String>,
        data_type: DataType,
        attribute: impl Into<String>,
    ) -> Self {
        let rule_type = rule_type.into();
        let operators = data_type.legal_operators().to_vec();
        Self {
            display_name: rule_type.clone(),
            rule_type,
            scope,
            data_type,
            default_operator: operators[0],
            operators,
            display_group: String::new(),
            select_options: Vec::new(),
            attribute: attribute.into(),
        }
    }

    pub fn with_display(mut self, name: impl Into<String>, group: impl Into<String>) -> Self {
        self.display_name = name.into();
        self.display_group = group.into();
        self
    }

    pub fn with_operators(mut self, operators: &[Operator], default_operator: Operator) -> Self {
        self.operators = operators.to_vec();
        self.default_operator = default_operator;
        self
    }

    pub fn with_options(mut self, options: Vec<SelectOption>) -> Self {
        self.select_options = options;
        self
    }

    pub fn allows(&self, operator: Operator) -> bool {
        self.operators.contains(&operator)
    }

    /// 解析并校验规则值
    ///
    /// IsEmpty 不需要操作数，忽略原始值。有下拉选项的枚举只接受选项内的值。
    pub fn parse_value(&self, operator: Operator, raw: &str) -> std::result::Result<Value, String> {
        if operator.is_unary() {
            return Ok(Value::Empty);
        }
        let value = Value::parse(self.data_type, raw)?;
        if let Value::TextList(items) = &value {
            if !self.select_options.is_empty() {
                if let Some(unknown) = items
                    .iter()
                    .find(|item| !self.select_options.iter().any(|o| &o.value == *item))
                {
                    return Err(format!("'{}' 不在可选值范围内", unknown));
                }
            }
        }
        Ok(value)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |reason: String| RuleError::InvalidDescriptor {
            key: self.rule_type.clone(),
            reason,
        };

        if self.rule_type.is_empty() {
            return Err(invalid("规则类型不能为空".to_string()));
        }
        if self.rule_type == GROUP_RULE_TYPE {
            return Err(invalid("Group 是保留的规则类型".to_string()));
        }
        if !is_identifier(&self.attribute) {
            return Err(invalid(format!("属性名 '{}' 不是合法标识符", self.attribute)));
        }
        if self.operators.is_empty() {
            return Err(invalid("至少需要一个操作符".to_string()));
        }
        let legal = self.data_type.legal_operators();
        if let Some(op) = self.operators.iter().find(|op| !legal.contains(op)) {
            return Err(invalid(format!(
                "操作符 {} 不适用于数据类型 {:?}",
                op, self.data_type
            )));
        }
        if !self.operators.contains(&self.default_operator) {
            return Err(invalid(format!(
                "默认操作符 {} 不在允许列表中",
                self.default_operator
            )));
        }
        Ok(())
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// 单个作用域的描述符目录
#[derive(Debug, Clone)]
pub struct DescriptorCatalog {
    scope: Scope,
    descriptors: HashMap<String, Arc<RuleDescriptor>>,
}

impl DescriptorCatalog {
    pub fn builder(scope: Scope) -> CatalogBuilder {
        CatalogBuilder {
            scope,
            descriptors: HashMap::new(),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn get(&self, rule_type: &str) -> Option<Arc<RuleDescriptor>> {
        self.descriptors.get(rule_type).cloned()
    }

    /// 按规则类型查找描述符
    pub fn find_descriptor(&self, rule_type: &str) -> Result<Arc<RuleDescriptor>> {
        self.get(rule_type).ok_or_else(|| RuleError::UnknownRuleType {
            rule_id: 0,
            rule_type: rule_type.to_string(),
        })
    }

    /// 按展示名称排序的全部描述符
    pub fn descriptors(&self) -> Vec<Arc<RuleDescriptor>> {
        let mut all: Vec<_> = self.descriptors.values().cloned().collect();
        all.sort_by(|a, b| {
            a.display_name
                .cmp(&b.display_name)
                .then_with(|| a.rule_type.cmp(&b.rule_type))
        });
        all
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }
}

/// 目录构建器
#[derive(Debug)]
pub struct CatalogBuilder {
    scope: Scope,
    descriptors: HashMap<String, Arc<RuleDescriptor>>,
}

impl CatalogBuilder {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// 注册描述符
    ///
    /// 拒绝重复键、保留键、作用域不符和与数据类型不兼容的操作符。
    pub fn register(&mut self, descriptor: RuleDescriptor) -> Result<&mut Self> {
        if descriptor.scope != self.scope {
            return Err(RuleError::InvalidDescriptor {
                key: descriptor.rule_type,
                reason: format!("描述符属于作用域 {}，目录是 {}", descriptor.scope, self.scope),
            });
        }
        descriptor.validate()?;
        if self.descriptors.contains_key(&descriptor.rule_type) {
            return Err(RuleError::InvalidDescriptor {
                key: descriptor.rule_type,
                reason: "规则类型重复注册".to_string(),
            });
        }
        self.descriptors
            .insert(descriptor.rule_type.clone(), Arc::new(descriptor));
        Ok(self)
    }

    pub fn build(self) -> DescriptorCatalog {
        DescriptorCatalog {
            scope: self.scope,
            descriptors: self.descriptors,
        }
    }
}

/// 全部作用域的目录
#[derive(Debug, Clone, Default)]
pub struct CatalogRegistry {
    catalogs: HashMap<Scope, Arc<DescriptorCatalog>>,
}

impl CatalogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置的 Customer 与 Cart 目录
    pub fn with_builtin_scopes() -> Result<Self> {
        let mut registry = Self::new();
        for scope in Scope::ALL {
            let mut builder = DescriptorCatalog::builder(scope);
            crate::scopes::register(&mut builder)?;
            registry.insert(builder.build());
        }
        Ok(registry)
    }

    pub fn insert(&mut self, catalog: DescriptorCatalog) {
        self.catalogs.insert(catalog.scope(), Arc::new(catalog));
    }

    pub fn catalog(&self, scope: Scope) -> Option<Arc<DescriptorCatalog>> {
        self.catalogs.get(&scope).cloned()
    }

    /// 某作用域的全部描述符，未注册的作用域返回空列表
    pub fn get_descriptors(&self, scope: Scope) -> Vec<Arc<RuleDescriptor>> {
        self.catalogs
            .get(&scope)
            .map(|c| c.descriptors())
            .unwrap_or_default()
    }

    pub fn find_descriptor(&self, scope: Scope, rule_type: &str) -> Option<Arc<RuleDescriptor>> {
        self.catalogs.get(&scope).and_then(|c| c.get(rule_type))
    }
}
