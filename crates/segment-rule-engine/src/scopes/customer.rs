//! Customer 作用域
//!
//! 客户保存在 `customers` 表中，描述符的属性名就是列名，
//! 查询下推直接以属性名生成过滤条件。

use chrono::NaiveDate;
use serde::Serialize;

use super::{Candidate, customer_role_options};
use crate::catalog::{CatalogBuilder, DataType, RuleDescriptor};
use crate::error::Result;
use crate::models::Scope;
use crate::value::Value;

/// 客户表名
pub const CUSTOMER_TABLE: &str = "customers";

/// 客户表的全部列，顺序与 [`Customer`] 字段一致
pub const CUSTOMER_COLUMNS: &str = "id, email, country, total_orders, total_spent, \
    registered_on, is_tax_exempt, customer_role, store_id";

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct Customer {
    pub id: i64,
    pub email: String,
    pub country: Option<String>,
    pub total_orders: Option<i64>,
    pub total_spent: Option<f64>,
    pub registered_on: Option<NaiveDate>,
    pub is_tax_exempt: Option<bool>,
    pub customer_role: Option<String>,
    pub store_id: Option<i64>,
}

impl Customer {
    pub fn new(id: i64, email: impl Into<String>) -> Self {
        Self {
            id,
            email: email.into(),
            country: None,
            total_orders: None,
            total_spent: None,
            registered_on: None,
            is_tax_exempt: None,
            customer_role: None,
            store_id: None,
        }
    }
}

impl Candidate for Customer {
    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "email" => Some(Value::Text(self.email.clone())),
            "country" => self.country.clone().map(Value::Text),
            "total_orders" => self.total_orders.map(Value::Int),
            "total_spent" => self.total_spent.map(Value::Decimal),
            "registered_on" => self.registered_on.map(Value::Date),
            "is_tax_exempt" => self.is_tax_exempt.map(Value::Bool),
            "customer_role" => self.customer_role.clone().map(Value::Text),
            "store_id" => self.store_id.map(Value::Int),
            _ => None,
        }
    }
}

pub fn register(builder: &mut CatalogBuilder) -> Result<()> {
    let scope = Scope::Customer;
    builder
        .register(
            RuleDescriptor::new(scope, "Country", DataType::String, "country")
                .with_display("国家", "地址"),
        )?
        .register(
            RuleDescriptor::new(scope, "Email", DataType::String, "email")
                .with_display("邮箱", "账户"),
        )?
        .register(
            RuleDescriptor::new(scope, "TotalOrders", DataType::Int, "total_orders")
                .with_display("订单总数", "消费"),
        )?
        .register(
            RuleDescriptor::new(scope, "TotalSpent", DataType::Decimal, "total_spent")
                .with_display("消费总额", "消费"),
        )?
        .register(
            RuleDescriptor::new(scope, "RegisteredOn", DataType::Date, "registered_on")
                .with_display("注册日期", "账户"),
        )?
        .register(
            RuleDescriptor::new(scope, "IsTaxExempt", DataType::Bool, "is_tax_exempt")
                .with_display("免税", "账户"),
        )?
        .register(
            RuleDescriptor::new(scope, "CustomerRole", DataType::Enumeration, "customer_role")
                .with_display("客户角色", "账户")
                .with_options(customer_role_options()),
        )?
        .register(
            RuleDescriptor::new(scope, "StoreId", DataType::EntityId, "store_id")
                .with_display("所属店铺", "账户"),
        )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DescriptorCatalog;

    #[test]
    fn test_every_descriptor_attribute_is_readable() {
        let mut builder = DescriptorCatalog::builder(Scope::Customer);
        register(&mut builder).unwrap();
        let catalog = builder.build();

        let customer = Customer {
            id: 1,
            email: "a@example.com".to_string(),
            country: Some("DE".to_string()),
            total_orders: Some(3),
            total_spent: Some(120.5),
            registered_on: NaiveDate::from_ymd_opt(2023, 5, 1),
            is_tax_exempt: Some(false),
            customer_role: Some("Vip".to_string()),
            store_id: Some(2),
        };
        for descriptor in catalog.descriptors() {
            assert!(
                customer.attribute(&descriptor.attribute).is_some(),
                "{} 不可读",
                descriptor.rule_type
            );
            assert!(CUSTOMER_COLUMNS.contains(&descriptor.attribute));
        }
    }

    #[test]
    fn test_missing_attribute() {
        let customer = Customer::new(1, "a@example.com");
        assert_eq!(customer.attribute("country"), None);
        assert_eq!(customer.attribute("unknown"), None);
    }
}
