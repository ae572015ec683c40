//! Cart 作用域
//!
//! 购物车只在结账时逐个评估，不支持查询下推。

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::{Candidate, customer_role_options};
use crate::catalog::{CatalogBuilder, DataType, RuleDescriptor};
use crate::error::Result;
use crate::models::Scope;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: i64,
    pub quantity: i64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    pub customer_id: Option<i64>,
    pub shipping_country: Option<String>,
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub customer_roles: Vec<String>,
    pub customer_registered_on: Option<NaiveDate>,
}

impl Cart {
    pub fn subtotal(&self) -> f64 {
        self.items
            .iter()
            .map(|item| item.quantity as f64 * item.unit_price)
            .sum()
    }

    /// 商品件数，溢出时封顶
    pub fn item_count(&self) -> i64 {
        self.items
            .iter()
            .fold(0i64, |total, item| total.saturating_add(item.quantity))
    }

    pub fn product_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if !ids.contains(&item.product_id) {
                ids.push(item.product_id);
            }
        }
        ids
    }
}

impl Candidate for Cart {
    fn attribute(&self, name: &str) -> Option<Value> {
        match name {
            "shipping_country" => self.shipping_country.clone().map(Value::Text),
            "subtotal" => Some(Value::Decimal(self.subtotal())),
            "item_count" => Some(Value::Int(self.item_count())),
            "product_ids" => Some(Value::IdList(self.product_ids())),
            "customer_roles" => Some(Value::TextList(self.customer_roles.clone())),
            "customer_registered_on" => self.customer_registered_on.map(Value::Date),
            _ => None,
        }
    }
}

pub fn register(builder: &mut CatalogBuilder) -> Result<()> {
    let scope = Scope::Cart;
    builder
        .register(
            RuleDescriptor::new(scope, "Country", DataType::String, "shipping_country")
                .with_display("收货国家", "配送"),
        )?
        .register(
            RuleDescriptor::new(scope, "CartSubtotal", DataType::Decimal, "subtotal")
                .with_display("购物车小计", "购物车"),
        )?
        .register(
            RuleDescriptor::new(scope, "CartItemCount", DataType::Int, "item_count")
                .with_display("商品件数", "购物车"),
        )?
        .register(
            RuleDescriptor::new(scope, "CartProducts", DataType::EntityId, "product_ids")
                .with_display("包含商品", "购物车"),
        )?
        .register(
            RuleDescriptor::new(scope, "CustomerRoles", DataType::Enumeration, "customer_roles")
                .with_display("客户角色", "客户")
                .with_options(customer_role_options()),
        )?
        .register(
            RuleDescriptor::new(
                scope,
                "CustomerRegisteredOn",
                DataType::Date,
                "customer_registered_on",
            )
            .with_display("客户注册日期", "客户"),
        )?;
    Ok(())
}
