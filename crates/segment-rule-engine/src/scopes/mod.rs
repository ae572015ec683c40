//! 作用域注册
//!
//! 每个作用域模块提供候选对象类型和它的描述符注册函数。

pub mod cart;
pub mod customer;

pub use cart::{Cart, CartItem};
pub use customer::Customer;

use crate::catalog::CatalogBuilder;
use crate::error::Result;
use crate::models::Scope;
use crate::value::Value;

/// 可被内存评估的候选对象
///
/// 按描述符的属性名读取值，读不到时返回 None，由评估器按"不匹配"处理。
pub trait Candidate {
    fn attribute(&self, name: &str) -> Option<Value>;
}

/// 按构建器的作用域注册对应描述符
pub fn register(builder: &mut CatalogBuilder) -> Result<()> {
    match builder.scope() {
        Scope::Customer => customer::register(builder),
        Scope::Cart => cart::register(builder),
    }
}

/// 客户角色的可选值，Customer 与 Cart 作用域共用
pub(crate) fn customer_role_options() -> Vec<crate::catalog::SelectOption> {
    use crate::catalog::SelectOption;
    vec![
        SelectOption::new("Administrators", "管理员"),
        SelectOption::new("Registered", "注册用户"),
        SelectOption::new("Guests", "访客"),
        SelectOption::new("Vip", "VIP"),
    ]
}
