//! 类型化的规则值
//!
//! 规则在持久层中以字符串保存操作数，构建表达式时按描述符的数据类型解析成 [`Value`]。
//! 候选对象（购物车、客户）也以同一类型暴露属性，两侧在内存评估时直接比较。

use chrono::NaiveDate;
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;

use crate::catalog::DataType;

/// 日期的文本格式，与数据库中保存的格式一致
pub const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Int(i64),
    Decimal(f64),
    Bool(bool),
    Date(NaiveDate),
    /// 枚举集合（如客户角色）
    TextList(Vec<String>),
    /// 实体 ID 集合（如商品 ID）
    IdList(Vec<i64>),
    /// 无操作数（IsEmpty）
    Empty,
}

impl Value {
    /// 按数据类型解析字符串形式的操作数
    ///
    /// 失败时返回可读的原因，由调用方包装成带规则 ID 的错误。
    pub fn parse(data_type: DataType, raw: &str) -> Result<Value, String> {
        match data_type {
            DataType::String => Ok(Value::Text(raw.to_string())),
            DataType::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| format!("期望整数: {}", e)),
            DataType::Decimal => {
                let n = raw
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| format!("期望小数: {}", e))?;
                if !n.is_finite() {
                    return Err("小数必须是有限值".to_string());
                }
                Ok(Value::Decimal(n))
            }
            DataType::Bool => match raw.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err("期望 true 或 false".to_string()),
            },
            DataType::Date => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
                .map(Value::Date)
                .map_err(|e| format!("期望日期 YYYY-MM-DD: {}", e)),
            DataType::Enumeration => {
                let items = split_list(raw)
                    .into_iter()
                    .map(str::to_string)
                    .collect::<Vec<_>>();
                if items.is_empty() {
                    return Err("集合不能为空".to_string());
                }
                Ok(Value::TextList(dedup(items)))
            }
            DataType::EntityId => {
                let mut ids = Vec::new();
                for item in split_list(raw) {
                    let id = item
                        .parse::<i64>()
                        .map_err(|e| format!("无效的实体 ID '{}': {}", item, e))?;
                    ids.push(id);
                }
                if ids.is_empty() {
                    return Err("集合不能为空".to_string());
                }
                Ok(Value::IdList(dedup(ids)))
            }
        }
    }

    /// 标量比较，Int 与 Decimal 之间统一转为浮点数
    ///
    /// 类型不兼容或不是标量时返回 None。
    #[allow(clippy::cast_precision_loss)]
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Decimal(b)) => (*a as f64).partial_cmp(b),
            (Value::Decimal(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// 空文本与空集合视为空
    pub fn is_empty_value(&self) -> bool {
        match self {
            Value::Text(s) => s.is_empty(),
            Value::TextList(items) => items.is_empty(),
            Value::IdList(ids) => ids.is_empty(),
            Value::Empty => true,
            _ => false,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// 序列化回持久层的字符串形式
    pub fn to_raw(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Int(n) => n.to_string(),
            Value::Decimal(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Date(d) => d.format(DATE_FORMAT).to_string(),
            Value::TextList(items) => items.join(","),
            Value::IdList(ids) => ids
                .iter()
                .map(|id| id.to_string())
                .collect::<Vec<_>>()
                .join(","),
            Value::Empty => String::new(),
        }
    }
}

fn split_list(raw: &str) -> Vec<&str> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .collect()
}

fn dedup<T: PartialEq>(items: Vec<T>) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Text(s) => write!(f, "\"{}\"", s),
            Value::TextList(items) => write!(f, "[{}]", items.join(", ")),
            Value::IdList(_) => write!(f, "[{}]", self.to_raw().replace(',', ", ")),
            Value::Empty => Ok(()),
            other => f.write_str(&other.to_raw()),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Decimal(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::Date(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(Value::parse(DataType::Int, " 42 "), Ok(Value::Int(42)));
        assert_eq!(Value::parse(DataType::Decimal, "9.5"), Ok(Value::Decimal(9.5)));
        assert_eq!(Value::parse(DataType::Bool, "TRUE"), Ok(Value::Bool(true)));
        assert_eq!(
            Value::parse(DataType::Date, "2024-02-29"),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()))
        );
        // 字符串原样保留，不做 trim
        assert_eq!(
            Value::parse(DataType::String, " DE"),
            Ok(Value::Text(" DE".to_string()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(Value::parse(DataType::Int, "3.5").is_err());
        assert!(Value::parse(DataType::Decimal, "NaN").is_err());
        assert!(Value::parse(DataType::Decimal, "inf").is_err());
        assert!(Value::parse(DataType::Bool, "yes").is_err());
        assert!(Value::parse(DataType::Date, "2023-02-29").is_err());
        assert!(Value::parse(DataType::EntityId, "1,x,3").is_err());
        assert!(Value::parse(DataType::Enumeration, " , ").is_err());
    }

    #[test]
    fn test_parse_lists_trim_and_dedup() {
        assert_eq!(
            Value::parse(DataType::Enumeration, "Vip, Registered,Vip"),
            Ok(Value::TextList(vec!["Vip".to_string(), "Registered".to_string()]))
        );
        assert_eq!(
            Value::parse(DataType::EntityId, "3, 1,3,"),
            Ok(Value::IdList(vec![3, 1]))
        );
    }

    #[test]
    fn test_compare_numeric_coercion() {
        assert_eq!(
            Value::Int(100).compare(&Value::Decimal(100.0)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Decimal(99.5).compare(&Value::Int(100)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Text("1".into()).compare(&Value::Int(1)), None);
        assert_eq!(Value::IdList(vec![1]).compare(&Value::IdList(vec![1])), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Text("DE".into()).to_string(), "\"DE\"");
        assert_eq!(Value::IdList(vec![1, 2]).to_string(), "[1, 2]");
        assert_eq!(Value::Decimal(12.5).to_string(), "12.5");
    }
}
