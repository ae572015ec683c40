//! 集成测试公共工具

#![allow(dead_code)]

use chrono::NaiveDate;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rule_engine::scopes::customer::CUSTOMER_COLUMNS;
use rule_engine::{
    CatalogRegistry, Customer, CustomerSegmentQuery, SegmentEngine, SqliteRuleStore, migrate,
};
use segment_shared::config::EngineConfig;
use segment_shared::database::Database;
use sqlx::SqlitePool;
use std::sync::Arc;

pub struct TestEnv {
    pub db: Database,
    pub store: Arc<SqliteRuleStore>,
    pub engine: SegmentEngine,
    pub query: CustomerSegmentQuery,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(EngineConfig::default()).await
    }

    pub async fn with_config(config: EngineConfig) -> Self {
        let db = Database::in_memory().await.unwrap();
        migrate(db.pool()).await.unwrap();

        let catalogs = Arc::new(CatalogRegistry::with_builtin_scopes().unwrap());
        let store = Arc::new(SqliteRuleStore::new(db.pool().clone()));
        let engine = SegmentEngine::new(catalogs.clone(), store.clone(), config.clone());
        let query = CustomerSegmentQuery::new(db.pool().clone(), catalogs, config);

        Self {
            db,
            store,
            engine,
            query,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        self.db.pool()
    }
}

/// 批量写入客户
pub async fn insert_customers(pool: &SqlitePool, customers: &[Customer]) {
    let mut tx = pool.begin().await.unwrap();
    for c in customers {
        sqlx::query(
            r#"
            INSERT INTO customers
                (id, email, country, total_orders, total_spent, registered_on,
                 is_tax_exempt, customer_role, store_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(c.id)
        .bind(&c.email)
        .bind(&c.country)
        .bind(c.total_orders)
        .bind(c.total_spent)
        .bind(c.registered_on)
        .bind(c.is_tax_exempt)
        .bind(&c.customer_role)
        .bind(c.store_id)
        .execute(&mut *tx)
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();
}

/// 读出全部客户，按 id 升序
pub async fn all_customers(pool: &SqlitePool) -> Vec<Customer> {
    sqlx::query_as::<_, Customer>(&format!(
        "SELECT {} FROM customers ORDER BY id",
        CUSTOMER_COLUMNS
    ))
    .fetch_all(pool)
    .await
    .unwrap()
}

pub fn customer(id: i64, country: &str, total_orders: i64) -> Customer {
    Customer {
        country: Some(country.to_string()),
        total_orders: Some(total_orders),
        ..Customer::new(id, format!("c{}@example.com", id))
    }
}

pub const COUNTRIES: [&str; 5] = ["DE", "AT", "FR", "NL", ""];
pub const ROLES: [&str; 4] = ["Administrators", "Registered", "Guests", "Vip"];
pub const DOMAINS: [&str; 3] = ["example.com", "example.org", "shop.de"];

/// 生成合成客户，约一成的可空列为 NULL
///
/// 同一个种子总是生成同一批客户。
pub fn synthetic_customers(count: i64, seed: u64) -> Vec<Customer> {
    let mut rng = StdRng::seed_from_u64(seed);
    (1..=count)
        .map(|id| {
            let nullable = |rng: &mut StdRng| rng.random_bool(0.9);
            let email = format!("user{}@{}", id, pick(&mut rng, &DOMAINS));
            Customer {
                id,
                email,
                country: nullable(&mut rng).then(|| pick(&mut rng, &COUNTRIES).to_string()),
                total_orders: nullable(&mut rng).then(|| rng.random_range(0..20)),
                total_spent: nullable(&mut rng)
                    .then(|| f64::from(rng.random_range(0..50_000u32)) / 100.0),
                registered_on: nullable(&mut rng).then(|| {
                    NaiveDate::from_ymd_opt(
                        rng.random_range(2019..2025),
                        rng.random_range(1..=12),
                        rng.random_range(1..=28),
                    )
                    .unwrap()
                }),
                is_tax_exempt: nullable(&mut rng).then(|| rng.random_bool(0.5)),
                customer_role: nullable(&mut rng).then(|| pick(&mut rng, &ROLES).to_string()),
                store_id: nullable(&mut rng).then(|| rng.random_range(1..=4)),
            }
        })
        .collect()
}

fn pick<'a>(rng: &mut StdRng, items: &[&'a str]) -> &'a str {
    items[rng.random_range(0..items.len())]
}
