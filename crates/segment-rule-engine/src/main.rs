//! 客户分群预览工具
//!
//! 对给定规则集执行查询下推，以 JSON 输出匹配客户的分页结果。
//!
//! ```bash
//! # 预览规则集 3 或 5 命中的客户，第 2 页
//! segment-preview 3 5 --page 1 --page-size 20
//!
//! # 打印解析后的表达式树
//! segment-preview 3 --describe
//!
//! # 列出 Cart 作用域的规则描述符
//! segment-preview --list-descriptors --scope Cart
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rule_engine::{
    CatalogRegistry, CustomerSegmentQuery, PageRequest, QueryOptions, Scope, SegmentEngine,
    SqliteRuleStore, migrate,
};
use segment_shared::config::AppConfig;
use segment_shared::database::Database;
use segment_shared::observability;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// 客户分群预览
#[derive(Parser, Debug)]
#[command(name = "segment-preview")]
#[command(version, about = "按规则集预览客户分群")]
struct Cli {
    /// 规则集 ID，多个规则集之间为 Or
    rule_set_ids: Vec<i64>,

    /// 页码（从 0 开始）
    #[arg(long, default_value = "0")]
    page: u32,

    /// 每页数量，缺省使用配置中的 default_page_size
    #[arg(long)]
    page_size: Option<u32>,

    /// 查询超时（毫秒），缺省使用配置中的 query_timeout_ms
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// 只打印解析后的表达式树
    #[arg(long)]
    describe: bool,

    /// 只打印规则描述符目录
    #[arg(long)]
    list_descriptors: bool,

    /// --describe / --list-descriptors 使用的作用域
    #[arg(long, default_value = "Customer")]
    scope: Scope,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load("segment-preview").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });

    let obs_config = config.observability.clone().with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config)?;

    let catalogs = Arc::new(CatalogRegistry::with_builtin_scopes()?);

    if cli.list_descriptors {
        let descriptors = catalogs.get_descriptors(cli.scope);
        println!("{}", serde_json::to_string_pretty(&descriptors)?);
        return Ok(());
    }

    let db = Database::connect(&config.database)
        .await
        .context("连接数据库失败")?;
    migrate(db.pool()).await?;

    if cli.describe {
        let store = SqliteRuleStore::new(db.pool().clone());
        let engine = SegmentEngine::new(catalogs, Arc::new(store), config.engine.clone());
        let trees = engine.build_many(cli.scope, &cli.rule_set_ids).await?;
        for tree in &trees {
            info!(rule_set_id = tree.rule_set_id, "{}", tree);
        }
        println!("{}", serde_json::to_string_pretty(&trees)?);
        db.close().await;
        return Ok(());
    }

    let page = PageRequest::new(
        cli.page,
        cli.page_size.unwrap_or(config.engine.default_page_size),
    );

    // Ctrl+C 取消进行中的查询
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, cancelling query...");
            let _ = cancel_tx.send(true);
        }
    });

    let mut options = QueryOptions::default().with_cancel(cancel_rx);
    if let Some(ms) = cli.timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    let query = CustomerSegmentQuery::new(db.pool().clone(), catalogs, config.engine.clone());
    let result = query.find_customers(&cli.rule_set_ids, page, options).await;
    db.close().await;

    let result = result?;
    info!(
        total = result.total_count,
        pages = result.total_pages(),
        "Preview complete"
    );
    println!("{}", serde_json::to_string_pretty(&result)?);

    Ok(())
}
