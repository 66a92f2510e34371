//! 积分同步服务入口
//!
//! 启动顺序：配置 -> 可观测性 -> 数据库（带重试）-> 迁移 -> 同步器。

use std::sync::Arc;
use std::time::Duration;

use accrual_sync::{AccrualClient, AccrualSynchronizer, PgStore};
use anyhow::Context;
use loyalty_shared::{
    config::AppConfig, database::Database, observability, retry::RetryPolicy,
};
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("accrual-sync-service").context("加载配置失败")?;

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config).await?;

    // 配置不一致时拒绝启动
    if let Err(e) = config.accrual.validate() {
        error!(error = %e, code = e.code(), "配置校验失败");
        return Err(e.into());
    }

    info!(
        environment = %config.environment,
        accrual_url = %config.accrual.base_url,
        worker_count = config.accrual.worker_count,
        "Starting accrual-sync-service"
    );

    let startup_policy = RetryPolicy {
        max_retries: 5,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        multiplier: 2.0,
    };
    let db = Database::connect_with_retry(&config.database, &startup_policy)
        .await
        .context("数据库连接失败")?;

    if config.database.run_migrations {
        db.run_migrations().await.context("数据库迁移失败")?;
    }

    let store = Arc::new(PgStore::new(db.pool().clone()));
    let gateway = Arc::new(AccrualClient::from_config(&config.accrual)?);
    let synchronizer = AccrualSynchronizer::new(store, gateway, &config.accrual);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync_handle = tokio::spawn(synchronizer.run(shutdown_rx));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    if let Err(e) = sync_handle.await {
        error!(error = %e, "积分同步器异常退出");
    }

    db.close().await;
    info!("accrual-sync-service shutdown complete");

    Ok(())
}

/// 监听关闭信号
///
/// K8s 通过 SIGTERM 通知 Pod 停止；本地开发通过 Ctrl+C。
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
    }
}
