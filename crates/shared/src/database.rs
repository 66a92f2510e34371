//! 数据库连接管理模块
//!
//! 提供 PostgreSQL 连接池管理、健康检查和迁移执行。

use crate::config::DatabaseConfig;
use crate::error::{LoyaltyError, Result};
use crate::retry::{RetryPolicy, retry_with_policy};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// 迁移脚本位于仓库根目录，编译时嵌入二进制
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("../../migrations");

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 创建数据库连接池
    #[instrument(skip(config))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to database...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await
            .map_err(map_connect_error)?;

        info!("Database connection pool created");

        Ok(Self { pool })
    }

    /// 带退避重试的连接
    ///
    /// 容器编排下数据库常晚于服务就绪，启动阶段按策略重试瞬时错误。
    pub async fn connect_with_retry(config: &DatabaseConfig, policy: &RetryPolicy) -> Result<Self> {
        retry_with_policy(policy, "connect_database", LoyaltyError::is_retryable, || {
            Self::connect(config)
        })
        .await
    }

    /// 由现有连接池构造，测试中使用
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(LoyaltyError::from)
    }

    /// 关闭连接池
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }

    /// 执行尚未应用的迁移
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        MIGRATOR.run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

/// 获取连接超时归为外部服务超时，其余保持数据库错误
fn map_connect_error(err: sqlx::Error) -> LoyaltyError {
    match err {
        sqlx::Error::PoolTimedOut => LoyaltyError::ExternalServiceTimeout {
            service: "postgres".to_string(),
        },
        other => LoyaltyError::Database(other),
    }
}

impl std::ops::Deref for Database {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}
