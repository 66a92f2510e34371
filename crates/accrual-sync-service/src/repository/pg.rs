//! PostgreSQL 仓储实现

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::traits::{JobRepositoryTrait, TransactionalStore, UnitOfWork};
use crate::error::{Result, SyncError, is_unique_violation};
use crate::models::{Balance, Job, NewOrder, Order, OrderStatus, UserId, Withdrawal};

const ORDER_COLUMNS: &str = "id, order_number, user_id, status, accrual, attempts, next_attempt, created_at, updated_at";

/// 基于 PostgreSQL 的订单、任务和余额存储
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobRepositoryTrait for PgStore {
    async fn enqueue(&self, order_id: i64) -> Result<i64> {
        let row = sqlx::query("INSERT INTO jobs (order_id) VALUES ($1) RETURNING id")
            .bind(order_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_job_insert_error(e, order_id))?;

        Ok(row.get("id"))
    }

    async fn fetch_due(&self, limit: i64) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            r#"
            SELECT j.id, j.order_id, o.order_number, j.created_at, j.pooled_at
            FROM jobs j
            JOIN orders o ON o.id = j.order_id
            WHERE o.next_attempt IS NULL OR o.next_attempt <= NOW()
            ORDER BY j.created_at ASC, j.pooled_at ASC NULLS FIRST, j.id ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn touch(&self, job_id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET pooled_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn remove(&self, job_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl TransactionalStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    async fn get_order_by_number(&self, order_number: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = $1"
        ))
        .bind(order_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn get_balance(&self, user_id: UserId) -> Result<Balance> {
        let row = sqlx::query(
            r#"
            SELECT u.balance,
                   COALESCE((SELECT SUM(w.amount) FROM withdrawals w WHERE w.user_id = u.id), 0) AS withdrawn
            FROM users u
            WHERE u.id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Balance {
                current: row.get("balance"),
                withdrawn: row.get("withdrawn"),
            }),
            None => Err(SyncError::Internal(format!("用户不存在: {}", user_id))),
        }
    }
}

/// 持有一个 PostgreSQL 事务
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn lock_order(&mut self, order_id: i64) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1 FOR UPDATE"
        ))
        .bind(order_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(order)
    }

    async fn find_order_by_number(&mut self, order_number: &str) -> Result<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE order_number = $1"
        ))
        .bind(order_number)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(order)
    }

    async fn insert_order(&mut self, order: &NewOrder) -> Result<Option<Order>> {
        let inserted = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders (order_number, user_id, status)
            VALUES ($1, $2, $3)
            ON CONFLICT (order_number) DO NOTHING
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(&order.order_number)
        .bind(order.user_id)
        .bind(OrderStatus::New)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(inserted)
    }

    async fn insert_job(&mut self, order_id: i64) -> Result<i64> {
        let row = sqlx::query("INSERT INTO jobs (order_id) VALUES ($1) RETURNING id")
            .bind(order_id)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_job_insert_error(e, order_id))?;

        Ok(row.get("id"))
    }

    async fn update_order_state(
        &mut self,
        order_id: i64,
        status: OrderStatus,
        accrual: Option<Decimal>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(accrual)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn record_attempt(&mut self, order_id: i64, next_attempt: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET attempts = attempts + 1, next_attempt = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id)
        .bind(next_attempt)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn touch_job(&mut self, job_id: i64) -> Result<()> {
        sqlx::query("UPDATE jobs SET pooled_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_job(&mut self, job_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(job_id)
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn credit_balance(&mut self, user_id: UserId, amount: Decimal) -> Result<()> {
        let result = sqlx::query("UPDATE users SET balance = balance + $2 WHERE id = $1")
            .bind(user_id)
            .bind(amount)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(SyncError::Internal(format!("用户不存在: {}", user_id)));
        }
        Ok(())
    }

    async fn debit_balance(&mut self, user_id: UserId, amount: Decimal) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET balance = balance - $2 WHERE id = $1 AND balance >= $2",
        )
        .bind(user_id)
        .bind(amount)
        .execute(&mut *self.tx)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_withdrawal(
        &mut self,
        user_id: UserId,
        order_number: &str,
        amount: Decimal,
    ) -> Result<Withdrawal> {
        let withdrawal = sqlx::query_as::<_, Withdrawal>(
            r#"
            INSERT INTO withdrawals (user_id, order_number, amount)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, order_number, amount, created_at
            "#,
        )
        .bind(user_id)
        .bind(order_number)
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                SyncError::OrderAlreadySubmitted(order_number.to_string())
            } else {
                SyncError::Database(e)
            }
        })?;

        Ok(withdrawal)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        this.tx.commit().await?;
        Ok(())
    }
}

fn map_job_insert_error(err: sqlx::Error, order_id: i64) -> SyncError {
    if is_unique_violation(&err) {
        SyncError::DuplicateJob(order_id)
    } else {
        SyncError::Database(err)
    }
}
