//! PostgreSQL 存储集成测试
//!
//! 需要可用的数据库：
//! `DATABASE_URL=postgres://... cargo test -p accrual-sync-service -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use accrual_sync::{
    BalanceService, JobRepositoryTrait, OrderIntakeService, OrderStatus, PgStore,
    TransactionalStore, TransitionEngine, TransitionResult, UserId,
};
use chrono::Utc;
use loyalty_shared::database::Database;
use loyalty_shared::retry::RetryPolicy;
use rust_decimal::Decimal;
use sqlx::PgPool;

async fn setup() -> (PgPool, Arc<PgStore>) {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&url).await.unwrap();
    Database::from_pool(pool.clone())
        .run_migrations()
        .await
        .unwrap();
    let store = Arc::new(PgStore::new(pool.clone()));
    (pool, store)
}

async fn create_user(pool: &PgPool) -> UserId {
    let login = format!("user-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default());
    let id: i64 = sqlx::query_scalar("INSERT INTO users (login, password) VALUES ($1, 'x') RETURNING id")
        .bind(login)
        .fetch_one(pool)
        .await
        .unwrap();
    UserId(id)
}

/// 在给定前缀后追加 Luhn 校验位
fn luhn_number(prefix: u64) -> String {
    let digits: Vec<u32> = prefix
        .to_string()
        .chars()
        .filter_map(|c| c.to_digit(10))
        .collect();
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 0 {
                let doubled = d * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                d
            }
        })
        .sum();
    format!("{prefix}{}", (10 - sum % 10) % 10)
}

fn unique_number() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    luhn_number(nanos.unsigned_abs() % 1_000_000_000_000_000)
}

fn immediate_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: u32::MAX,
        initial_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        multiplier: 1.0,
    }
}

#[test]
fn test_luhn_number_helper() {
    assert_eq!(luhn_number(7992739871), "79927398713");
    assert!(accrual_sync::luhn::is_valid_order_number(&unique_number()));
}

#[tokio::test]
#[ignore]
async fn test_pg_intake_and_processed_transition() {
    let (pool, store) = setup().await;
    let user = create_user(&pool).await;
    let number = unique_number();

    let order = OrderIntakeService::new(store.clone())
        .submit(user, &number)
        .await
        .unwrap();
    assert_eq!(order.status, OrderStatus::New);

    let job = store
        .fetch_due(1000)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.order_id == order.id)
        .expect("new order should have a due job");
    assert_eq!(job.order_number, number);

    let engine = TransitionEngine::new(store.clone(), immediate_policy());
    let result = engine
        .apply(&job, OrderStatus::Processed, Some(Decimal::new(12345, 3)))
        .await
        .unwrap();
    assert!(matches!(result, TransitionResult::Finalized { .. }));

    let stored = store.get_order_by_number(&number).await.unwrap().unwrap();
    assert_eq!(stored.status, OrderStatus::Processed);
    assert_eq!(stored.accrual.unwrap().to_string(), "12.35");
    assert_eq!(
        store.get_balance(user).await.unwrap().current,
        Decimal::new(1235, 2)
    );

    // 重复投递不会重复入账
    let again = engine
        .apply(&job, OrderStatus::Processed, Some(Decimal::new(12345, 3)))
        .await
        .unwrap();
    assert_ne!(again, result);
    assert_eq!(
        store.get_balance(user).await.unwrap().current,
        Decimal::new(1235, 2)
    );
}

#[tokio::test]
#[ignore]
async fn test_pg_duplicate_submission_is_classified() {
    let (pool, store) = setup().await;
    let owner = create_user(&pool).await;
    let other = create_user(&pool).await;
    let number = unique_number();
    let intake = OrderIntakeService::new(store.clone());

    intake.submit(owner, &number).await.unwrap();

    let err = intake.submit(owner, &number).await.unwrap_err();
    assert_eq!(err.error_code(), "ORDER_ALREADY_SUBMITTED");
    let err = intake.submit(other, &number).await.unwrap_err();
    assert_eq!(err.error_code(), "ORDER_OWNED_BY_ANOTHER_USER");
}

#[tokio::test]
#[ignore]
async fn test_pg_deferred_job_leaves_due_set_until_next_attempt() {
    let (pool, store) = setup().await;
    let user = create_user(&pool).await;
    let number = unique_number();
    let order = OrderIntakeService::new(store.clone())
        .submit(user, &number)
        .await
        .unwrap();

    let job = store
        .fetch_due(1000)
        .await
        .unwrap()
        .into_iter()
        .find(|j| j.order_id == order.id)
        .unwrap();

    let policy = RetryPolicy {
        initial_delay: Duration::from_secs(3600),
        max_delay: Duration::from_secs(3600),
        ..immediate_policy()
    };
    TransitionEngine::new(store.clone(), policy)
        .defer(&job, "unavailable")
        .await
        .unwrap();

    let due = store.fetch_due(1000).await.unwrap();
    assert!(due.iter().all(|j| j.order_id != order.id));

    let stored = store.get_order_by_number(&number).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 1);
    assert!(stored.next_attempt.is_some());
}

#[tokio::test]
#[ignore]
async fn test_pg_withdraw_is_conditional() {
    let (pool, store) = setup().await;
    let user = create_user(&pool).await;
    sqlx::query("UPDATE users SET balance = 100 WHERE id = $1")
        .bind(user.0)
        .execute(&pool)
        .await
        .unwrap();
    let service = BalanceService::new(store.clone());

    let err = service
        .withdraw(user, &unique_number(), Decimal::new(101, 0))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), "INSUFFICIENT_BALANCE");

    service
        .withdraw(user, &unique_number(), Decimal::new(40, 0))
        .await
        .unwrap();
    let balance = service.balance(user).await.unwrap();
    assert_eq!(balance.current, Decimal::new(60, 0));
    assert_eq!(balance.withdrawn, Decimal::new(40, 0));
}
