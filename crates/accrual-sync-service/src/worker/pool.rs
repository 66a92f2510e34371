//! 同步 Worker
//!
//! 多个 Worker 共享同一个通道接收端，各自独立调用外部服务并应用状态迁移。
//! 单个任务的任何错误都只记录日志，不会让 Worker 退出。

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffController;
use crate::error::Result;
use crate::gateway::{AccrualGateway, LookupOutcome, RemoteStatus};
use crate::models::Job;
use crate::repository::TransactionalStore;
use crate::transition::{TransitionEngine, TransitionResult};

/// 多 Worker 共享的任务接收端
pub type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// 单个任务的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Transitioned(TransitionResult),
    /// 触发限流，任务原样保留
    Throttled,
    /// 等待冷却期间收到关闭信号，未处理
    Cancelled,
}

/// 同步 Worker
pub struct SyncWorker<S: ?Sized, G: ?Sized> {
    id: usize,
    gateway: Arc<G>,
    engine: Arc<TransitionEngine<S>>,
    backoff: Arc<BackoffController>,
}

impl<S, G> SyncWorker<S, G>
where
    S: TransactionalStore + ?Sized,
    G: AccrualGateway + ?Sized,
{
    pub fn new(
        id: usize,
        gateway: Arc<G>,
        engine: Arc<TransitionEngine<S>>,
        backoff: Arc<BackoffController>,
    ) -> Self {
        Self {
            id,
            gateway,
            engine,
            backoff,
        }
    }

    /// 主循环：通道关闭后退出
    ///
    /// 收到关闭信号后不再处理通道中积压的任务，这些任务仍保留在队列里。
    pub async fn run(self, receiver: SharedReceiver, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = self.id, "同步 Worker 已启动");

        loop {
            let job = {
                let mut rx = receiver.lock().await;
                rx.recv().await
            };
            let Some(job) = job else {
                break;
            };

            if *shutdown.borrow() {
                continue;
            }

            match self.process(&job, &mut shutdown).await {
                Ok(outcome) => {
                    debug!(worker_id = self.id, job_id = job.id, ?outcome, "任务处理完成");
                }
                Err(e) => {
                    error!(
                        worker_id = self.id,
                        job_id = job.id,
                        order_number = %job.order_number,
                        error = %e,
                        "任务处理失败，保留任务等待下次同步"
                    );
                }
            }
        }

        info!(worker_id = self.id, "同步 Worker 已停止");
    }

    /// 处理单个任务
    pub async fn process(
        &self,
        job: &Job,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<JobOutcome> {
        if !self.backoff.wait_until_resumed(shutdown).await {
            return Ok(JobOutcome::Cancelled);
        }

        let outcome = self.gateway.lookup(&job.order_number).await;

        let result = match outcome {
            LookupOutcome::Resolved {
                status: RemoteStatus::Known(status),
                accrual,
            } => self.engine.apply(job, status, accrual).await?,
            LookupOutcome::Resolved {
                status: RemoteStatus::Unrecognized(raw),
                ..
            } => {
                warn!(
                    job_id = job.id,
                    order_number = %job.order_number,
                    status = %raw,
                    "积分服务返回未知状态，推迟订单"
                );
                self.engine.hold(job, &raw).await?
            }
            LookupOutcome::NotYetRegistered => self.engine.defer(job, "not_registered").await?,
            LookupOutcome::ExternalUnavailable => {
                warn!(
                    job_id = job.id,
                    order_number = %job.order_number,
                    "积分服务不可用，稍后重试"
                );
                self.engine.defer(job, "unavailable").await?
            }
            LookupOutcome::ProtocolError { detail } => {
                warn!(
                    job_id = job.id,
                    order_number = %job.order_number,
                    detail = %detail,
                    "积分服务响应不符合约定"
                );
                self.engine.defer(job, "protocol_error").await?
            }
            LookupOutcome::RateLimited { retry_after } => {
                let cooldown = self.backoff.trip(retry_after);
                info!(
                    worker_id = self.id,
                    job_id = job.id,
                    cooldown_secs = cooldown.as_secs(),
                    "触发限流，等待冷却"
                );
                self.backoff.wait_until_resumed(shutdown).await;
                return Ok(JobOutcome::Throttled);
            }
        };

        Ok(JobOutcome::Transitioned(result))
    }
}
