//! 积分同步后台任务
//!
//! 一个调度器加 `worker_count` 个 Worker，通过有界通道连接：
//! - [`Dispatcher`]: 定时拉取到期任务
//! - [`SyncWorker`]: 调用外部服务并应用状态迁移
//! - [`AccrualSynchronizer`]: 组装两者并负责优雅关闭

pub mod dispatcher;
pub mod pool;

pub use dispatcher::Dispatcher;
pub use pool::{JobOutcome, SharedReceiver, SyncWorker};

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use loyalty_shared::config::AccrualConfig;
use loyalty_shared::retry::RetryPolicy;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info};

use crate::backoff::BackoffController;
use crate::gateway::AccrualGateway;
use crate::repository::{JobRepositoryTrait, TransactionalStore};
use crate::transition::TransitionEngine;

/// 积分同步器
pub struct AccrualSynchronizer<S, G> {
    store: Arc<S>,
    gateway: Arc<G>,
    backoff: Arc<BackoffController>,
    policy: RetryPolicy,
    poll_interval: Duration,
    worker_count: usize,
    fetch_limit: i64,
}

impl<S, G> AccrualSynchronizer<S, G>
where
    S: JobRepositoryTrait + TransactionalStore + 'static,
    G: AccrualGateway + 'static,
{
    pub fn new(store: Arc<S>, gateway: Arc<G>, config: &AccrualConfig) -> Self {
        Self {
            store,
            gateway,
            backoff: Arc::new(BackoffController::new(config.default_retry_after())),
            policy: RetryPolicy::for_accrual(config),
            poll_interval: config.poll_interval(),
            worker_count: config.worker_count.max(1),
            fetch_limit: config.fetch_limit,
        }
    }

    /// 共享的限流控制器
    pub fn backoff(&self) -> Arc<BackoffController> {
        self.backoff.clone()
    }

    /// 运行直到收到关闭信号
    ///
    /// 关闭时先停止拉取，再关闭通道并等待所有 Worker 完成手头的任务。
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let (sender, receiver) = mpsc::channel(self.worker_count);
        let receiver: SharedReceiver = Arc::new(Mutex::new(receiver));
        let engine = Arc::new(TransitionEngine::new(self.store.clone(), self.policy.clone()));

        let mut handles = Vec::with_capacity(self.worker_count);
        for id in 0..self.worker_count {
            let worker = SyncWorker::new(
                id,
                self.gateway.clone(),
                engine.clone(),
                self.backoff.clone(),
            );
            handles.push(tokio::spawn(worker.run(receiver.clone(), shutdown.clone())));
        }
        info!(worker_count = self.worker_count, "积分同步 Worker 池已启动");

        let dispatcher = Dispatcher::new(
            self.store.clone(),
            self.backoff.clone(),
            self.poll_interval,
            self.fetch_limit,
        );
        dispatcher.run(sender, shutdown).await;

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "同步 Worker 异常退出");
            }
        }
        info!("积分同步器已停止");
    }
}
