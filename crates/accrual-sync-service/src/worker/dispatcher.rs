//! 任务调度器
//!
//! 按固定间隔从任务队列拉取到期任务，投递到有界通道供 Worker 消费。
//! 通道满时阻塞，从而把外部服务的处理速度反压到拉取节奏上。

use std::sync::Arc;
use std::time::Duration;

use loyalty_shared::observability::metrics;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::backoff::BackoffController;
use crate::models::Job;
use crate::repository::JobRepositoryTrait;

/// 任务调度器
pub struct Dispatcher<J: ?Sized> {
    jobs: Arc<J>,
    backoff: Arc<BackoffController>,
    poll_interval: Duration,
    fetch_limit: i64,
}

impl<J> Dispatcher<J>
where
    J: JobRepositoryTrait + ?Sized,
{
    pub fn new(
        jobs: Arc<J>,
        backoff: Arc<BackoffController>,
        poll_interval: Duration,
        fetch_limit: i64,
    ) -> Self {
        Self {
            jobs,
            backoff,
            poll_interval,
            fetch_limit,
        }
    }

    /// 主循环：直到收到关闭信号
    ///
    /// 返回时 `sender` 被 drop，Worker 在消费完通道后退出。
    pub async fn run(self, sender: mpsc::Sender<Job>, mut shutdown: watch::Receiver<bool>) {
        info!(
            poll_interval = ?self.poll_interval,
            fetch_limit = self.fetch_limit,
            "积分同步调度器已启动"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'outer: loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            metrics::set_worker_last_run("accrual_dispatcher");

            if let Some(remaining) = self.backoff.remaining() {
                debug!(remaining_secs = remaining.as_secs(), "限流冷却中，跳过本轮拉取");
                continue;
            }

            let jobs = match self.jobs.fetch_due(self.fetch_limit).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    // 等待下一个完整周期
                    error!(error = %e, "拉取同步任务失败");
                    continue;
                }
            };

            if jobs.is_empty() {
                continue;
            }

            debug!(count = jobs.len(), "拉取到待同步任务");
            let total = jobs.len();
            let mut sent = 0;
            for job in jobs {
                tokio::select! {
                    res = sender.send(job) => {
                        if res.is_err() {
                            // 所有 Worker 已退出
                            break 'outer;
                        }
                        sent += 1;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                    }
                }
            }
            metrics::record_jobs_dispatched(sent);
            debug!(sent, total, "本轮任务投递完成");
        }

        info!("积分同步调度器已停止");
    }
}
