//! 全局限流退避
//!
//! 外部服务返回 429 后，所有 Worker 和调度器在冷却期内都不再发起查询。
//! 冷却截止时间使用 tokio 时钟，测试中可以暂停并推进时间。

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

use loyalty_shared::observability::metrics;

/// 限流退避控制器
///
/// 在调度器和所有 Worker 之间共享，是唯一有意的跨 Worker 同步点。
#[derive(Debug)]
pub struct BackoffController {
    paused_until: Mutex<Option<Instant>>,
    default_cooldown: Duration,
}

impl BackoffController {
    pub fn new(default_cooldown: Duration) -> Self {
        Self {
            paused_until: Mutex::new(None),
            default_cooldown,
        }
    }

    /// 进入冷却期，返回本次请求的冷却时长
    ///
    /// 已处于冷却期时保留更晚的截止时间。
    pub fn trip(&self, retry_after: Option<u64>) -> Duration {
        let cooldown = retry_after
            .map(Duration::from_secs)
            .unwrap_or(self.default_cooldown);
        let deadline = Instant::now() + cooldown;

        let mut paused_until = self.paused_until.lock();
        let extended = match *paused_until {
            Some(current) if current >= deadline => false,
            _ => {
                *paused_until = Some(deadline);
                true
            }
        };
        drop(paused_until);

        if extended {
            warn!(cooldown_secs = cooldown.as_secs(), "积分服务限流，暂停所有查询");
            metrics::record_rate_limit_pause(cooldown.as_secs_f64());
        }
        cooldown
    }

    /// 冷却期剩余时间，不在冷却期返回 None
    pub fn remaining(&self) -> Option<Duration> {
        let mut paused_until = self.paused_until.lock();
        match *paused_until {
            Some(deadline) => {
                let now = Instant::now();
                if deadline > now {
                    Some(deadline - now)
                } else {
                    *paused_until = None;
                    None
                }
            }
            None => None,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.remaining().is_some()
    }

    /// 等待冷却期结束
    ///
    /// 返回 false 表示等待期间收到了关闭信号。
    pub async fn wait_until_resumed(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        let mut waited = false;
        while let Some(remaining) = self.remaining() {
            waited = true;
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return false;
                    }
                }
            }
        }
        if waited {
            info!("限流冷却结束，恢复查询");
        }
        !*shutdown.borrow()
    }
}
