use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::config::BackoffKind;

/// 轮询重试之间的等待策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// 固定间隔
    Fixed(Duration),
    /// 指数增长，封顶为 `max`，带少量抖动
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    pub fn new(kind: BackoffKind, interval: Duration) -> Self {
        match kind {
            BackoffKind::Fixed => Backoff::Fixed(interval),
            BackoffKind::Exponential => Backoff::Exponential {
                base: interval,
                max: interval.saturating_mul(8),
            },
        }
    }

    /// 第 `attempt` 次失败后的等待时长，从 0 开始计数
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
                let delay = base.saturating_mul(factor).min(max);
                delay + jitter(base / 4)
            }
        }
    }

    /// 单次轮询的最长间隔，用于估算超时误差
    pub fn max_delay(&self) -> Duration {
        match *self {
            Backoff::Fixed(interval) => interval,
            Backoff::Exponential { base, max } => max + base / 4,
        }
    }
}

// 用纳秒数做简单抖动，不需要引入随机数依赖
fn jitter(limit: Duration) -> Duration {
    let limit_nanos = limit.as_nanos() as u64;
    if limit_nanos == 0 {
        return Duration::ZERO;
    }
    let seed = u64::from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    Duration::from_nanos(seed % limit_nanos)
}
