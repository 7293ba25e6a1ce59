//! 按资源互斥的写锁
//!
//! 两种可互换的实现：
//! - [`FileLock`]：在锁目录中以独占方式创建标记文件
//! - [`LeaseLock`]：在元数据存储中写入带时间戳的租约，过期后可被回收
//!
//! 获取流程都是"尝试占用 -> 失败则等待 -> 重试"。同一进程内的等待者会在
//! 锁释放时被 [`ReleaseNotifier`] 唤醒，跨进程的竞争者只能依赖轮询。

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{LockConfig, LockStrategy};
use crate::error::CounterError;
use crate::plugin::Plugin;
use crate::store::MetaStore;
use crate::Result;

mod backoff;
mod file;
mod lease;

pub use backoff::Backoff;
pub use file::FileLock;
pub use lease::{LeaseLock, LeaseRecord, LOCK_FIELD};

/// 单个资源的锁句柄
#[async_trait]
pub trait LockManager: Send + Sync {
    fn resource_id(&self) -> &str;

    /// 当前句柄是否持有锁
    fn is_locked(&self) -> bool;

    /// 阻塞直到获得锁或超时。已持有时返回 [`CounterError::AlreadyLocked`]
    async fn acquire(&mut self) -> Result<()>;

    /// 释放锁。未持有时返回 [`CounterError::NotLocked`]
    async fn release(&mut self) -> Result<()>;
}

/// 进程内的释放通知
#[derive(Debug, Default)]
pub struct ReleaseNotifier {
    channels: Mutex<HashMap<String, Arc<Notify>>>,
}

impl ReleaseNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, resource_id: &str) -> Arc<Notify> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(resource_id.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    pub fn notify_released(&self, resource_id: &str) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(notify) = channels.get(resource_id) {
            notify.notify_waiters();
            // 没有等待者时回收条目
            if Arc::strong_count(notify) == 1 {
                channels.remove(resource_id);
            }
        }
    }
}

/// 获取循环中的等待与超时控制
pub(crate) struct Waiter {
    started: Instant,
    attempt: u32,
    backoff: Backoff,
    timeout: Option<Duration>,
}

impl Waiter {
    pub(crate) fn new(backoff: Backoff, timeout: Option<Duration>) -> Self {
        Self {
            started: Instant::now(),
            attempt: 0,
            backoff,
            timeout,
        }
    }

    /// 一次占用失败后调用：超时则返回错误，否则等待释放通知或下一个轮询间隔
    pub(crate) async fn wait(
        &mut self,
        resource_id: &str,
        released: Pin<&mut Notified<'_>>,
    ) -> Result<()> {
        let waited = self.started.elapsed();
        if let Some(timeout) = self.timeout {
            if waited >= timeout {
                warn!("Lock wait for resource {} timed out after {:?}", resource_id, waited);
                return Err(CounterError::LockTimeout {
                    resource: resource_id.to_string(),
                    waited,
                });
            }
        }

        let delay = self.backoff.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        debug!(
            "Resource {} is locked, attempt {} waiting up to {:?}",
            resource_id, self.attempt, delay
        );

        tokio::select! {
            _ = released => debug!("Woken by release of resource {}", resource_id),
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(())
    }

    pub(crate) fn attempts(&self) -> u32 {
        self.attempt
    }
}

/// 按配置创建锁句柄
pub struct LockProvider {
    config: LockConfig,
    meta: Arc<dyn MetaStore>,
    notifier: Arc<ReleaseNotifier>,
}

impl LockProvider {
    pub fn new(config: LockConfig, meta: Arc<dyn MetaStore>) -> Self {
        info!("Using {:?} lock strategy", config.strategy);
        Self {
            config,
            meta,
            notifier: Arc::new(ReleaseNotifier::new()),
        }
    }

    pub fn strategy(&self) -> LockStrategy {
        self.config.strategy
    }

    pub fn create_lock(&self, resource_id: &str) -> Box<dyn LockManager> {
        match self.config.strategy {
            LockStrategy::File => Box::new(FileLock::new(
                resource_id,
                &self.config,
                self.notifier.clone(),
            )),
            LockStrategy::Lease => Box::new(LeaseLock::new(
                resource_id,
                &self.config,
                self.meta.clone(),
                self.notifier.clone(),
            )),
        }
    }

    /// 获取锁并返回作用域守卫
    pub async fn lock(&self, resource_id: &str) -> Result<LockGuard> {
        let mut lock = self.create_lock(resource_id);
        lock.acquire().await?;
        Ok(LockGuard { lock })
    }
}

#[async_trait]
impl Plugin for LockProvider {
    fn name(&self) -> &str {
        "lock-provider"
    }

    async fn init(&self) -> Result<()> {
        if self.config.strategy == LockStrategy::File {
            tokio::fs::create_dir_all(&self.config.lock_dir).await?;
            info!("Lock directory ready: {:?}", self.config.lock_dir);
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        debug!("Lock provider shutting down");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        match self.config.strategy {
            LockStrategy::File => Ok(tokio::fs::metadata(&self.config.lock_dir)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false)),
            LockStrategy::Lease => Ok(true),
        }
    }
}

/// 持有中的锁。应显式调用 [`LockGuard::release`]；
/// 直接丢弃时由底层句柄兜底释放
pub struct LockGuard {
    lock: Box<dyn LockManager>,
}

impl LockGuard {
    pub fn resource_id(&self) -> &str {
        self.lock.resource_id()
    }

    pub async fn release(mut self) -> Result<()> {
        self.lock.release().await
    }
}
