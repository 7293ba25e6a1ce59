use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{Backoff, LockManager, ReleaseNotifier, Waiter};
use crate::config::LockConfig;
use crate::error::CounterError;
use crate::store::MetaStore;
use crate::Result;

/// 租约在元数据存储中的字段名
pub const LOCK_FIELD: &str = "_dlc_lock";

/// 租约内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.acquired_at).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn is_expired(&self, expiry: Duration) -> bool {
        self.age() > expiry
    }
}

/// 存放在元数据存储中的租约锁
///
/// 占用靠 `create_field_if_absent`；已存在的租约超过 `expiry` 视为被遗弃，
/// 通过比较交换整体替换，两个回收者同时竞争时只有一个成功。
pub struct LeaseLock {
    resource_id: String,
    holder_id: String,
    meta: Arc<dyn MetaStore>,
    /// 持有期间写入的原始值，释放时据此确认所有权
    record: Option<String>,
    /// 正在尝试写入的值，取消 `acquire` 时 drop 据此清理
    pending: Option<String>,
    expiry: Duration,
    backoff: Backoff,
    timeout: Option<Duration>,
    notifier: Arc<ReleaseNotifier>,
}

impl LeaseLock {
    pub fn new(
        resource_id: &str,
        config: &LockConfig,
        meta: Arc<dyn MetaStore>,
        notifier: Arc<ReleaseNotifier>,
    ) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            holder_id: Uuid::new_v4().to_string(),
            meta,
            record: None,
            pending: None,
            expiry: config.lease_expiry(),
            backoff: Backoff::new(config.backoff, config.lease_poll_interval()),
            timeout: config.lease_wait_timeout(),
            notifier,
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// 尝试写入 `value`，成功返回 `true`
    async fn try_claim(&self, value: &str) -> Result<bool> {
        if self
            .meta
            .create_field_if_absent(&self.resource_id, LOCK_FIELD, value)
            .await?
        {
            return Ok(true);
        }

        let current = match self.meta.read_field(&self.resource_id, LOCK_FIELD).await? {
            Some(current) => current,
            // 刚被释放，下一轮再试
            None => return Ok(false),
        };

        let abandoned = match serde_json::from_str::<LeaseRecord>(&current) {
            Ok(lease) if lease.is_expired(self.expiry) => {
                warn!(
                    "Lease on resource {} held by {} is {:?} old, reclaiming",
                    self.resource_id,
                    lease.holder,
                    lease.age()
                );
                true
            }
            Ok(lease) => {
                debug!("Resource {} leased by {}", self.resource_id, lease.holder);
                false
            }
            Err(e) => {
                warn!("Unreadable lease on resource {} ({}), reclaiming", self.resource_id, e);
                true
            }
        };

        if abandoned
            && self
                .meta
                .compare_and_swap(
                    &self.resource_id,
                    LOCK_FIELD,
                    Some(current.as_str()),
                    Some(value),
                )
                .await?
        {
            info!("Reclaimed stale lease on resource {}", self.resource_id);
            return Ok(true);
        }

        Ok(false)
    }
}

#[async_trait]
impl LockManager for LeaseLock {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn is_locked(&self) -> bool {
        self.record.is_some()
    }

    async fn acquire(&mut self) -> Result<()> {
        if self.record.is_some() {
            return Err(CounterError::AlreadyLocked(self.resource_id.clone()));
        }

        let released = self.notifier.channel(&self.resource_id);
        let mut waiter = Waiter::new(self.backoff, self.timeout);

        loop {
            let notified = released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // 先记下待写入的值，写入后再被取消也能在 drop 时删除
            let value = serde_json::to_string(&LeaseRecord::new(&self.holder_id))?;
            self.pending = Some(value.clone());

            // 存储层的瞬时失败按"尚未获得"处理
            let claimed = self.try_claim(&value).await;
            self.pending = None;
            match claimed {
                Ok(true) => {
                    self.record = Some(value);
                    debug!(
                        "Acquired lease on resource {} after {} retries",
                        self.resource_id,
                        waiter.attempts()
                    );
                    return Ok(());
                }
                Ok(false) => {}
                Err(e) => warn!("Lease attempt on resource {} failed: {}", self.resource_id, e),
            }

            waiter.wait(&self.resource_id, notified).await?;
        }
    }

    async fn release(&mut self) -> Result<()> {
        let record = match self.record.as_deref() {
            Some(record) => record,
            None => return Err(CounterError::NotLocked(self.resource_id.clone())),
        };

        let deleted = self
            .meta
            .compare_and_swap(&self.resource_id, LOCK_FIELD, Some(record), None)
            .await?;
        if !deleted {
            warn!(
                "Lease on resource {} was reclaimed by another holder before release",
                self.resource_id
            );
        }

        self.record = None;
        self.notifier.notify_released(&self.resource_id);
        Ok(())
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        // 比较交换删除只会删掉自己写入的值
        let record = match self.record.take().or_else(|| self.pending.take()) {
            Some(record) => record,
            None => return,
        };

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    "No runtime to release lease on resource {}, it will expire",
                    self.resource_id
                );
                return;
            }
        };

        info!("Releasing abandoned lease on resource {}", self.resource_id);
        let meta = self.meta.clone();
        let notifier = self.notifier.clone();
        let resource_id = self.resource_id.clone();
        handle.spawn(async move {
            match meta
                .compare_and_swap(&resource_id, LOCK_FIELD, Some(record.as_str()), None)
                .await
            {
                Ok(_) => notifier.notify_released(&resource_id),
                Err(e) => error!("Failed to release lease on resource {}: {}", resource_id, e),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryMetaStore;
    use std::time::Instant;

    fn config(timeout_ms: Option<u64>, expiry_secs: u64) -> LockConfig {
        LockConfig {
            lease_poll_interval_ms: 20,
            lease_wait_timeout_ms: timeout_ms,
            lease_expiry_secs: expiry_secs,
            ..LockConfig::default()
        }
    }

    fn lease(meta: &Arc<MemoryMetaStore>, config: &LockConfig) -> LeaseLock {
        LeaseLock::new("42", config, meta.clone(), Arc::new(ReleaseNotifier::new()))
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let meta = Arc::new(MemoryMetaStore::new());
        let mut lock = lease(&meta, &config(Some(500), 30));

        assert!(matches!(lock.release().await, Err(CounterError::NotLocked(_))));
        lock.acquire().await.unwrap();
        assert!(lock.is_locked());
        assert!(matches!(lock.acquire().await, Err(CounterError::AlreadyLocked(_))));

        let stored = meta.read_field("42", LOCK_FIELD).await.unwrap().unwrap();
        let record: LeaseRecord = serde_json::from_str(&stored).unwrap();
        assert_eq!(record.holder, lock.holder_id());

        lock.release().await.unwrap();
        assert!(!lock.is_locked());
        assert_eq!(meta.read_field("42", LOCK_FIELD).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_live_lease_times_out() {
        let meta = Arc::new(MemoryMetaStore::new());
        let config = config(Some(300), 30);
        let mut holder = lease(&meta, &config);
        holder.acquire().await.unwrap();

        let mut contender = lease(&meta, &config);
        let started = Instant::now();
        let result = contender.acquire().await;
        let waited = started.elapsed();

        assert!(matches!(result, Err(CounterError::LockTimeout { .. })));
        assert!(waited >= Duration::from_millis(300));
        assert!(waited <= Duration::from_millis(300 + 20 + 150), "{:?}", waited);
        holder.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_lease_is_reclaimed_on_first_attempt() {
        let meta = Arc::new(MemoryMetaStore::new());
        let stale = LeaseRecord {
            holder: "crashed-worker".to_string(),
            acquired_at: Utc::now() - chrono::Duration::seconds(120),
        };
        meta.write_field("42", LOCK_FIELD, &serde_json::to_string(&stale).unwrap())
            .await
            .unwrap();

        let config = LockConfig {
            lease_poll_interval_ms: 500,
            ..config(Some(5000), 30)
        };
        let mut lock = lease(&meta, &config);
        let started = Instant::now();
        lock.acquire().await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));

        let stored = meta.read_field("42", LOCK_FIELD).await.unwrap().unwrap();
        assert!(stored.contains(lock.holder_id()));
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_release_after_takeover_leaves_new_lease() {
        let meta = Arc::new(MemoryMetaStore::new());
        let mut old = lease(&meta, &config(Some(500), 30));
        old.acquire().await.unwrap();

        // 模拟租约过期后被他人接管
        let takeover = serde_json::to_string(&LeaseRecord::new("new-holder")).unwrap();
        meta.write_field("42", LOCK_FIELD, &takeover).await.unwrap();

        old.release().await.unwrap();
        assert_eq!(meta.read_field("42", LOCK_FIELD).await.unwrap(), Some(takeover));
    }

    #[tokio::test]
    async fn test_unbounded_wait_when_timeout_disabled() {
        let meta = Arc::new(MemoryMetaStore::new());
        let config = config(Some(0), 30);
        assert_eq!(config.lease_wait_timeout(), None);

        let mut holder = lease(&meta, &config);
        holder.acquire().await.unwrap();

        let mut contender = lease(&meta, &config);
        let outcome = tokio::time::timeout(Duration::from_millis(200), contender.acquire()).await;
        assert!(outcome.is_err(), "acquire should still be waiting");
        holder.release().await.unwrap();
    }

    /// 每次比较交换完成后再让出一次，使 `acquire` 可在写入之后被取消
    struct YieldingStore {
        inner: Arc<MemoryMetaStore>,
    }

    #[async_trait]
    impl MetaStore for YieldingStore {
        async fn read_field(&self, id: &str, field: &str) -> Result<Option<String>> {
            self.inner.read_field(id, field).await
        }

        async fn write_field(&self, id: &str, field: &str, value: &str) -> Result<()> {
            self.inner.write_field(id, field, value).await
        }

        async fn delete_field(&self, id: &str, field: &str) -> Result<()> {
            self.inner.delete_field(id, field).await
        }

        async fn compare_and_swap(
            &self,
            id: &str,
            field: &str,
            expected: Option<&str>,
            new: Option<&str>,
        ) -> Result<bool> {
            let swapped = self.inner.compare_and_swap(id, field, expected, new).await?;
            tokio::task::yield_now().await;
            Ok(swapped)
        }
    }

    #[tokio::test]
    async fn test_cancelled_acquire_releases_written_lease() {
        let inner = Arc::new(MemoryMetaStore::new());
        let meta: Arc<dyn MetaStore> = Arc::new(YieldingStore { inner: inner.clone() });
        let config = config(Some(300), 30);
        let notifier = Arc::new(ReleaseNotifier::new());

        {
            let mut lock = LeaseLock::new("42", &config, meta.clone(), notifier.clone());
            let cancelled = tokio::select! {
                biased;
                _ = lock.acquire() => false,
                _ = std::future::ready(()) => true,
            };
            assert!(cancelled);
            assert!(!lock.is_locked());
            // 值已经写入，只是还没有确认
            assert!(inner.read_field("42", LOCK_FIELD).await.unwrap().is_some());
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(inner.read_field("42", LOCK_FIELD).await.unwrap(), None);

        let mut next = LeaseLock::new("42", &config, meta, notifier);
        next.acquire().await.unwrap();
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_releases_lease() {
        let meta = Arc::new(MemoryMetaStore::new());
        {
            let mut lock = lease(&meta, &config(Some(500), 30));
            lock.acquire().await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(meta.read_field("42", LOCK_FIELD).await.unwrap(), None);
    }
}
