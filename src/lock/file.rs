use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use std::fs::OpenOptions;
use std::io::Write;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Backoff, LockManager, ReleaseNotifier, Waiter};
use crate::config::LockConfig;
use crate::error::CounterError;
use crate::utils::safe_file_component;
use crate::Result;

const LOCK_FILE_PREFIX: &str = ".dlc-write-lock-";

/// 以标记文件实现的锁，文件存在即表示被占用
///
/// 互斥性完全依赖独占创建 (`O_CREAT | O_EXCL`)，获取方不会回收旧的标记文件，
/// 等待超过上限即返回 [`CounterError::LockTimeout`]。
pub struct FileLock {
    resource_id: String,
    path: PathBuf,
    owned: bool,
    backoff: Backoff,
    timeout: Duration,
    notifier: Arc<ReleaseNotifier>,
}

impl FileLock {
    pub fn new(resource_id: &str, config: &LockConfig, notifier: Arc<ReleaseNotifier>) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            path: Self::lock_path(&config.lock_dir, resource_id),
            owned: false,
            backoff: Backoff::new(config.backoff, config.file_poll_interval()),
            timeout: config.wait_timeout(),
            notifier,
        }
    }

    /// 锁文件路径只由资源 ID 决定
    pub fn lock_path(lock_dir: &Path, resource_id: &str) -> PathBuf {
        lock_dir.join(format!("{}{}", LOCK_FILE_PREFIX, safe_file_component(resource_id)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 独占创建标记文件，成功的同时记下所有权
    ///
    /// 创建与置位之间没有挂起点，`acquire` 被取消时标记文件总有主人，drop 会删掉它。
    fn try_claim(&mut self) -> Result<bool> {
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => {
                error!("Failed to create lock file {:?}: {}", self.path, e);
                return Err(e.into());
            }
        };
        self.owned = true;

        // 写入持有者信息，仅供排查
        let owner = format!("pid={} resource={}\n", std::process::id(), self.resource_id);
        if let Err(e) = file.write_all(owner.as_bytes()) {
            debug!("Could not write owner info to {:?}: {}", self.path, e);
        }
        Ok(true)
    }
}

#[async_trait]
impl LockManager for FileLock {
    fn resource_id(&self) -> &str {
        &self.resource_id
    }

    fn is_locked(&self) -> bool {
        self.owned
    }

    async fn acquire(&mut self) -> Result<()> {
        if self.owned {
            return Err(CounterError::AlreadyLocked(self.resource_id.clone()));
        }

        let released = self.notifier.channel(&self.resource_id);
        let mut waiter = Waiter::new(self.backoff, Some(self.timeout));

        loop {
            let notified = released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_claim()? {
                debug!(
                    "Acquired file lock {:?} after {} retries",
                    self.path,
                    waiter.attempts()
                );
                return Ok(());
            }

            waiter.wait(&self.resource_id, notified).await?;
        }
    }

    async fn release(&mut self) -> Result<()> {
        if !self.owned {
            return Err(CounterError::NotLocked(self.resource_id.clone()));
        }

        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Lock file {:?} vanished before release", self.path);
            }
            // 保持持有状态，drop 时再尝试删除
            Err(e) => return Err(e.into()),
        }

        self.owned = false;
        self.notifier.notify_released(&self.resource_id);
        debug!("Released file lock {:?}", self.path);
        Ok(())
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }

        info!("Releasing abandoned file lock {:?}", self.path);
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("Failed to remove lock file {:?}: {}", self.path, e),
        }
        self.owned = false;
        self.notifier.notify_released(&self.resource_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn config(lock_dir: &Path, poll_ms: u64, timeout_ms: u64) -> LockConfig {
        LockConfig {
            lock_dir: lock_dir.to_path_buf(),
            file_poll_interval_ms: poll_ms,
            wait_timeout_ms: timeout_ms,
            ..LockConfig::default()
        }
    }

    #[tokio::test]
    async fn test_lock_lifecycle() {
        let temp_dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(ReleaseNotifier::new());
        let mut lock = FileLock::new("42", &config(temp_dir.path(), 50, 500), notifier);

        assert!(!lock.is_locked());
        assert!(matches!(lock.release().await, Err(CounterError::NotLocked(_))));

        lock.acquire().await.unwrap();
        assert!(lock.is_locked());
        assert!(lock.path().exists());
        assert!(matches!(lock.acquire().await, Err(CounterError::AlreadyLocked(_))));

        lock.release().await.unwrap();
        assert!(!lock.is_locked());
        assert!(!lock.path().exists());
        assert!(matches!(lock.release().await, Err(CounterError::NotLocked(_))));
    }

    #[tokio::test]
    async fn test_times_out_within_one_poll_of_ceiling() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config(temp_dir.path(), 100, 600);
        let notifier = Arc::new(ReleaseNotifier::new());

        let mut holder = FileLock::new("1", &config, notifier.clone());
        holder.acquire().await.unwrap();

        let mut contender = FileLock::new("1", &config, notifier);
        let started = Instant::now();
        let result = contender.acquire().await;
        let waited = started.elapsed();

        assert!(matches!(result, Err(CounterError::LockTimeout { .. })));
        assert!(!contender.is_locked());
        assert!(waited >= Duration::from_millis(600), "{:?}", waited);
        assert!(waited <= Duration::from_millis(600 + 100 + 150), "{:?}", waited);

        // 超时不影响原持有者
        assert!(holder.is_locked());
        holder.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_marker_blocks_until_removed() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config(temp_dir.path(), 20, 2000);
        let marker = FileLock::lock_path(temp_dir.path(), "5");
        std::fs::write(&marker, b"pid=other").unwrap();

        let remover = {
            let marker = marker.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                std::fs::remove_file(marker).unwrap();
            })
        };

        let mut lock = FileLock::new("5", &config, Arc::new(ReleaseNotifier::new()));
        lock.acquire().await.unwrap();
        remover.await.unwrap();
        lock.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_drop_removes_marker() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config(temp_dir.path(), 20, 500);
        let path = {
            let mut lock = FileLock::new("3", &config, Arc::new(ReleaseNotifier::new()));
            lock.acquire().await.unwrap();
            lock.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_cancelled_acquire_leaves_no_marker() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config(temp_dir.path(), 20, 300);
        let notifier = Arc::new(ReleaseNotifier::new());
        let marker = FileLock::lock_path(temp_dir.path(), "77");

        // 只轮询一次 acquire 就丢弃它
        {
            let mut lock = FileLock::new("77", &config, notifier.clone());
            tokio::select! {
                biased;
                _ = lock.acquire() => {}
                _ = std::future::ready(()) => {}
            }
        }
        assert!(!marker.exists());

        let mut next = FileLock::new("77", &config, notifier);
        next.acquire().await.unwrap();
        next.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_disturb_holder() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config(temp_dir.path(), 20, 1000);
        let notifier = Arc::new(ReleaseNotifier::new());

        let mut holder = FileLock::new("8", &config, notifier.clone());
        holder.acquire().await.unwrap();

        {
            let mut contender = FileLock::new("8", &config, notifier.clone());
            let outcome =
                tokio::time::timeout(Duration::from_millis(60), contender.acquire()).await;
            assert!(outcome.is_err());
            assert!(!contender.is_locked());
        }
        assert!(holder.path().exists());

        holder.release().await.unwrap();
        assert!(!holder.path().exists());

        let mut next = FileLock::new("8", &config, notifier);
        next.acquire().await.unwrap();
        next.release().await.unwrap();
    }

    #[test]
    fn test_lock_path_is_deterministic() {
        let dir = Path::new("/tmp");
        assert_eq!(
            FileLock::lock_path(dir, "42"),
            PathBuf::from("/tmp/.dlc-write-lock-42")
        );
        assert_eq!(
            FileLock::lock_path(dir, "a/b"),
            FileLock::lock_path(dir, "a/b")
        );
        assert_eq!(FileLock::lock_path(dir, "a/b").parent(), Some(dir));
    }
}
