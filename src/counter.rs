use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::error::CounterError;
use crate::lock::LockProvider;
use crate::store::MetaStore;
use crate::Result;

/// 下载计数在元数据存储中的字段名
pub const COUNTER_FIELD: &str = "_dlc_counter";

/// 每个资源的下载计数
///
/// 读取不加锁；所有写入都在资源锁内完成，并在拿到锁之后重新读取当前值。
pub struct DownloadCounter {
    meta: Arc<dyn MetaStore>,
    locks: Arc<LockProvider>,
}

impl DownloadCounter {
    pub fn new(meta: Arc<dyn MetaStore>, locks: Arc<LockProvider>) -> Self {
        Self { meta, locks }
    }

    /// 当前计数，从未下载过的资源为 0
    pub async fn get_count(&self, resource_id: &str) -> Result<u64> {
        let raw = match self.meta.read_field(resource_id, COUNTER_FIELD).await? {
            Some(raw) => raw,
            None => return Ok(0),
        };

        match raw.trim().parse::<u64>() {
            Ok(count) => Ok(count),
            Err(e) => {
                warn!("Unparsable counter for resource {}: {:?} ({})", resource_id, raw, e);
                Ok(0)
            }
        }
    }

    /// 加一并返回新值。获取锁失败时本次计数被放弃，错误原样返回
    pub async fn increment_count(&self, resource_id: &str) -> Result<u64> {
        let count = self.update(resource_id, |current| current.saturating_add(1)).await?;
        debug!("Resource {} download count is now {}", resource_id, count);
        Ok(count)
    }

    /// 管理端直接设置计数
    pub async fn set_count(&self, resource_id: &str, value: u64) -> Result<u64> {
        let count = self.update(resource_id, |_| value).await?;
        info!("Download count of resource {} set to {}", resource_id, count);
        Ok(count)
    }

    async fn update<F>(&self, resource_id: &str, f: F) -> Result<u64>
    where
        F: FnOnce(u64) -> u64,
    {
        let guard = self.locks.lock(resource_id).await?;

        let outcome = async {
            // 必须在持锁后重新读取
            let current = self.get_count(resource_id).await?;
            let next = f(current);
            self.meta
                .write_field(resource_id, COUNTER_FIELD, &next.to_string())
                .await?;
            Ok::<u64, CounterError>(next)
        }
        .await;

        // 写入已完成时释放失败不影响结果，句柄 drop 时会再次尝试
        if let Err(e) = guard.release().await {
            error!("Failed to release lock on resource {}: {}", resource_id, e);
        }

        outcome
    }
}
