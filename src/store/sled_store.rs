use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sled::IVec;
use tracing::{debug, info};

use super::MetaStore;
use crate::error::CounterError;
use crate::plugin::Plugin;
use crate::Result;

/// 基于 sled 的持久化字段存储
pub struct SledMetaStore {
    path: PathBuf,
    db: sled::Db,
}

impl SledMetaStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        info!("Opening metadata database at {:?}", path);
        let db = sled::open(&path)?;
        Ok(Self { path, db })
    }

    // 长度前缀避免 ID 中的 ':' 产生歧义
    fn key(id: &str, field: &str) -> Vec<u8> {
        format!("meta:{}:{}:{}", id.len(), id, field).into_bytes()
    }

    fn decode(value: IVec) -> Result<String> {
        String::from_utf8(value.to_vec())
            .map_err(|e| CounterError::Store(format!("non UTF-8 field value: {}", e)))
    }
}

#[async_trait]
impl MetaStore for SledMetaStore {
    async fn read_field(&self, id: &str, field: &str) -> Result<Option<String>> {
        match self.db.get(Self::key(id, field))? {
            Some(value) => Ok(Some(Self::decode(value)?)),
            None => Ok(None),
        }
    }

    async fn write_field(&self, id: &str, field: &str, value: &str) -> Result<()> {
        self.db.insert(Self::key(id, field), value)?;
        Ok(())
    }

    async fn delete_field(&self, id: &str, field: &str) -> Result<()> {
        self.db.remove(Self::key(id, field))?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        field: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        match self.db.compare_and_swap(Self::key(id, field), expected, new)? {
            Ok(()) => Ok(true),
            Err(conflict) => {
                debug!("CAS conflict on {}/{}: current={:?}", id, field, conflict.current);
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl Plugin for SledMetaStore {
    fn name(&self) -> &str {
        "sled-meta-store"
    }

    async fn init(&self) -> Result<()> {
        info!("Metadata database ready: {:?} ({} keys)", self.path, self.db.len());
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let flushed = self.db.flush_async().await?;
        info!("Flushed {} bytes to {:?}", flushed, self.path);
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.db.size_on_disk().is_ok())
    }
}
