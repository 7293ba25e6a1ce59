use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::MetaStore;
use crate::plugin::Plugin;
use crate::Result;

/// 进程内字段存储，测试和临时部署使用
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    fields: RwLock<HashMap<(String, String), String>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(id: &str, field: &str) -> (String, String) {
        (id.to_string(), field.to_string())
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn read_field(&self, id: &str, field: &str) -> Result<Option<String>> {
        Ok(self.fields.read().await.get(&Self::key(id, field)).cloned())
    }

    async fn write_field(&self, id: &str, field: &str, value: &str) -> Result<()> {
        self.fields
            .write()
            .await
            .insert(Self::key(id, field), value.to_string());
        Ok(())
    }

    async fn delete_field(&self, id: &str, field: &str) -> Result<()> {
        self.fields.write().await.remove(&Self::key(id, field));
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        id: &str,
        field: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool> {
        let key = Self::key(id, field);
        let mut fields = self.fields.write().await;

        if fields.get(&key).map(String::as_str) != expected {
            debug!("CAS conflict on {}/{}", id, field);
            return Ok(false);
        }

        match new {
            Some(value) => fields.insert(key, value.to_string()),
            None => fields.remove(&key),
        };
        Ok(true)
    }
}

#[async_trait]
impl Plugin for MemoryMetaStore {
    fn name(&self) -> &str {
        "memory-meta-store"
    }

    async fn init(&self) -> Result<()> {
        info!("Using in-memory metadata store, counts are not persisted");
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let fields = self.fields.read().await;
        info!("Dropping {} in-memory fields", fields.len());
        Ok(())
    }
}
