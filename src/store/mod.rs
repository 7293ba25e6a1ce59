//! 外部存储协作者
//!
//! 核心只依赖两个接口：按资源 ID 读写字段的 [`MetaStore`]，
//! 以及把 ID 解析为文件的 [`ResourceStore`]。

use std::path::PathBuf;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::Result;

mod catalog;
mod memory;
mod sled_store;

pub use catalog::CatalogResourceStore;
pub use memory::MemoryMetaStore;
pub use sled_store::SledMetaStore;

/// 可下载的文件资源，对核心只读
#[derive(Debug, Clone)]
pub struct Resource {
    pub id: String,
    pub path: PathBuf,
    pub size: u64,
    pub mime_type: String,
    pub modified: SystemTime,
    pub slug: String,
}

impl Resource {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }
}

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// 解析资源；ID 未登记或文件不存在时返回 `None`
    async fn get(&self, id: &str) -> Result<Option<Resource>>;

    fn ids(&self) -> Vec<String>;
}

/// 以资源 ID 为键的字段存储
#[async_trait]
pub trait MetaStore: Send + Sync {
    async fn read_field(&self, id: &str, field: &str) -> Result<Option<String>>;

    async fn write_field(&self, id: &str, field: &str, value: &str) -> Result<()>;

    async fn delete_field(&self, id: &str, field: &str) -> Result<()>;

    /// Atomically replaces the field when its current value equals `expected`.
    ///
    /// `None` on either side means "absent", so this covers conditional
    /// insert, conditional overwrite and conditional delete. Returns `false`
    /// when the current value did not match.
    async fn compare_and_swap(
        &self,
        id: &str,
        field: &str,
        expected: Option<&str>,
        new: Option<&str>,
    ) -> Result<bool>;

    async fn create_field_if_absent(&self, id: &str, field: &str, value: &str) -> Result<bool> {
        self.compare_and_swap(id, field, None, Some(value)).await
    }
}
