use std::collections::HashMap;
use std::io::ErrorKind;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{Resource, ResourceStore};
use crate::config::ResourceEntry;
use crate::plugin::Plugin;
use crate::Result;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 由配置 `[[resources]]` 构建的资源目录
#[derive(Debug)]
pub struct CatalogResourceStore {
    entries: HashMap<String, ResourceEntry>,
}

impl CatalogResourceStore {
    pub fn new(entries: Vec<ResourceEntry>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|entry| (entry.id.clone(), entry))
                .collect(),
        }
    }
}

#[async_trait]
impl ResourceStore for CatalogResourceStore {
    async fn get(&self, id: &str) -> Result<Option<Resource>> {
        let entry = match self.entries.get(id) {
            Some(entry) => entry,
            None => {
                debug!("Resource {} is not catalogued", id);
                return Ok(None);
            }
        };

        // 每次都重新读取文件元数据
        let metadata = match tokio::fs::metadata(&entry.path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => {
                warn!("Resource {} does not point to a regular file: {:?}", id, entry.path);
                return Ok(None);
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("File for resource {} is missing: {:?}", id, entry.path);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let slug = entry.slug.clone().unwrap_or_else(|| {
            entry
                .path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| entry.id.clone())
        });

        Ok(Some(Resource {
            id: entry.id.clone(),
            path: entry.path.clone(),
            size: metadata.len(),
            mime_type: entry
                .mime_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            modified: metadata.modified()?,
            slug,
        }))
    }

    fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl Plugin for CatalogResourceStore {
    fn name(&self) -> &str {
        "resource-catalog"
    }

    async fn init(&self) -> Result<()> {
        info!("Resource catalog loaded with {} entries", self.entries.len());
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        let mut healthy = true;
        for entry in self.entries.values() {
            if !tokio::fs::try_exists(&entry.path).await.unwrap_or(false) {
                warn!("Catalogued file missing: {} -> {:?}", entry.id, entry.path);
                healthy = false;
            }
        }
        Ok(healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn entry(id: &str, path: PathBuf, mime_type: Option<&str>) -> ResourceEntry {
        ResourceEntry {
            id: id.to_string(),
            path,
            mime_type: mime_type.map(String::from),
            slug: None,
        }
    }

    #[tokio::test]
    async fn test_resolves_size_and_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file = temp_dir.path().join("release-1.0.tar.gz");
        std::fs::write(&file, vec![0u8; 2048]).unwrap();

        let store = CatalogResourceStore::new(vec![entry("1", file.clone(), None)]);
        let resource = store.get("1").await.unwrap().unwrap();

        assert_eq!(resource.size, 2048);
        assert_eq!(resource.mime_type, DEFAULT_MIME_TYPE);
        assert_eq!(resource.file_name(), "release-1.0.tar.gz");
        assert_eq!(resource.slug, "release-1.0.tar");
        assert!(store.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_or_missing_resolves_to_none() {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = CatalogResourceStore::new(vec![entry(
            "2",
            temp_dir.path().join("gone.zip"),
            Some("application/zip"),
        )]);

        assert!(store.get("1").await.unwrap().is_none());
        assert!(store.get("2").await.unwrap().is_none());
        assert!(!store.health_check().await.unwrap());
    }
}
