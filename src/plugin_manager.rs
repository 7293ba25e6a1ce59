use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::error::CounterError;
use crate::plugin::Plugin;
use crate::Result;

#[derive(Default)]
struct Registry {
    components: HashMap<String, Arc<dyn Plugin>>,
    // 注册顺序，关闭时倒序：依赖方先于被依赖的存储清理
    order: Vec<String>,
}

/// 管理组件的初始化、健康检查与关闭
#[derive(Default)]
pub struct PluginManager {
    registry: RwLock<Registry>,
}

impl fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.registry.try_read() {
            Ok(registry) => f
                .debug_struct("PluginManager")
                .field("components", &registry.order)
                .finish(),
            Err(_) => f.debug_struct("PluginManager").finish_non_exhaustive(),
        }
    }
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// 初始化成功后才登记；名称重复视为配置错误
    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let name = plugin.name().to_string();
        info!("Registering component: {} v{}", name, plugin.version());

        let mut registry = self.registry.write().await;
        if registry.components.contains_key(&name) {
            return Err(CounterError::Config(format!("Component {} already registered", name)));
        }

        if let Err(e) = plugin.init().await {
            error!("Failed to initialize component {}: {}", name, e);
            return Err(e);
        }

        registry.components.insert(name.clone(), plugin);
        registry.order.push(name.clone());
        info!("Component {} ready", name);
        Ok(())
    }

    pub async fn get_plugin(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.registry.read().await.components.get(name).cloned()
    }

    /// 按注册的逆序清理，单个组件失败不影响其余组件
    pub async fn cleanup(&self) -> Result<()> {
        let registry = self.registry.read().await;
        let mut failed = Vec::new();

        for name in registry.order.iter().rev() {
            let Some(plugin) = registry.components.get(name) else {
                continue;
            };
            match plugin.cleanup().await {
                Ok(()) => info!("Component {} shut down", name),
                Err(e) => {
                    error!("Error cleaning up component {}: {}", name, e);
                    failed.push(name.clone());
                }
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(CounterError::Store(format!("cleanup failed for: {}", failed.join(", "))))
        }
    }

    /// 检查出错的组件记为不健康，并记录原因
    pub async fn health_check(&self) -> BTreeMap<String, bool> {
        let registry = self.registry.read().await;
        let mut results = BTreeMap::new();

        for name in &registry.order {
            let Some(plugin) = registry.components.get(name) else {
                continue;
            };
            let healthy = match plugin.health_check().await {
                Ok(true) => true,
                Ok(false) => {
                    warn!("Component {} reports unhealthy", name);
                    false
                }
                Err(e) => {
                    warn!("Health check of component {} failed: {}", name, e);
                    false
                }
            };
            results.insert(name.clone(), healthy);
        }
        results
    }
}
