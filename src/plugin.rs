use async_trait::async_trait;
use crate::Result;

/// 可注册到 [`PluginManager`](crate::PluginManager) 的组件
#[async_trait]
pub trait Plugin: Send + Sync {
    /// 获取组件名称
    fn name(&self) -> &str;

    /// 获取组件版本
    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    /// 初始化组件
    async fn init(&self) -> Result<()>;

    /// 清理组件资源
    async fn cleanup(&self) -> Result<()>;

    /// 健康检查
    async fn health_check(&self) -> Result<bool> {
        Ok(true)  // 默认实现
    }
}
