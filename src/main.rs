use std::sync::Arc;
use download_counter::config::StoreKind;
use download_counter::logger::init_logger;
use download_counter::prelude::*;
use download_counter::{Config, PluginManager};
use tracing::{info, error};
use tokio::signal;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 初始化日志
    init_logger();

    info!("Starting download counter");

    // 初始化配置
    let config = Config::load()?;
    let addr = config.bind_addr()?;

    // 创建组件管理器
    let plugin_manager = Arc::new(PluginManager::new());

    let meta = create_meta_store(&config, &plugin_manager).await?;

    let locks = Arc::new(LockProvider::new(config.lock.clone(), meta.clone()));
    plugin_manager.register_plugin(locks.clone()).await?;

    let catalog = Arc::new(CatalogResourceStore::new(config.resources.clone()));
    plugin_manager.register_plugin(catalog.clone()).await?;
    let resources: Arc<dyn ResourceStore> = catalog;

    let counter = Arc::new(DownloadCounter::new(meta, locks));
    let tracking = TrackingPolicy::new(&config.tracking);
    for id in resources.ids() {
        if let Ok(Some(resource)) = resources.get(&id).await {
            if tracking.is_tracked(&resource.path) {
                info!("Tracking {} at {}", resource.file_name(), tracking.download_url(&resource));
            }
        }
    }

    let state = AppState {
        handler: DownloadHandler::new(resources.clone(), counter.clone(), config.counter.policy),
        counter,
        resources,
        tracking,
    };

    // 启动健康检查
    start_health_check(plugin_manager.clone());

    let server = DownloadServer::new(addr, state);
    if let Err(e) = server.run(wait_for_shutdown()).await {
        error!("Server stopped with error: {}", e);
    }

    // 优雅关闭
    info!("Shutting down...");
    if let Err(e) = plugin_manager.cleanup().await {
        error!("Error during shutdown: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}

async fn create_meta_store(
    config: &Config,
    plugin_manager: &PluginManager,
) -> Result<Arc<dyn MetaStore>, Box<dyn std::error::Error>> {
    let meta: Arc<dyn MetaStore> = match config.counter.store {
        StoreKind::Memory => {
            let store = Arc::new(MemoryMetaStore::new());
            plugin_manager.register_plugin(store.clone()).await?;
            store
        }
        StoreKind::Sled => {
            if let Some(parent) = config.counter.db_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let store = Arc::new(SledMetaStore::open(&config.counter.db_path)?);
            plugin_manager.register_plugin(store.clone()).await?;
            store
        }
    };
    Ok(meta)
}

fn start_health_check(plugin_manager: Arc<PluginManager>) {
    tokio::spawn(async move {
        let check_interval = std::time::Duration::from_secs(300); // 5 minutes
        loop {
            let health_status = plugin_manager.health_check().await;
            info!("Component health status: {:?}", health_status);
            tokio::time::sleep(check_interval).await;
        }
    });
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received terminate signal"),
    }
}
