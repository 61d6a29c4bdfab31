use std::path::PathBuf;
use std::sync::Arc;

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod filelist;
pub mod logging;
pub mod pathmatch;
pub mod paths;
pub mod storage;
pub mod store;

pub use config::{EngineConfig, FolderConfig, StorageConfig, StorageType};
pub use error::{Error, Result};
pub use store::StoreManager;

/// 引擎上下文，在各个目标之间共享
#[derive(Clone)]
pub struct Context {
    pub config: Arc<EngineConfig>,
    pub stores: Arc<StoreManager>,
    pub events: core::EventSender,
}

impl Context {
    pub fn new(config: EngineConfig, events: core::EventSender) -> Self {
        let stores = StoreManager::new(config.queue_limit);
        Self {
            config: Arc::new(config),
            stores,
            events,
        }
    }

    /// 从默认配置目录加载引擎配置并初始化日志
    pub fn load(events: core::EventSender) -> anyhow::Result<Self> {
        let config_dir = dirs::config_dir()
            .map(|p| p.join("encsync"))
            .unwrap_or_else(|| PathBuf::from(".encsync"));

        std::fs::create_dir_all(&config_dir)?;
        let config = EngineConfig::load(&config_dir);
        std::fs::create_dir_all(&config.data_dir)?;
        logging::init_logging(&config_dir, &config.data_dir.join("logs"))?;

        tracing::debug!("索引目录: {:?}", config.data_dir);
        Ok(Self::new(config, events))
    }

    /// 停止所有索引串行器（退出前调用）
    pub fn cleanup(&self) {
        tracing::info!("正在关闭索引存储...");
        self.stores.close_all();
    }
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }

    pub fn data_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("LOCALAPPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            config_dir()
        } else {
            std::env::var("XDG_DATA_HOME")
                .ok()
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".local").join("share"))
                })
        }
    }
}
