pub mod local;
pub mod remote;
pub mod transfer;

use crate::config::{StorageConfig, StorageType};
use crate::error::{Error, Result};
use crate::filelist::NodeType;
use async_trait::async_trait;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

pub use local::LocalStorage;
pub use remote::RemoteStorage;
pub use transfer::{
    copy_limited, with_retry, ControlHandle, SpeedLimit, SpeedLimiter, TransferController,
    TransferOptions,
};

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;
pub type BoxWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// 条目元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub node_type: NodeType,
    /// 原始名称（可能是加密后的）
    pub name: String,
    /// 修改时间（Unix 秒）
    pub modified: i64,
    pub size: u64,
}

impl Meta {
    pub fn is_dir(&self) -> bool {
        self.node_type == NodeType::Dir
    }
}

/// 存储抽象接口
///
/// 路径均为存储内以 `/` 开头的绝对路径。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;

    /// 扫描能否并行进行
    fn parallelizable(&self) -> bool;

    /// 获取元数据，不存在时返回 `NotFound`
    async fn get_meta(&self, path: &str) -> Result<Meta>;

    /// 列出目录的直接子项
    async fn listdir(&self, path: &str) -> Result<Vec<Meta>>;

    /// 创建目录，已存在时返回 `AlreadyExists`
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// 删除文件或整个目录
    async fn remove(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.get_meta(path).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// 从 `source` 读取并写入 `path`
    fn upload(&self, source: BoxReader, path: &str, opts: TransferOptions) -> TransferController;

    /// 读取 `path` 写入 `dest`，结束时关闭 `dest`
    fn download(&self, path: &str, dest: BoxWriter, opts: TransferOptions) -> TransferController;
}

pub type SharedStorage = Arc<dyn Storage>;

/// 根据配置创建存储实例
pub fn create_storage(config: &StorageConfig) -> anyhow::Result<SharedStorage> {
    match config.typ {
        StorageType::Local => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("Local storage requires path"))?;
            tracing::info!("初始化本地存储: {}", path);
            Ok(Arc::new(LocalStorage::new(path)?) as SharedStorage)
        }
        StorageType::S3 => {
            let bucket = config
                .bucket
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires bucket"))?;
            let region = config
                .region
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires region"))?;
            let access_key = config
                .accessKey
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires accessKey"))?;
            let secret_key = config
                .secretKey
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("S3 storage requires secretKey"))?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(RemoteStorage::s3(
                bucket,
                region,
                access_key,
                secret_key,
                config.endpoint.clone(),
                config.root.clone(),
            )?) as SharedStorage)
        }
        StorageType::WebDav => {
            let endpoint = config
                .webdavEndpoint
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires endpoint"))?;
            let username = config
                .username
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires username"))?;
            let password = config
                .password
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("WebDAV storage requires password"))?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            Ok(Arc::new(RemoteStorage::webdav(
                endpoint,
                username,
                password,
                config.root.clone(),
            )?) as SharedStorage)
        }
    }
}
