//! 应用配置模块

#![allow(non_snake_case)]

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 存储类型
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    S3,
    WebDav,
}

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub typ: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accessKey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secretKey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webdavEndpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StorageConfig {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            typ: StorageType::Local,
            path: Some(path.into()),
            bucket: None,
            region: None,
            accessKey: None,
            secretKey: None,
            endpoint: None,
            webdavEndpoint: None,
            username: None,
            password: None,
            root: None,
        }
    }
}

/// 同步目录配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderConfig {
    /// 目录名称，同时决定索引文件名
    pub name: String,
    /// 所在存储
    pub storage: StorageConfig,
    /// 存储内的根路径
    pub path: String,
    /// 文件名和内容是否加密
    #[serde(default)]
    pub encrypted: bool,
    /// 扫描时的路径过滤规则，为空时不过滤
    #[serde(default)]
    pub allowed_paths: Vec<String>,
}

/// 引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// 每个目标的工作者数量
    #[serde(default = "default_n_workers")]
    pub n_workers: usize,
    /// 串行器队列上限（超过后阻塞新的请求）
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    /// 批量读取窗口
    #[serde(default = "default_fetch_size")]
    pub fetch_size: usize,
    /// 临时错误最大重试次数
    #[serde(default = "default_n_retries")]
    pub n_retries: u32,
    /// 重试基础延迟（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 上传速度限制（字节/秒），0 表示不限制
    #[serde(default)]
    pub upload_limit: u64,
    /// 下载速度限制（字节/秒），0 表示不限制
    #[serde(default)]
    pub download_limit: u64,
    /// 传输分块大小
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// 下载时跳过已存在且未变化的文件
    #[serde(default = "default_true")]
    pub skip_downloaded: bool,
    /// 同步前总是重新扫描远程目录
    #[serde(default)]
    pub rescan_remote: bool,
    /// 索引文件目录
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_n_workers() -> usize {
    2
}

fn default_queue_limit() -> usize {
    50
}

fn default_fetch_size() -> usize {
    1000
}

fn default_n_retries() -> u32 {
    5
}

fn default_retry_base_delay_ms() -> u64 {
    2000
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    crate::dirs::data_dir()
        .map(|p| p.join("encsync"))
        .unwrap_or_else(|| PathBuf::from(".encsync"))
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            n_workers: default_n_workers(),
            queue_limit: default_queue_limit(),
            fetch_size: default_fetch_size(),
            n_retries: default_n_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            upload_limit: 0,
            download_limit: 0,
            chunk_size: default_chunk_size(),
            skip_downloaded: true,
            rescan_remote: false,
            data_dir: default_data_dir(),
        }
    }
}

impl EngineConfig {
    /// 从配置文件加载引擎配置
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "engine").unwrap_or_default()
    }

    /// 保存引擎配置
    pub fn save(&self, config_dir: &Path) -> anyhow::Result<()> {
        save_section(config_dir, "engine", self)
    }

    /// 目录索引文件路径
    pub fn index_path(&self, folder_name: &str) -> PathBuf {
        self.data_dir.join(format!("{}.db", folder_name))
    }
}

/// 读取 config.json 中的某一节，缺失或损坏时返回 None
pub(crate) fn load_section<T: DeserializeOwned>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config: serde_json::Value = serde_json::from_str(&content).ok()?;

    match serde_json::from_value(config.get(key)?.clone()) {
        Ok(section) => Some(section),
        Err(e) => {
            tracing::warn!("配置节 {} 无效，使用默认值: {}", key, e);
            None
        }
    }
}

/// 写回 config.json 中的某一节，保留其他节
pub(crate) fn save_section<T: Serialize>(
    config_dir: &Path,
    key: &str,
    value: &T,
) -> anyhow::Result<()> {
    fs::create_dir_all(config_dir)?;
    let config_file = config_dir.join("config.json");

    let mut config: serde_json::Value = fs::read_to_string(&config_file)
        .ok()
        .and_then(|content| serde_json::from_str(&content).ok())
        .unwrap_or_else(|| serde_json::json!({}));

    config[key] = serde_json::to_value(value)?;
    fs::write(&config_file, serde_json::to_string_pretty(&config)?)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load(dir.path());
        assert_eq!(config.n_workers, 2);
        assert_eq!(config.queue_limit, 50);
        assert_eq!(config.fetch_size, 1000);
    }

    #[test]
    fn test_engine_config_roundtrip_keeps_other_sections() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{"log": {"level": "debug"}, "engine": {"nWorkers": 4}}"#,
        )
        .unwrap();

        let mut config = EngineConfig::load(dir.path());
        assert_eq!(config.n_workers, 4);
        assert_eq!(config.n_retries, 5);

        config.upload_limit = 1024;
        config.save(dir.path()).unwrap();

        let reloaded = EngineConfig::load(dir.path());
        assert_eq!(reloaded.upload_limit, 1024);

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("config.json")).unwrap())
                .unwrap();
        assert_eq!(raw["log"]["level"], "debug");
    }

    #[test]
    fn test_folder_config_parses_storage() {
        let folder: FolderConfig = serde_json::from_str(
            r#"{"name": "docs", "storage": {"type": "local", "path": "/tmp/x"}, "path": "/", "encrypted": true}"#,
        )
        .unwrap();
        assert_eq!(folder.storage.typ, StorageType::Local);
        assert!(folder.encrypted);
        assert!(folder.allowed_paths.is_empty());
    }

    #[test]
    fn test_folder_config_allowed_paths() {
        let folder: FolderConfig = serde_json::from_str(
            r#"{"name": "docs", "storage": {"type": "local", "path": "/tmp/x"}, "path": "/",
                "allowedPaths": ["+*", "-/cache/*"]}"#,
        )
        .unwrap();
        assert_eq!(folder.allowed_paths, vec!["+*", "-/cache/*"]);
    }
}
