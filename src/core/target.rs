use super::{Status, StatusCell};
use crate::config::{EngineConfig, FolderConfig};
use crate::crypto::SharedCipher;
use crate::error::Result;
use crate::pathmatch::PathMatch;
use crate::paths;
use crate::storage::{create_storage, SharedStorage, SpeedLimit, TransferOptions};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Scan,
    Download,
    Sync,
}

/// 进度快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Progress {
    pub total_children: u64,
    pub finished: u64,
    pub failed: u64,
    pub bytes: u64,
    /// 本轮开始时间，从未运行时为 None
    pub started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct ProgressCounters {
    total_children: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    bytes: AtomicU64,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl ProgressCounters {
    pub fn add_total(&self, n: u64) {
        self.total_children.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_finished(&self, n: u64) {
        self.finished.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_failed(&self, n: u64) {
        self.failed.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// 清零计数并记录新一轮的开始时间
    pub fn reset(&self) {
        self.total_children.store(0, Ordering::Relaxed);
        self.finished.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.bytes.store(0, Ordering::Relaxed);
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    pub fn snapshot(&self) -> Progress {
        Progress {
            total_children: self.total_children.load(Ordering::Relaxed),
            finished: self.finished.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
            started_at: *self.started_at.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// 所有目标共用的状态
#[derive(Debug)]
pub struct TargetState {
    id: Uuid,
    status: Arc<StatusCell>,
    token: Mutex<CancellationToken>,
    upload_limit: SpeedLimit,
    download_limit: SpeedLimit,
    pub progress: Arc<ProgressCounters>,
}

impl TargetState {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: Arc::new(StatusCell::default()),
            token: Mutex::new(CancellationToken::new()),
            upload_limit: SpeedLimit::new(config.upload_limit),
            download_limit: SpeedLimit::new(config.download_limit),
            progress: Arc::new(ProgressCounters::default()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> &Arc<StatusCell> {
        &self.status
    }

    /// 开始一次运行：换新的停止信号并进入 pending
    ///
    /// 挂起的目标在这里恢复；已挂起以外的终止状态同样重新开始。
    pub fn begin_run(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = token.clone();
        self.progress.reset();
        self.status.set(Status::Pending);
        token
    }

    pub fn token(&self) -> CancellationToken {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn stop(&self) {
        self.status.settle(Status::Suspended);
        self.token().cancel();
    }

    pub fn upload_limit(&self) -> &SpeedLimit {
        &self.upload_limit
    }

    pub fn download_limit(&self) -> &SpeedLimit {
        &self.download_limit
    }

    pub fn upload_options(
        &self,
        token: &CancellationToken,
        config: &EngineConfig,
    ) -> TransferOptions {
        TransferOptions {
            limit: self.upload_limit.clone(),
            cancel: token.clone(),
            chunk_size: config.chunk_size,
        }
    }

    pub fn download_options(
        &self,
        token: &CancellationToken,
        config: &EngineConfig,
    ) -> TransferOptions {
        TransferOptions {
            limit: self.download_limit.clone(),
            cancel: token.clone(),
            chunk_size: config.chunk_size,
        }
    }
}

/// 一个顶层请求：扫描、下载或同步
#[async_trait]
pub trait Target: Send + Sync {
    fn state(&self) -> &TargetState;

    fn kind(&self) -> TargetKind;

    /// 使用给定的停止信号执行；停止时返回 `Interrupted`
    async fn execute(&self, token: CancellationToken) -> Result<()>;

    /// 开始新一轮运行（挂起的目标由此恢复）
    async fn run(&self) -> Result<()> {
        let token = self.state().begin_run();
        self.execute(token).await
    }

    fn id(&self) -> Uuid {
        self.state().id()
    }

    fn status(&self) -> Status {
        self.state().status().get()
    }

    fn stop(&self) {
        self.state().stop();
    }

    fn set_upload_limit(&self, bytes_per_sec: u64) {
        self.state().upload_limit().set(bytes_per_sec);
    }

    fn set_download_limit(&self, bytes_per_sec: u64) {
        self.state().download_limit().set(bytes_per_sec);
    }

    fn progress(&self) -> Progress {
        self.state().progress.snapshot()
    }
}

/// 运行时的同步目录：已创建的存储加上加密设置
#[derive(Clone)]
pub struct Folder {
    pub name: String,
    pub storage: SharedStorage,
    pub cipher: SharedCipher,
    pub encrypted: bool,
    /// 存储内的根路径（不加密）
    pub prefix: String,
    /// 扫描时的路径过滤
    pub rules: Arc<PathMatch>,
}

impl Folder {
    pub fn new(
        name: impl Into<String>,
        storage: SharedStorage,
        cipher: SharedCipher,
        encrypted: bool,
        prefix: &str,
    ) -> Self {
        Self {
            name: name.into(),
            storage,
            cipher,
            encrypted,
            prefix: paths::normalize(prefix),
            rules: Arc::new(PathMatch::default()),
        }
    }

    pub fn with_allowed_paths<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self> {
        self.rules = Arc::new(PathMatch::new(patterns)?);
        Ok(self)
    }

    pub fn from_config(config: &FolderConfig, cipher: SharedCipher) -> anyhow::Result<Self> {
        let storage = create_storage(&config.storage)?;
        let folder = Self::new(
            config.name.clone(),
            storage,
            cipher,
            config.encrypted,
            &config.path,
        )
        .with_allowed_paths(&config.allowed_paths)?;
        Ok(folder)
    }

    /// 逻辑路径是否通过过滤规则，目录按 `/` 结尾匹配
    pub fn allows(&self, path: &str, is_dir: bool) -> bool {
        if is_dir {
            self.rules.matches(&paths::dir_normalize(path))
        } else {
            self.rules.matches(path)
        }
    }

    /// 逻辑路径在前缀下的相对部分
    pub fn relative(&self, path: &str) -> Option<String> {
        paths::cut_prefix(&paths::dir_denormalize(path), &self.prefix)
    }

    /// 计算逻辑路径对应的存储路径，返回 (存储路径, IV)
    pub fn raw_path(&self, path: &str, ivs: &[u8]) -> Result<(String, Vec<u8>)> {
        let rel = self.relative(path).unwrap_or_else(|| paths::normalize(path));
        if !self.encrypted || rel == "/" {
            return Ok((paths::join(&self.prefix, &rel), ivs.to_vec()));
        }

        let (raw_rel, ivs) = self.cipher.encrypt_path(&rel, ivs)?;
        Ok((paths::join(&self.prefix, &raw_rel), ivs))
    }
}
