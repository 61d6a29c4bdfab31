use super::{
    copy_limited, BoxReader, BoxWriter, Meta, Storage, TransferController, TransferOptions,
};
use crate::error::{Error, Result};
use crate::filelist::NodeType;
use crate::paths;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// 上传过程中使用的临时文件后缀
const TEMP_SUFFIX: &str = ".encsync-part";

pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    pub fn new(path: &str) -> Result<Self> {
        let base_path = PathBuf::from(path);
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", path);
        Ok(Self { base_path, name })
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = path.trim_start_matches('/').trim_start_matches('\\');
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn meta_from(name: String, metadata: &std::fs::Metadata) -> Meta {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);

        Meta {
            node_type: if metadata.is_dir() {
                NodeType::Dir
            } else {
                NodeType::File
            },
            name,
            modified,
            size: if metadata.is_dir() { 0 } else { metadata.len() },
        }
    }

    fn temp_path(full_path: &Path) -> PathBuf {
        let mut name = full_path.as_os_str().to_owned();
        name.push(TEMP_SUFFIX);
        PathBuf::from(name)
    }

    /// 同步删除，可在 drop 中调用
    fn remove_temp(path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => debug!("已删除临时文件: {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("删除临时文件失败 {}: {}", path.display(), e),
        }
    }
}

#[async_trait]
impl Storage for LocalStorage {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelizable(&self) -> bool {
        false
    }

    async fn get_meta(&self, path: &str) -> Result<Meta> {
        let metadata = fs::metadata(self.resolve_path(path)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::NotFound(path.to_string())
            } else {
                e.into()
            }
        })?;

        let (_, name) = paths::split(path);
        Ok(Self::meta_from(name, &metadata))
    }

    async fn listdir(&self, path: &str) -> Result<Vec<Meta>> {
        let mut dir = fs::read_dir(self.resolve_path(path)).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(TEMP_SUFFIX) {
                continue;
            }

            // 遍历过程中被删除的条目直接跳过
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            entries.push(Self::meta_from(name, &metadata));
        }

        Ok(entries)
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        fs::create_dir(self.resolve_path(path)).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::AlreadyExists {
                Error::AlreadyExists(path.to_string())
            } else {
                e.into()
            }
        })
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path);
        let metadata = fs::symlink_metadata(&full_path).await?;

        if metadata.is_dir() {
            fs::remove_dir_all(&full_path).await?;
        } else {
            fs::remove_file(&full_path).await?;
        }

        Ok(())
    }

    fn upload(
        &self,
        mut source: BoxReader,
        path: &str,
        opts: TransferOptions,
    ) -> TransferController {
        let full_path = self.resolve_path(path);

        TransferController::new(&opts, |handle| async move {
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent).await?;
            }

            // 写入临时文件，成功后重命名，中断时不替换目标
            let temp_path = Self::temp_path(&full_path);
            Self::remove_temp(&temp_path);

            // 出错或传输被中途丢弃时都会删除临时文件
            let temp_guard = scopeguard::guard(temp_path.clone(), |path| {
                Self::remove_temp(&path);
            });

            let mut file = fs::File::create(&temp_path).await?;
            copy_limited(&mut source, &mut file, &handle).await?;
            drop(file);

            fs::rename(&temp_path, &full_path).await?;
            scopeguard::ScopeGuard::into_inner(temp_guard);
            Ok(())
        })
    }

    fn download(
        &self,
        path: &str,
        mut dest: BoxWriter,
        opts: TransferOptions,
    ) -> TransferController {
        let full_path = self.resolve_path(path);

        TransferController::new(&opts, |handle| async move {
            let mut file = fs::File::open(&full_path).await?;
            copy_limited(&mut file, &mut dest, &handle).await?;
            dest.shutdown().await?;
            Ok(())
        })
    }
}
