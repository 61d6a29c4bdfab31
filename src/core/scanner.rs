//! 扫描：遍历存储中的目录树并写入索引
//!
//! 一次扫描在一个事务中完成，成功时提交，停止或出错时回滚，
//! 之前的索引快照保持不变。

use super::{
    Event, EventSender, Folder, ProgressCounters, Scannable, Status, Target, TargetKind,
    TargetState, TaskHandler, TaskQueue, WorkerPool,
};
use crate::error::{Error, Result};
use crate::filelist::{DuplicateList, FileList};
use crate::paths;
use crate::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 扫描完成后从索引统计的数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub files: u64,
    pub dirs: u64,
    pub duplicates: u64,
}

pub struct ScanTarget {
    ctx: Context,
    folder: Folder,
    /// 逻辑路径；None 表示整个目录
    path: Option<String>,
    state: TargetState,
}

impl ScanTarget {
    pub fn new(ctx: &Context, folder: Folder) -> Self {
        Self {
            state: TargetState::new(&ctx.config),
            ctx: ctx.clone(),
            folder,
            path: None,
        }
    }

    /// 只重新扫描某个子树
    pub fn with_path(ctx: &Context, folder: Folder, path: &str) -> Self {
        let mut target = Self::new(ctx, folder);
        target.path = Some(paths::dir_denormalize(&paths::normalize(path)));
        target
    }

    pub fn folder(&self) -> &Folder {
        &self.folder
    }

    pub fn index_path(&self) -> PathBuf {
        self.ctx.config.index_path(&self.folder.name)
    }

    /// 扫描并返回统计
    pub async fn scan(&self, token: &CancellationToken) -> Result<ScanSummary> {
        let conn = self.ctx.stores.open(&self.index_path()).await?;
        let files = FileList::new(conn.clone(), self.ctx.config.fetch_size);
        let duplicates = DuplicateList::new(conn);
        files.create().await?;
        duplicates.create().await?;

        // 加密子路径需要索引中已有的 IV，必须在清除之前定位
        let root = self.resolve_root(&files).await?;
        let root_path = root.path.clone();

        files.begin_transaction().await?;
        let populated = self.populate(root, &files, &duplicates, token).await;

        let outcome = match populated {
            Ok(()) if token.is_cancelled() => Err(Error::Interrupted),
            other => other,
        };

        if let Err(e) = outcome {
            if let Err(rollback_err) = files.rollback().await {
                warn!("回滚扫描事务失败: {}", rollback_err);
            }
            return Err(e);
        }

        files.commit().await?;
        self.summarize(&files, &duplicates, &root_path).await
    }

    async fn resolve_root(&self, files: &FileList) -> Result<Scannable> {
        let Some(path) = &self.path else {
            return Ok(Scannable::root(&self.folder));
        };

        let ivs = if self.folder.encrypted {
            match files.find_node(path).await? {
                Some(node) => node.ivs,
                None => {
                    return Err(Error::NotFound(format!("{} 未被索引，无法定位", path)));
                }
            }
        } else {
            Vec::new()
        };

        let (raw_path, ivs) = self.folder.raw_path(path, &ivs)?;
        Ok(Scannable::at(&self.folder, path.clone(), raw_path, ivs))
    }

    async fn populate(
        &self,
        mut root: Scannable,
        files: &FileList,
        duplicates: &DuplicateList,
        token: &CancellationToken,
    ) -> Result<()> {
        if self.path.is_some() {
            files.remove_node_children(&root.path).await?;
            files.remove_node(&root.path).await?;
            duplicates.remove_children(&root.path).await?;
            duplicates.remove(&root.path, None).await?;
        } else {
            files.clear().await?;
            duplicates.clear().await?;
        }

        root.identify().await?;
        if root.node_type.is_none() {
            info!("扫描路径不存在: {}", root.path);
            return Ok(());
        }
        if !root.is_allowed() {
            info!("扫描路径被过滤规则排除: {}", root.path);
            return Ok(());
        }

        files.insert_node(&root.to_node()).await?;
        if !root.is_dir() {
            return Ok(());
        }

        let n_workers = if self.folder.storage.parallelizable() {
            self.ctx.config.n_workers
        } else {
            1
        };
        debug!(
            "开始扫描 {} ({}), 工作者 {}",
            root.path,
            self.folder.storage.name(),
            n_workers
        );

        let pool = WorkerPool::with_owner(token, self.state.status().clone());
        pool.add(root);

        let handler = Arc::new(ScanWorker {
            target: self.state.id(),
            files: files.clone(),
            duplicates: duplicates.clone(),
            events: self.ctx.events.clone(),
            progress: self.state.progress.clone(),
        });
        let report = pool.run(n_workers, handler).await;

        if !report.suspended.is_empty() || token.is_cancelled() {
            return Err(Error::Interrupted);
        }
        if !report.failed.is_empty() {
            let details: Vec<String> = report
                .failed
                .iter()
                .map(|f| format!("{}: {}", f.task.path, f.error))
                .collect();
            return Err(Error::Fatal(format!(
                "{} 个目录扫描失败: {}",
                report.failed.len(),
                details.join("; ")
            )));
        }

        Ok(())
    }

    async fn summarize(
        &self,
        files: &FileList,
        duplicates: &DuplicateList,
        root_path: &str,
    ) -> Result<ScanSummary> {
        let duplicates = duplicates.get_children_count(root_path).await?;

        Ok(match files.find_node(root_path).await? {
            None => ScanSummary::default(),
            Some(node) if node.is_file() => ScanSummary {
                files: 1,
                dirs: 0,
                duplicates,
            },
            Some(_) => {
                let file_count = files.get_file_count(Some(root_path)).await?;
                let total = files.get_children_count(root_path).await?;
                ScanSummary {
                    files: file_count,
                    dirs: total.saturating_sub(file_count),
                    duplicates,
                }
            }
        })
    }
}

#[async_trait]
impl Target for ScanTarget {
    fn state(&self) -> &TargetState {
        &self.state
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Scan
    }

    async fn execute(&self, token: CancellationToken) -> Result<()> {
        self.state.status().set(Status::Pending);

        match self.scan(&token).await {
            Ok(summary) => {
                info!(
                    "扫描完成 {}: {} 个文件, {} 个目录, {} 个重复",
                    self.folder.name, summary.files, summary.dirs, summary.duplicates
                );
                self.state.status().settle(Status::Finished);
                self.ctx.events.emit(Event::ScanFinished {
                    target: self.state.id(),
                    files: summary.files,
                    dirs: summary.dirs,
                    duplicates: summary.duplicates,
                });
                Ok(())
            }
            Err(e) if e.is_interrupted() => {
                self.state.status().settle(Status::Suspended);
                Err(e)
            }
            Err(e) => {
                self.state.status().settle(Status::Failed);
                Err(e)
            }
        }
    }
}

struct ScanWorker {
    target: Uuid,
    files: FileList,
    duplicates: DuplicateList,
    events: EventSender,
    progress: Arc<ProgressCounters>,
}

#[async_trait]
impl TaskHandler<Scannable> for ScanWorker {
    async fn run(&self, dir: &Scannable, queue: &TaskQueue<Scannable>) -> Result<()> {
        if queue.is_stopped() {
            return Err(Error::Interrupted);
        }

        self.events.emit(Event::NextNode {
            target: self.target,
            path: dir.path.clone(),
        });

        let children = dir.scan().await?;
        if queue.is_stopped() {
            return Err(Error::Interrupted);
        }

        let mut counts: HashMap<&str, usize> = HashMap::new();
        for child in children.files.iter().chain(&children.dirs) {
            *counts.entry(child.path.as_str()).or_default() += 1;
        }

        for child in children.files.iter().chain(&children.dirs) {
            if let Some(node_type) = child.node_type {
                if counts.get(child.path.as_str()).copied().unwrap_or(0) > 1 {
                    self.duplicates
                        .insert(node_type, &child.ivs, &child.path)
                        .await?;
                }
            }
        }

        for (path, count) in counts.iter().filter(|(_, count)| **count > 1) {
            warn!("发现 {} 个同名条目: {}", count, path);
            self.events.emit(Event::DuplicatesFound {
                target: self.target,
                path: path.to_string(),
                count: *count,
            });
        }

        self.progress.add_total(children.len() as u64);

        for child in children.into_entries() {
            self.files.insert_node(&child.to_node()).await?;
            if child.is_dir() {
                queue.add(child);
            }
        }

        self.progress.add_finished(1);
        Ok(())
    }
}
