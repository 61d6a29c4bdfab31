use super::{
    Event, EventSender, Folder, PoolReport, Producer, ProgressCounters, Scannable, Status,
    Target, TargetKind, TargetState, TaskHandler, TaskQueue, TreeWalk, WorkerPool,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::filelist::{FileList, Node, NodeCursor, NodeType};
use crate::paths;
use crate::storage::{with_retry, BoxReader, SharedStorage, TransferOptions};
use crate::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 一个待下载的条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    pub node_type: NodeType,
    /// 源中的逻辑路径
    pub src_path: String,
    /// 源存储中的实际路径
    pub raw_path: String,
    pub dst_path: String,
    pub modified: i64,
    pub padded_size: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub dirs: usize,
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// 把源目录中的文件或子树下载到另一个存储
pub struct DownloadTarget {
    ctx: Context,
    source: Folder,
    src_path: String,
    dest: SharedStorage,
    dst_path: String,
    state: TargetState,
}

impl DownloadTarget {
    pub fn new(
        ctx: &Context,
        source: Folder,
        src_path: &str,
        dest: SharedStorage,
        dst_path: &str,
    ) -> Self {
        Self {
            state: TargetState::new(&ctx.config),
            ctx: ctx.clone(),
            source,
            src_path: paths::dir_denormalize(&paths::normalize(src_path)),
            dest,
            dst_path: paths::dir_denormalize(&paths::normalize(dst_path)),
        }
    }

    /// 源条目，优先使用索引，否则直接遍历存储
    async fn entries(&self) -> Result<Entries> {
        let list = FileList::open(
            &self.ctx.stores,
            &self.ctx.config.index_path(&self.source.name),
            self.ctx.config.fetch_size,
        )
        .await?;
        list.create().await?;

        if let Some(root) = list.find_node(&self.src_path).await? {
            debug!("从索引读取下载列表: {}", self.src_path);
            if root.is_dir() {
                // 子树游标包含目录本身
                return Ok(Entries::Indexed {
                    cursor: list.find_node_children(&self.src_path),
                    folder: self.source.clone(),
                });
            }
            let (raw, _) = self.source.raw_path(&root.path, &root.ivs)?;
            return Ok(Entries::One(Some((root, raw))));
        }

        debug!("源路径未索引，直接遍历: {}", self.src_path);
        self.walk().await
    }

    async fn walk(&self) -> Result<Entries> {
        let is_root =
            paths::dir_normalize(&self.src_path) == paths::dir_normalize(&self.source.prefix);

        if !self.source.encrypted || is_root {
            let (raw, _) = self.source.raw_path(&self.src_path, &[])?;
            let mut root = Scannable::at(&self.source, self.src_path.clone(), raw, Vec::new());
            root.identify().await?;

            return match root.node_type {
                None => Err(Error::NotFound(self.src_path.clone())),
                Some(NodeType::File) => Ok(Entries::One(Some(Self::entry(root)))),
                Some(NodeType::Dir) => Ok(Entries::Walked {
                    walk: root.walk(),
                    first: Some(root),
                    within: None,
                }),
            };
        }

        // 加密名称无法直接定位，从根开始遍历直到遇到源路径
        let mut root = Scannable::root(&self.source);
        root.identify().await?;
        if !root.is_dir() {
            return Err(Error::NotFound(self.src_path.clone()));
        }

        let mut walk = root.walk();
        while let Some(entry) = walk.next().await? {
            if !paths::contains(&self.src_path, &entry.path) {
                continue;
            }
            if entry.is_file() {
                return Ok(Entries::One(Some(Self::entry(entry))));
            }
            return Ok(Entries::Walked {
                walk,
                first: Some(entry),
                within: Some(self.src_path.clone()),
            });
        }

        Err(Error::NotFound(self.src_path.clone()))
    }

    fn entry(scannable: Scannable) -> (Node, String) {
        let node = scannable.to_node();
        (node, scannable.raw_path)
    }

    async fn layout(&self, entries: &Entries) -> Result<Layout> {
        let dst_is_dir = match self.dest.get_meta(&self.dst_path).await {
            Ok(meta) => meta.is_dir(),
            Err(Error::NotFound(_)) => false,
            Err(e) => return Err(e),
        };

        Ok(Layout {
            src_path: self.src_path.clone(),
            dst_path: self.dst_path.clone(),
            root_is_file: matches!(entries, Entries::One(_)),
            dst_is_dir,
        })
    }

    /// 源或目标之一支持并发时使用多个工作者
    fn n_workers(&self) -> usize {
        if self.source.storage.parallelizable() || self.dest.parallelizable() {
            self.ctx.config.n_workers
        } else {
            1
        }
    }

    /// 逐个产生某一类型的任务
    async fn produce(
        &self,
        mut entries: Entries,
        layout: &Layout,
        node_type: NodeType,
        producer: &Producer<DownloadTask>,
    ) -> Result<()> {
        while let Some((node, raw_path)) = entries.next().await? {
            let Some(task) = layout.task(node, raw_path) else {
                continue;
            };
            if task.node_type != node_type {
                continue;
            }
            self.state.progress.add_total(1);
            producer.push(task).await?;
        }
        Ok(())
    }

    pub async fn download(&self, token: &CancellationToken) -> Result<DownloadSummary> {
        info!(
            "开始下载: {}{} -> {}{}",
            self.source.storage.name(),
            self.src_path,
            self.dest.name(),
            self.dst_path
        );

        let entries = self.entries().await?;
        let layout = self.layout(&entries).await?;
        let layout = &layout;

        let worker = Arc::new(Fetcher {
            target: self.state.id(),
            source: self.source.clone(),
            dest: self.dest.clone(),
            config: self.ctx.config.clone(),
            events: self.ctx.events.clone(),
            progress: self.state.progress.clone(),
            download: self.state.download_options(token, &self.ctx.config),
            upload: self.state.upload_options(token, &self.ctx.config),
            skipped: AtomicUsize::new(0),
        });

        let mut summary = DownloadSummary::default();

        // 第一遍只创建目录，单个工作者按顺序处理，保证父目录先于子项
        let report = self
            .run_stage(1, worker.clone(), token, |producer| async move {
                self.produce(entries, layout, NodeType::Dir, &producer)
                    .await
            })
            .await?;
        summary.dirs = report.finished;
        summary.failed += report.failed.len();

        // 第二遍下载文件，源条目重新读取
        let entries = self.entries().await?;
        let report = self
            .run_stage(self.n_workers(), worker.clone(), token, |producer| async move {
                self.produce(entries, layout, NodeType::File, &producer)
                    .await
            })
            .await?;
        summary.skipped = worker.skipped.load(Ordering::Relaxed);
        summary.downloaded = report.finished.saturating_sub(summary.skipped);
        summary.failed += report.failed.len();

        if summary.failed > 0 {
            return Err(Error::Fatal(format!("{} 个文件下载失败", summary.failed)));
        }

        info!(
            "下载完成: {} 个目录, {} 个文件, 跳过 {}",
            summary.dirs, summary.downloaded, summary.skipped
        );
        Ok(summary)
    }

    async fn run_stage<F, Fut>(
        &self,
        n_workers: usize,
        worker: Arc<Fetcher>,
        token: &CancellationToken,
        produce: F,
    ) -> Result<PoolReport<DownloadTask>>
    where
        F: FnOnce(Producer<DownloadTask>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let pool = WorkerPool::with_owner(token, self.state.status().clone());
        let report = pool
            .run_with(n_workers, worker, self.ctx.config.queue_limit, produce)
            .await?;

        if !report.suspended.is_empty() || token.is_cancelled() {
            return Err(Error::Interrupted);
        }

        for failed in &report.failed {
            self.ctx.events.emit(Event::Error {
                target: Some(self.state.id()),
                message: format!("{}: {}", failed.task.src_path, failed.error),
            });
        }

        Ok(report)
    }
}

/// 源中待下载的条目，按路径顺序逐个产出 (节点, 存储路径)
enum Entries {
    One(Option<(Node, String)>),
    Indexed {
        cursor: NodeCursor,
        folder: Folder,
    },
    Walked {
        walk: TreeWalk,
        first: Option<Scannable>,
        /// 只保留该路径下的条目
        within: Option<String>,
    },
}

impl Entries {
    async fn next(&mut self) -> Result<Option<(Node, String)>> {
        match self {
            Entries::One(entry) => Ok(entry.take()),
            Entries::Indexed { cursor, folder } => {
                let Some(node) = cursor.next().await? else {
                    return Ok(None);
                };
                let (raw, _) = folder.raw_path(&node.path, &node.ivs)?;
                Ok(Some((node, raw)))
            }
            Entries::Walked {
                walk,
                first,
                within,
            } => {
                if let Some(entry) = first.take() {
                    return Ok(Some(DownloadTarget::entry(entry)));
                }
                // 先序遍历中子树是连续的，离开后即可结束
                match walk.next().await? {
                    Some(entry)
                        if within
                            .as_deref()
                            .map_or(true, |root| paths::contains(root, &entry.path)) =>
                    {
                        Ok(Some(DownloadTarget::entry(entry)))
                    }
                    _ => Ok(None),
                }
            }
        }
    }
}

/// 源路径到目标路径的映射
struct Layout {
    src_path: String,
    dst_path: String,
    root_is_file: bool,
    dst_is_dir: bool,
}

impl Layout {
    fn task(&self, node: Node, raw_path: String) -> Option<DownloadTask> {
        let node_type = node.node_type?;
        let src_path = paths::dir_denormalize(&node.path);

        let dst_path = if self.root_is_file {
            if self.dst_is_dir {
                let (_, name) = paths::split(&src_path);
                paths::join(&self.dst_path, &name)
            } else {
                self.dst_path.clone()
            }
        } else {
            let rel = paths::cut_prefix(&src_path, &self.src_path)?;
            paths::join(&self.dst_path, &rel)
        };

        Some(DownloadTask {
            node_type,
            src_path,
            raw_path,
            dst_path,
            modified: node.modified,
            padded_size: node.padded_size,
        })
    }
}

#[async_trait]
impl Target for DownloadTarget {
    fn state(&self) -> &TargetState {
        &self.state
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Download
    }

    async fn execute(&self, token: CancellationToken) -> Result<()> {
        self.state.status().set(Status::Pending);

        match self.download(&token).await {
            Ok(_) => {
                self.state.status().settle(Status::Finished);
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

struct Fetcher {
    target: Uuid,
    source: Folder,
    dest: SharedStorage,
    config: Arc<EngineConfig>,
    events: EventSender,
    progress: Arc<ProgressCounters>,
    download: TransferOptions,
    upload: TransferOptions,
    skipped: AtomicUsize,
}

impl Fetcher {
    async fn mkdir(&self, task: &DownloadTask, token: &CancellationToken) -> Result<()> {
        let created = with_retry(
            &format!("创建目录 {}", task.dst_path),
            self.config.n_retries,
            self.config.retry_base_delay_ms,
            token,
            || self.dest.mkdir(&task.dst_path),
        )
        .await;

        match created {
            Ok(()) | Err(Error::AlreadyExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// 目标已存在、大小一致且不早于源文件时跳过
    async fn is_downloaded(&self, task: &DownloadTask) -> Result<bool> {
        if !self.config.skip_downloaded {
            return Ok(false);
        }

        match self.dest.get_meta(&task.dst_path).await {
            Ok(meta) => Ok(!meta.is_dir()
                && self.source.cipher.padded_size(meta.size) == task.padded_size
                && meta.modified >= task.modified),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn transfer(&self, task: &DownloadTask, token: &CancellationToken) -> Result<u64> {
        let (writer, reader) = tokio::io::duplex(self.config.chunk_size.max(1));

        let download_opts = TransferOptions {
            cancel: token.clone(),
            ..self.download.clone()
        };
        let mut download =
            self.source
                .storage
                .download(&task.raw_path, Box::pin(writer), download_opts);

        let mut source: BoxReader = Box::pin(reader);
        if self.source.encrypted {
            source = self.source.cipher.decrypt_stream(source);
        }

        let upload_opts = TransferOptions {
            cancel: token.clone(),
            ..self.upload.clone()
        };
        let mut upload = self.dest.upload(source, &task.dst_path, upload_opts);

        tokio::try_join!(download.work(), upload.work())?;
        Ok(download.transferred())
    }
}

#[async_trait]
impl TaskHandler<DownloadTask> for Fetcher {
    async fn run(&self, task: &DownloadTask, queue: &TaskQueue<DownloadTask>) -> Result<()> {
        let token = queue.token();
        if token.is_cancelled() {
            return Err(Error::Interrupted);
        }

        if task.node_type == NodeType::Dir {
            self.mkdir(task, token).await?;
            self.progress.add_finished(1);
            return Ok(());
        }

        if self.is_downloaded(task).await? {
            debug!("已下载，跳过: {}", task.dst_path);
            self.skipped.fetch_add(1, Ordering::Relaxed);
            self.progress.add_finished(1);
            return Ok(());
        }

        self.events.emit(Event::TaskStarted {
            target: self.target,
            path: task.src_path.clone(),
        });

        let bytes = with_retry(
            &format!("下载 {}", task.src_path),
            self.config.n_retries,
            self.config.retry_base_delay_ms,
            token,
            || self.transfer(task, token),
        )
        .await
        .inspect_err(|e| {
            if !e.is_interrupted() {
                warn!("下载失败 {}: {}", task.src_path, e);
                self.progress.add_failed(1);
            }
        })?;

        self.progress.add_bytes(bytes);
        self.progress.add_finished(1);
        self.events.emit(Event::TaskProgress {
            target: self.target,
            path: task.src_path.clone(),
            bytes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlainCipher;
    use crate::storage::{LocalStorage, RemoteStorage};
    use crate::EngineConfig;

    #[tokio::test]
    async fn test_worker_count_uses_either_side() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            n_workers: 4,
            data_dir: dir.path().join("index"),
            ..Default::default()
        };
        let ctx = Context::new(config, EventSender::default());

        let local: SharedStorage =
            Arc::new(LocalStorage::new(dir.path().to_str().unwrap()).unwrap());
        let builder = opendal::services::Fs::default().root(dir.path().to_str().unwrap());
        let remote: SharedStorage = Arc::new(RemoteStorage::from_operator(
            opendal::Operator::new(builder).unwrap().finish(),
            "fs",
        ));
        let local_folder = Folder::new("src", local.clone(), PlainCipher::shared(), false, "/");
        let remote_folder = Folder::new("rsrc", remote.clone(), PlainCipher::shared(), false, "/");

        let local_to_local =
            DownloadTarget::new(&ctx, local_folder.clone(), "/", local.clone(), "/out");
        assert_eq!(local_to_local.n_workers(), 1);

        let local_to_remote = DownloadTarget::new(&ctx, local_folder, "/", remote, "/out");
        assert_eq!(local_to_remote.n_workers(), 4);

        let remote_to_local = DownloadTarget::new(&ctx, remote_folder, "/", local, "/out");
        assert_eq!(remote_to_local.n_workers(), 4);
    }
}
