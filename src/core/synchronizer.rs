//! 同步：把本地目录的变化应用到远程目录
//!
//! 依次执行：扫描本地、按需扫描远程、比较、删除、创建目录、上传。
//! 上传任务在比较过程中逐个产生，工作者同时处理。
//! 远程索引在每个操作成功后立即更新，中断后再次运行只处理剩余的差异。

use super::{
    Diff, DiffAction, Event, EventSender, FileComparator, Folder, NodeSource, PoolReport,
    Producer, ProgressCounters, ScanTarget, Status, Target, TargetKind, TargetState,
    TaskHandler, TaskQueue, WorkerPool,
};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::filelist::{FileList, Node, NodeCursor, NodeType};
use crate::paths;
use crate::storage::{with_retry, BoxReader, TransferOptions};
use crate::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub removed: usize,
    pub created_dirs: usize,
    pub uploaded: usize,
    pub failed: usize,
}

pub struct SyncTarget {
    ctx: Context,
    local: Folder,
    remote: Folder,
    state: TargetState,
}

impl SyncTarget {
    pub fn new(ctx: &Context, local: Folder, remote: Folder) -> Self {
        Self {
            state: TargetState::new(&ctx.config),
            ctx: ctx.clone(),
            local,
            remote,
        }
    }

    async fn open_list(&self, folder: &Folder) -> Result<FileList> {
        let list = FileList::open(
            &self.ctx.stores,
            &self.ctx.config.index_path(&folder.name),
            self.ctx.config.fetch_size,
        )
        .await?;
        list.create().await?;
        Ok(list)
    }

    /// 比较两个索引，本地为新状态，远程为基准
    pub async fn comparator(&self) -> Result<FileComparator<NodeCursor, NodeCursor>> {
        let local_list = self.open_list(&self.local).await?;
        let remote_list = self.open_list(&self.remote).await?;

        Ok(FileComparator::new(
            local_list.find_node_children(&self.local.prefix),
            remote_list.find_node_children(&self.remote.prefix),
            &self.local.prefix,
            &self.remote.prefix,
        ))
    }

    pub async fn sync(&self, token: &CancellationToken) -> Result<SyncSummary> {
        info!(
            "开始同步: {} -> {}",
            self.local.storage.name(),
            self.remote.storage.name()
        );

        ScanTarget::new(&self.ctx, self.local.clone())
            .scan(token)
            .await?;

        let remote_list = self.open_list(&self.remote).await?;
        if self.ctx.config.rescan_remote || remote_list.is_empty().await? {
            ScanTarget::new(&self.ctx, self.remote.clone())
                .scan(token)
                .await?;
        }

        if token.is_cancelled() {
            return Err(Error::Interrupted);
        }

        // 删除和建目录的数量较少，先收集；文件在第二遍比较时边比较边上传
        let mut removals = Vec::new();
        let mut dirs = Vec::new();
        let mut comparator = self.comparator().await?;
        while let Some(diff) = comparator.next().await? {
            match (diff.action, diff.node_type) {
                (DiffAction::Rm, _) => removals.push(diff),
                (DiffAction::New, NodeType::Dir) => dirs.push(diff),
                (DiffAction::New, NodeType::File) => {}
            }
        }
        drop(comparator);
        debug!("比较完成: 删除 {}, 目录 {}", removals.len(), dirs.len());
        self.state
            .progress
            .add_total((removals.len() + dirs.len()) as u64);

        let stage = Arc::new(Stage {
            target: self.state.id(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            remote_list,
            config: self.ctx.config.clone(),
            events: self.ctx.events.clone(),
            progress: self.state.progress.clone(),
            upload: self.state.upload_options(token, &self.ctx.config),
        });

        let parallel = if self.remote.storage.parallelizable() {
            self.ctx.config.n_workers
        } else {
            1
        };

        let mut summary = SyncSummary::default();

        let report = self
            .run_stage(removals, parallel, Arc::new(Remover(stage.clone())), token)
            .await?;
        summary.removed = report.finished;
        summary.failed += report.failed.len();

        // 目录按路径顺序逐个创建
        let report = self
            .run_stage(dirs, 1, Arc::new(DirMaker(stage.clone())), token)
            .await?;
        summary.created_dirs = report.finished;
        summary.failed += report.failed.len();

        // 删除和建目录已写入远程索引，这一遍只剩文件差异
        let mut comparator = self.comparator().await?;
        let progress = self.state.progress.clone();
        let pool = WorkerPool::with_owner(token, self.state.status().clone());
        let report = pool
            .run_with(
                parallel,
                Arc::new(Uploader(stage)),
                self.ctx.config.queue_limit,
                |producer| async move {
                    feed_files(&mut comparator, &producer, &progress).await
                },
            )
            .await?;
        let report = self.check_report(report, token)?;
        summary.uploaded = report.finished;
        summary.failed += report.failed.len();

        if summary.failed > 0 {
            return Err(Error::Fatal(format!("{} 个操作失败", summary.failed)));
        }

        info!(
            "同步完成: 删除 {}, 创建目录 {}, 上传 {}",
            summary.removed, summary.created_dirs, summary.uploaded
        );
        Ok(summary)
    }

    async fn run_stage<H>(
        &self,
        tasks: Vec<Diff>,
        n_workers: usize,
        handler: Arc<H>,
        token: &CancellationToken,
    ) -> Result<PoolReport<Diff>>
    where
        H: TaskHandler<Diff>,
    {
        if tasks.is_empty() {
            return Ok(PoolReport::default());
        }

        let pool = WorkerPool::with_owner(token, self.state.status().clone());
        for task in tasks {
            pool.add(task);
        }

        let report = pool.run(n_workers, handler).await;
        self.check_report(report, token)
    }

    /// 有任务被中断时整体视为中断；失败的任务逐个上报
    fn check_report(
        &self,
        report: PoolReport<Diff>,
        token: &CancellationToken,
    ) -> Result<PoolReport<Diff>> {
        if !report.suspended.is_empty() || token.is_cancelled() {
            return Err(Error::Interrupted);
        }

        for failed in &report.failed {
            self.ctx.events.emit(Event::Error {
                target: Some(self.state.id()),
                message: format!("{}: {}", failed.task.path, failed.error),
            });
        }

        Ok(report)
    }
}

/// 把比较得到的文件差异逐个交给上传队列
async fn feed_files<N, B>(
    comparator: &mut FileComparator<N, B>,
    producer: &Producer<Diff>,
    progress: &ProgressCounters,
) -> Result<()>
where
    N: NodeSource,
    B: NodeSource,
{
    while let Some(diff) = comparator.next().await? {
        if diff.action != DiffAction::New || diff.node_type != NodeType::File {
            continue;
        }
        progress.add_total(1);
        producer.push(diff).await?;
    }
    Ok(())
}

#[async_trait]
impl Target for SyncTarget {
    fn state(&self) -> &TargetState {
        &self.state
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Sync
    }

    async fn execute(&self, token: CancellationToken) -> Result<()> {
        self.state.status().set(Status::Pending);

        match self.sync(&token).await {
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

/// 各阶段共用的数据
struct Stage {
    target: Uuid,
    local: Folder,
    remote: Folder,
    remote_list: FileList,
    config: Arc<EngineConfig>,
    events: EventSender,
    progress: Arc<ProgressCounters>,
    upload: TransferOptions,
}

impl Stage {
    fn remote_path(&self, diff: &Diff) -> String {
        paths::join(&self.remote.prefix, &diff.path)
    }

    /// 父目录在远程索引中的 IV
    async fn parent_ivs(&self, path: &str) -> Result<Vec<u8>> {
        if paths::dir_normalize(path) == paths::dir_normalize(&self.remote.prefix) {
            return Ok(Vec::new());
        }

        let (parent, _) = paths::split(path);
        Ok(self
            .remote_list
            .find_node(&parent)
            .await?
            .map(|node| node.ivs)
            .unwrap_or_default())
    }

    async fn retry<T, F, Fut>(&self, what: &str, token: &CancellationToken, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        with_retry(
            what,
            self.config.n_retries,
            self.config.retry_base_delay_ms,
            token,
            op,
        )
        .await
    }

    /// 读取本地文件，按需解密再加密后写入远程
    async fn transfer(&self, src: &str, dst: &str, token: &CancellationToken) -> Result<u64> {
        let (writer, reader) = tokio::io::duplex(self.config.chunk_size.max(1));

        let read_opts = TransferOptions {
            cancel: token.clone(),
            chunk_size: self.config.chunk_size,
            ..Default::default()
        };
        let mut download = self.local.storage.download(src, Box::pin(writer), read_opts);

        let mut source: BoxReader = Box::pin(reader);
        if self.local.encrypted {
            source = self.local.cipher.decrypt_stream(source);
        }
        if self.remote.encrypted {
            source = self.remote.cipher.encrypt_stream(source);
        }

        let upload_opts = TransferOptions {
            cancel: token.clone(),
            ..self.upload.clone()
        };
        let mut upload = self.remote.storage.upload(source, dst, upload_opts);

        tokio::try_join!(download.work(), upload.work())?;
        Ok(upload.transferred())
    }
}

struct Remover(Arc<Stage>);

#[async_trait]
impl TaskHandler<Diff> for Remover {
    async fn run(&self, diff: &Diff, queue: &TaskQueue<Diff>) -> Result<()> {
        let stage = &self.0;
        let path = stage.remote_path(diff);
        let (raw_path, _) = stage.remote.raw_path(&path, &diff.ivs)?;

        let removed = stage
            .retry(&format!("删除 {}", raw_path), queue.token(), || {
                stage.remote.storage.remove(&raw_path)
            })
            .await;
        match removed {
            Ok(()) => {}
            Err(Error::NotFound(_)) => debug!("远程已不存在: {}", raw_path),
            Err(e) => return Err(e),
        }

        stage.remote_list.remove_node_children(&path).await?;
        stage.remote_list.remove_node(&path).await?;
        stage.progress.add_finished(1);
        Ok(())
    }
}

struct DirMaker(Arc<Stage>);

#[async_trait]
impl TaskHandler<Diff> for DirMaker {
    async fn run(&self, diff: &Diff, queue: &TaskQueue<Diff>) -> Result<()> {
        let stage = &self.0;
        let path = stage.remote_path(diff);
        let parent_ivs = stage.parent_ivs(&path).await?;
        let (raw_path, ivs) = stage.remote.raw_path(&path, &parent_ivs)?;

        let created = stage
            .retry(&format!("创建目录 {}", raw_path), queue.token(), || {
                stage.remote.storage.mkdir(&raw_path)
            })
            .await;
        match created {
            Ok(()) | Err(Error::AlreadyExists(_)) => {}
            Err(e) => return Err(e),
        }

        stage
            .remote_list
            .insert_node(&Node::dir(path).with_ivs(ivs))
            .await?;
        stage.progress.add_finished(1);
        Ok(())
    }
}

struct Uploader(Arc<Stage>);

#[async_trait]
impl TaskHandler<Diff> for Uploader {
    async fn run(&self, diff: &Diff, queue: &TaskQueue<Diff>) -> Result<()> {
        let stage = &self.0;
        let token = queue.token();
        let local_path = paths::join(&stage.local.prefix, &diff.path);
        let remote_path = stage.remote_path(diff);

        // 更新已有文件时沿用原来的 IV，保持远程名称不变
        let ivs = if diff.ivs.is_empty() {
            stage.parent_ivs(&remote_path).await?
        } else {
            diff.ivs.clone()
        };
        let (raw_remote, ivs) = stage.remote.raw_path(&remote_path, &ivs)?;
        let (raw_local, _) = stage.local.raw_path(&local_path, &diff.node.ivs)?;

        stage.events.emit(Event::TaskStarted {
            target: stage.target,
            path: diff.path.clone(),
        });

        let bytes = stage
            .retry(&format!("上传 {}", diff.path), token, || {
                stage.transfer(&raw_local, &raw_remote, token)
            })
            .await
            .inspect_err(|e| {
                if !e.is_interrupted() {
                    warn!("上传失败 {}: {}", diff.path, e);
                    stage.progress.add_failed(1);
                }
            })?;

        stage
            .remote_list
            .insert_node(
                &Node::file(remote_path, diff.node.modified, diff.node.padded_size).with_ivs(ivs),
            )
            .await?;

        stage.progress.add_bytes(bytes);
        stage.progress.add_finished(1);
        stage.events.emit(Event::TaskProgress {
            target: stage.target,
            path: diff.path.clone(),
            bytes,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NodeStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// 产出第 `gate` 个节点之前要求已有任务被处理
    struct Gated {
        nodes: NodeStream,
        emitted: usize,
        gate: usize,
        handled: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl NodeSource for Gated {
        async fn next_node(&mut self) -> Result<Option<Node>> {
            if self.emitted == self.gate {
                let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
                while self.handled.load(Ordering::SeqCst) == 0 {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(Error::Fatal("比较结束前没有任务被处理".into()));
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            }
            self.emitted += 1;
            self.nodes.next_node().await
        }
    }

    struct Count(Arc<AtomicUsize>);

    #[async_trait]
    impl TaskHandler<Diff> for Count {
        async fn run(&self, _diff: &Diff, _queue: &TaskQueue<Diff>) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_uploads_start_before_comparison_ends() {
        let handled = Arc::new(AtomicUsize::new(0));
        let nodes: NodeStream = (0..6)
            .map(|i| Node::file(format!("/f{}", i), 1, 1))
            .collect();
        let mut comparator = FileComparator::new(
            Gated {
                nodes,
                emitted: 0,
                gate: 3,
                handled: handled.clone(),
            },
            NodeStream::from(Vec::new()),
            "/",
            "/",
        );
        let progress = ProgressCounters::default();

        let pool = WorkerPool::new(&CancellationToken::new());
        let report = pool
            .run_with(2, Arc::new(Count(handled.clone())), 10, |producer| async move {
                feed_files(&mut comparator, &producer, &progress).await
            })
            .await
            .unwrap();

        assert_eq!(report.finished, 6);
        assert_eq!(handled.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_feed_skips_removals_and_dirs() {
        let local: NodeStream = vec![Node::dir("/d"), Node::file("/d/x", 1, 1)].into();
        let remote: NodeStream = vec![Node::file("/old", 1, 1)].into();
        let mut comparator = FileComparator::new(local, remote, "/", "/");
        let progress = Arc::new(ProgressCounters::default());

        let pool = WorkerPool::new(&CancellationToken::new());
        let counted = progress.clone();
        let handled = Arc::new(AtomicUsize::new(0));
        let report = pool
            .run_with(1, Arc::new(Count(handled.clone())), 4, |producer| async move {
                feed_files(&mut comparator, &producer, &counted).await
            })
            .await
            .unwrap();

        assert_eq!(report.finished, 1);
        assert_eq!(progress.snapshot().total_children, 1);
    }
}
