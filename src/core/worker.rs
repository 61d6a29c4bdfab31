//! 工作者池
//!
//! 多个 tokio 任务共同消费一个可变任务队列，处理过程中仍可继续添加任务。
//! 队列为空、没有工作者在执行任务且没有生产者时，池自然结束；
//! 停止请求只在检查点生效。

use super::{Status, StatusCell};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::VecDeque;
use crate::error::Error;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 任务处理器
#[async_trait]
pub trait TaskHandler<T>: Send + Sync + 'static
where
    T: Send + Sync + 'static,
{
    async fn run(&self, task: &T, queue: &TaskQueue<T>) -> Result<()>;
}

/// 失败的任务及其错误
#[derive(Debug)]
pub struct FailedTask<T> {
    pub task: T,
    pub error: String,
}

/// 运行结束后的统计
///
/// 每个入队的任务恰好落在其中一类：完成、失败或挂起。
#[derive(Debug)]
pub struct PoolReport<T> {
    pub finished: usize,
    pub failed: Vec<FailedTask<T>>,
    /// 被中断或未开始的任务，可在恢复时重新入队
    pub suspended: Vec<T>,
}

impl<T> Default for PoolReport<T> {
    fn default() -> Self {
        Self {
            finished: 0,
            failed: Vec::new(),
            suspended: Vec::new(),
        }
    }
}

impl<T> PoolReport<T> {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.suspended.is_empty()
    }

    pub fn total(&self) -> usize {
        self.finished + self.failed.len() + self.suspended.len()
    }

    pub fn errors(&self) -> impl Iterator<Item = &str> {
        self.failed.iter().map(|f| f.error.as_str())
    }
}

struct QueueState<T> {
    tasks: VecDeque<T>,
    busy: usize,
    producers: usize,
    report: PoolReport<T>,
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    dirty: Notify,
    token: CancellationToken,
    owner: Option<Arc<StatusCell>>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 添加任务用的句柄，可在处理器内部使用
pub struct TaskQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> TaskQueue<T> {
    pub fn add(&self, task: T) {
        self.shared.lock().tasks.push_back(task);
        self.shared.dirty.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.token.is_cancelled()
    }
}

/// 与工作者并行产生任务的句柄
///
/// 存在期间，队列为空的工作者会等待新任务而不是退出；
/// 队列达到容量时 `push` 等待工作者取走任务。
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
    capacity: usize,
}

impl<T> Producer<T> {
    pub async fn push(&self, task: T) -> Result<()> {
        let mut task = Some(task);

        loop {
            let notified = self.shared.dirty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.token.is_cancelled() {
                return Err(Error::Interrupted);
            }

            {
                let mut state = self.shared.lock();
                if state.tasks.len() < self.capacity {
                    if let Some(task) = task.take() {
                        state.tasks.push_back(task);
                    }
                    drop(state);
                    self.shared.dirty.notify_waiters();
                    return Ok(());
                }
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.shared.token.cancelled() => {}
            }
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.shared.token
    }
}

impl<T> Drop for Producer<T> {
    fn drop(&mut self) {
        self.shared.lock().producers -= 1;
        self.shared.dirty.notify_waiters();
    }
}

enum Next<T> {
    Run(T),
    Wait,
    Done,
}

pub struct WorkerPool<T> {
    shared: Arc<Shared<T>>,
    handles: Vec<JoinHandle<()>>,
}

impl<T> WorkerPool<T>
where
    T: Send + Sync + 'static,
{
    /// `parent` 取消时池也随之停止
    pub fn new(parent: &CancellationToken) -> Self {
        Self::build(parent.child_token(), None)
    }

    /// 任务失败或中断时同时更新所属目标的状态
    pub fn with_owner(parent: &CancellationToken, owner: Arc<StatusCell>) -> Self {
        Self::build(parent.child_token(), Some(owner))
    }

    fn build(token: CancellationToken, owner: Option<Arc<StatusCell>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    tasks: VecDeque::new(),
                    busy: 0,
                    producers: 0,
                    report: PoolReport::default(),
                }),
                dirty: Notify::new(),
                token,
                owner,
            }),
            handles: Vec::new(),
        }
    }

    pub fn queue(&self) -> TaskQueue<T> {
        TaskQueue {
            shared: self.shared.clone(),
        }
    }

    pub fn add(&self, task: T) {
        self.queue().add(task);
    }

    /// 注册一个生产者，需在 `start` 之前调用，否则工作者可能提前退出
    pub fn producer(&self, capacity: usize) -> Producer<T> {
        self.shared.lock().producers += 1;
        Producer {
            shared: self.shared.clone(),
            capacity: capacity.max(1),
        }
    }

    pub fn start<H>(&mut self, n_workers: usize, handler: Arc<H>)
    where
        H: TaskHandler<T>,
    {
        for id in 0..n_workers.max(1) {
            let shared = self.shared.clone();
            let handler = handler.clone();
            self.handles
                .push(tokio::spawn(worker_loop(id, shared, handler)));
        }
    }

    /// 请求停止；正在执行的任务在下一个检查点退出
    pub fn stop(&self) {
        self.shared.token.cancel();
        self.shared.dirty.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// 等待所有工作者退出，未执行的任务计入 `suspended`
    pub async fn join(self) -> PoolReport<T> {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("工作者异常退出: {}", e);
            }
        }

        let mut state = self.shared.lock();
        let leftover: Vec<T> = state.tasks.drain(..).collect();
        if !leftover.is_empty() {
            debug!("{} 个任务未执行", leftover.len());
        }
        state.report.suspended.extend(leftover);
        std::mem::take(&mut state.report)
    }

    pub async fn run<H>(mut self, n_workers: usize, handler: Arc<H>) -> PoolReport<T>
    where
        H: TaskHandler<T>,
    {
        self.start(n_workers, handler);
        self.join().await
    }

    /// 启动工作者的同时运行 `produce` 逐个提交任务
    ///
    /// 生产失败时停止整个池并返回该错误。
    pub async fn run_with<H, F, Fut>(
        mut self,
        n_workers: usize,
        handler: Arc<H>,
        capacity: usize,
        produce: F,
    ) -> Result<PoolReport<T>>
    where
        H: TaskHandler<T>,
        F: FnOnce(Producer<T>) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let producer = self.producer(capacity);
        self.start(n_workers, handler);

        let produced = produce(producer).await;
        if let Err(e) = &produced {
            if !e.is_interrupted() {
                warn!("任务生产失败: {}", e);
            }
            self.stop();
        }

        let report = self.join().await;
        produced.map(|()| report)
    }
}

async fn worker_loop<T, H>(id: usize, shared: Arc<Shared<T>>, handler: Arc<H>)
where
    T: Send + Sync + 'static,
    H: TaskHandler<T>,
{
    let queue = TaskQueue {
        shared: shared.clone(),
    };

    loop {
        let notified = shared.dirty.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let next = {
            let mut state = shared.lock();
            if shared.token.is_cancelled() {
                Next::Done
            } else if let Some(task) = state.tasks.pop_front() {
                state.busy += 1;
                Next::Run(task)
            } else if state.busy == 0 && state.producers == 0 {
                Next::Done
            } else {
                Next::Wait
            }
        };

        let task = match next {
            Next::Run(task) => task,
            Next::Done => break,
            Next::Wait => {
                tokio::select! {
                    _ = &mut notified => {}
                    _ = shared.token.cancelled() => {}
                }
                continue;
            }
        };

        let result = handler.run(&task, &queue).await;

        {
            let mut state = shared.lock();
            state.busy -= 1;

            match result {
                Ok(()) => state.report.finished += 1,
                Err(e) if e.is_interrupted() => {
                    debug!("工作者 {} 的任务被中断", id);
                    if let Some(owner) = &shared.owner {
                        owner.settle(Status::Suspended);
                    }
                    state.report.suspended.push(task);
                }
                Err(e) => {
                    warn!("工作者 {} 的任务失败: {}", id, e);
                    if let Some(owner) = &shared.owner {
                        owner.settle(Status::Failed);
                    }
                    state.report.failed.push(FailedTask {
                        task,
                        error: e.to_string(),
                    });
                }
            }
        }

        shared.dirty.notify_waiters();
    }

    // 让仍在等待的工作者重新检查退出条件
    shared.dirty.notify_waiters();
}
