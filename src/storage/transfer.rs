//! 传输控制 - 停止、进度、限速和重试

use crate::error::{Error, Result};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// 限速器单次睡眠的最长时间
pub const MAX_SLEEP_SLICE: Duration = Duration::from_millis(250);

/// 共享的速度上限（字节/秒），0 表示不限制；可在传输过程中修改
#[derive(Debug, Clone, Default)]
pub struct SpeedLimit(Arc<AtomicU64>);

impl SpeedLimit {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self(Arc::new(AtomicU64::new(bytes_per_sec)))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn set(&self, bytes_per_sec: u64) {
        self.0.store(bytes_per_sec, Ordering::Relaxed);
    }
}

/// 累计自上次重置以来的字节数，超出上限时分片睡眠
pub struct SpeedLimiter {
    limit: SpeedLimit,
    applied: u64,
    since: Instant,
    bytes: u64,
}

impl SpeedLimiter {
    pub fn new(limit: SpeedLimit) -> Self {
        Self {
            applied: limit.get(),
            limit,
            since: Instant::now(),
            bytes: 0,
        }
    }

    fn reset(&mut self, limit: u64) {
        self.applied = limit;
        self.since = Instant::now();
        self.bytes = 0;
    }

    /// 记录 n 字节；需要时睡眠，睡眠期间收到停止请求立即返回 `Interrupted`
    pub async fn consume(&mut self, n: u64, cancel: &CancellationToken) -> Result<()> {
        let limit = self.limit.get();
        if limit != self.applied {
            self.reset(limit);
        }
        if limit == 0 {
            return Ok(());
        }

        self.bytes += n;
        let expected = Duration::from_secs_f64(self.bytes as f64 / limit as f64);

        loop {
            let elapsed = self.since.elapsed();
            if elapsed >= expected {
                break;
            }

            let slice = (expected - elapsed).min(MAX_SLEEP_SLICE);
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Interrupted),
                _ = tokio::time::sleep(slice) => {}
            }

            if self.limit.get() != self.applied {
                self.reset(self.limit.get());
                break;
            }
        }

        Ok(())
    }
}

/// 单次传输的参数
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub limit: SpeedLimit,
    /// 父级停止信号（通常是目标的 token）
    pub cancel: CancellationToken,
    pub chunk_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            limit: SpeedLimit::default(),
            cancel: CancellationToken::new(),
            chunk_size: 64 * 1024,
        }
    }
}

/// 传输任务内部持有的控制句柄
///
/// 不拥有控制器；控制器释放后 `alive` 被清除，传输在下一个检查点停止。
#[derive(Clone)]
pub struct ControlHandle {
    token: CancellationToken,
    alive: Arc<AtomicBool>,
    transferred: Arc<AtomicU64>,
    limit: SpeedLimit,
    chunk_size: usize,
}

impl ControlHandle {
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled() || !self.alive.load(Ordering::Acquire)
    }

    /// 检查点：已停止时返回 `Interrupted`
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn limiter(&self) -> SpeedLimiter {
        SpeedLimiter::new(self.limit.clone())
    }

    pub fn add_transferred(&self, n: u64) {
        self.transferred.fetch_add(n, Ordering::Relaxed);
    }
}

type Job = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// 一次上传或下载
pub struct TransferController {
    token: CancellationToken,
    alive: Arc<AtomicBool>,
    transferred: Arc<AtomicU64>,
    job: Option<Job>,
}

impl TransferController {
    pub fn new<F, Fut>(opts: &TransferOptions, job: F) -> Self
    where
        F: FnOnce(ControlHandle) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let token = opts.cancel.child_token();
        let alive = Arc::new(AtomicBool::new(true));
        let transferred = Arc::new(AtomicU64::new(0));

        let handle = ControlHandle {
            token: token.clone(),
            alive: alive.clone(),
            transferred: transferred.clone(),
            limit: opts.limit.clone(),
            chunk_size: opts.chunk_size.max(1),
        };

        Self {
            token,
            alive,
            transferred,
            job: Some(Box::pin(job(handle))),
        }
    }

    /// 执行传输直到完成；停止后的任何失败都报告为 `Interrupted`
    pub async fn work(&mut self) -> Result<()> {
        let job = self
            .job
            .take()
            .ok_or_else(|| Error::Fatal("传输已执行过".to_string()))?;

        match job.await {
            Err(e) if self.is_stopped() && !e.is_interrupted() => {
                warn!("传输停止后出错: {}", e);
                Err(Error::Interrupted)
            }
            result => result,
        }
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 已传输的字节数
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Relaxed)
    }
}

impl Drop for TransferController {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
    }
}

/// 分块复制，每块前后检查停止信号并限速
pub async fn copy_limited<R, W>(
    reader: &mut R,
    writer: &mut W,
    handle: &ControlHandle,
) -> Result<u64>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut limiter = handle.limiter();
    let mut buf = vec![0u8; handle.chunk_size()];
    let mut total = 0u64;

    loop {
        handle.ensure_running()?;
        let n = reader.read(&mut buf).await?;
        handle.ensure_running()?;

        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;
        handle.add_transferred(n as u64);
        total += n as u64;
        limiter.consume(n as u64, handle.token()).await?;
    }

    writer.flush().await?;
    Ok(total)
}

/// 临时错误按指数退避重试，其余错误直接返回
pub async fn with_retry<T, F, Fut>(
    what: &str,
    max_retries: u32,
    base_delay_ms: u64,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }

        match op().await {
            Err(e) if e.is_retriable() && attempt < max_retries => {
                let delay = base_delay_ms.saturating_mul(2_u64.saturating_pow(attempt));
                warn!(
                    "{} 失败，{}ms 后重试 ({}/{}): {}",
                    what,
                    delay,
                    attempt + 1,
                    max_retries,
                    e
                );
                attempt += 1;

                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Interrupted),
                    _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                }
            }
            Err(e) if e.is_retriable() => {
                error!("{} 最终失败 (已重试{}次): {}", what, max_retries, e);
                return Err(e);
            }
            result => return result,
        }
    }
}
