#![allow(dead_code)]

use encsync_lib::core::{Event, EventSender, Folder};
use encsync_lib::crypto::{Cipher, PlainCipher, SharedCipher};
use encsync_lib::storage::{BoxReader, LocalStorage};
use encsync_lib::{Context, EngineConfig, Error, Result};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc::UnboundedReceiver;

/// 测试环境：临时目录加上共享的引擎上下文
pub struct Env {
    pub dir: TempDir,
    pub ctx: Context,
}

impl Env {
    pub fn new() -> Self {
        Self::with_events(EventSender::default())
    }

    pub fn with_channel() -> (Self, UnboundedReceiver<Event>) {
        let (events, rx) = EventSender::channel();
        (Self::with_events(events), rx)
    }

    fn with_events(events: EventSender) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            data_dir: dir.path().join("index"),
            n_retries: 1,
            retry_base_delay_ms: 1,
            ..Default::default()
        };
        let ctx = Context::new(config, events);
        Self { dir, ctx }
    }

    pub fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    /// 以 `sub` 为根的本地目录
    pub fn folder(&self, name: &str, sub: &str) -> Folder {
        self.folder_with(name, sub, PlainCipher::shared(), false)
    }

    pub fn encrypted_folder(&self, name: &str, sub: &str) -> Folder {
        self.folder_with(name, sub, ToyCipher::shared(), true)
    }

    fn folder_with(&self, name: &str, sub: &str, cipher: SharedCipher, encrypted: bool) -> Folder {
        let root = self.path(sub);
        let storage = Arc::new(LocalStorage::new(root.to_str().unwrap()).unwrap());
        Folder::new(name, storage, cipher, encrypted, "/")
    }
}

pub fn write(path: impl AsRef<Path>, content: &[u8]) {
    let path = path.as_ref();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

/// 目录下全部条目的相对路径（目录以 `/` 结尾），按名称排序
pub fn tree(root: impl AsRef<Path>) -> Vec<String> {
    let root = root.as_ref();
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .map(|e| {
            let rel = e
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            if e.file_type().is_dir() {
                format!("{}/", rel)
            } else {
                rel
            }
        })
        .collect()
}

pub fn drain(rx: &mut UnboundedReceiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

const HEADER: &[u8] = b"TOY!";

/// 测试用的可逆“加密”
///
/// 每级名称编码为 `<iv 十六进制>_<倒序名称>`，每级一个字节的 IV；
/// 内容前加四字节头部。
#[derive(Default)]
pub struct ToyCipher {
    next_iv: AtomicU8,
}

impl ToyCipher {
    pub fn shared() -> SharedCipher {
        Arc::new(Self {
            next_iv: AtomicU8::new(1),
        })
    }

    pub fn encode(iv: u8, name: &str) -> String {
        format!("{:02x}_{}", iv, name.chars().rev().collect::<String>())
    }
}

impl Cipher for ToyCipher {
    fn encrypt_path(&self, path: &str, ivs: &[u8]) -> Result<(String, Vec<u8>)> {
        let mut out = String::new();
        let mut used = Vec::new();

        for (i, name) in path.split('/').filter(|s| !s.is_empty()).enumerate() {
            let iv = match ivs.get(i) {
                Some(iv) => *iv,
                None => self.next_iv.fetch_add(1, Ordering::Relaxed),
            };
            out.push('/');
            out.push_str(&Self::encode(iv, name));
            used.push(iv);
        }

        Ok((out, used))
    }

    fn decrypt_path(&self, path: &str) -> Result<(String, Vec<u8>)> {
        let mut out = Vec::new();
        let mut ivs = Vec::new();

        for raw in path.split('/').filter(|s| !s.is_empty()) {
            let (iv, name) = raw
                .split_once('_')
                .ok_or_else(|| Error::Integrity(format!("无法解密: {}", raw)))?;
            let iv = u8::from_str_radix(iv, 16)
                .map_err(|_| Error::Integrity(format!("无效的 IV: {}", raw)))?;
            out.push(name.chars().rev().collect::<String>());
            ivs.push(iv);
        }

        let name = out.join("/");
        Ok((if path.starts_with('/') { format!("/{}", name) } else { name }, ivs))
    }

    fn encrypt_stream(&self, input: BoxReader) -> BoxReader {
        Box::pin(HEADER.chain(input))
    }

    fn decrypt_stream(&self, input: BoxReader) -> BoxReader {
        Box::pin(SkipHeader {
            inner: input,
            remaining: HEADER.len(),
        })
    }

    fn padded_size(&self, size: u64) -> u64 {
        size
    }

    fn overhead(&self) -> u64 {
        HEADER.len() as u64
    }
}

struct SkipHeader {
    inner: BoxReader,
    remaining: usize,
}

impl AsyncRead for SkipHeader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        while self.remaining > 0 {
            let mut scratch = [0u8; 8];
            let n = self.remaining.min(scratch.len());
            let mut head = ReadBuf::new(&mut scratch[..n]);
            ready!(self.inner.as_mut().poll_read(cx, &mut head))?;

            let got = head.filled().len();
            if got == 0 {
                return Poll::Ready(Ok(()));
            }
            self.remaining -= got;
        }

        self.inner.as_mut().poll_read(cx, buf)
    }
}
