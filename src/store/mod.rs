//! 索引存储 - 单写者 SQLite 文件的串行化、事务感知访问
//!
//! 每个数据库文件只有一个串行器任务持有真正的 SQLite 连接，
//! 逻辑连接 ([`Connection`]) 把操作排队提交给它并等待结果。
//! 某个逻辑连接打开事务期间，其他连接的请求被推迟执行。

mod connection;
mod serializer;

pub use connection::{Connection, Group, TransactionMode};

use crate::error::{Error, Result};
use serializer::Serializer;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// SQL 参数和结果值
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Real(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Blob(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// 查询结果行
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    pub fn text(&self, idx: usize) -> Option<&str> {
        match self.0.get(idx) {
            Some(Value::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn integer(&self, idx: usize) -> Option<i64> {
        match self.0.get(idx) {
            Some(Value::Integer(v)) => Some(*v),
            Some(Value::Real(v)) => Some(*v as i64),
            _ => None,
        }
    }

    /// BLOB 列；TEXT 也按字节返回
    pub fn blob(&self, idx: usize) -> Option<&[u8]> {
        match self.0.get(idx) {
            Some(Value::Blob(b)) => Some(b),
            Some(Value::Text(s)) => Some(s.as_bytes()),
            _ => None,
        }
    }
}

/// 串行器注册表：规范路径 -> 串行器
///
/// 作为服务对象注入到各组件中，而不是全局单例。
pub struct StoreManager {
    serializers: Mutex<HashMap<PathBuf, Arc<Serializer>>>,
    queue_limit: usize,
}

impl StoreManager {
    pub fn new(queue_limit: usize) -> Arc<Self> {
        Arc::new(Self {
            serializers: Mutex::new(HashMap::new()),
            queue_limit,
        })
    }

    /// 打开一个逻辑连接，必要时创建并启动串行器
    pub async fn open(&self, path: &Path) -> Result<Connection> {
        let key = canonical_key(path)?;

        let serializer = {
            let mut serializers = self.lock();
            serializers
                .entry(key.clone())
                .or_insert_with(|| {
                    debug!("创建索引串行器: {:?}", key);
                    Arc::new(Serializer::new(key.clone(), self.queue_limit))
                })
                .clone()
        };

        Connection::register(serializer).await
    }

    /// 停止某个文件的串行器；之后的请求返回 `StoreClosed`，再次 open 时重启
    pub fn close(&self, path: &Path) {
        let Ok(key) = canonical_key(path) else {
            return;
        };

        if let Some(serializer) = self.lock().get(&key) {
            serializer.stop();
        }
    }

    pub fn close_all(&self) {
        for serializer in self.lock().values() {
            serializer.stop();
        }
    }

    pub fn is_running(&self, path: &Path) -> bool {
        canonical_key(path)
            .ok()
            .and_then(|key| self.lock().get(&key).map(|s| s.is_running()))
            .unwrap_or(false)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, Arc<Serializer>>> {
        self.serializers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 父目录规范化后的绝对路径（数据库文件本身可能还不存在）
fn canonical_key(path: &Path) -> Result<PathBuf> {
    let file_name = path
        .file_name()
        .ok_or_else(|| Error::Integrity(format!("无效的索引路径: {:?}", path)))?;

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    std::fs::create_dir_all(&parent)?;
    Ok(std::fs::canonicalize(&parent)?.join(file_name))
}
