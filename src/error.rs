//! 错误类型

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// 路径不存在
    #[error("路径不存在: {0}")]
    NotFound(String),

    /// 路径已存在
    #[error("路径已存在: {0}")]
    AlreadyExists(String),

    /// 临时错误（服务器或网络故障），可以重试
    #[error("临时存储错误: {0}")]
    Transient(String),

    /// 不可恢复的存储错误
    #[error("存储错误: {0}")]
    Fatal(String),

    /// 协作式中断（收到停止请求）
    #[error("操作已中断")]
    Interrupted,

    /// 数据完整性错误（例如节点类型未定义）
    #[error("数据完整性错误: {0}")]
    Integrity(String),

    /// 路径过滤规则无法解析
    #[error("无效的路径规则 {0}: {1}")]
    InvalidPattern(String, String),

    /// 索引存储的串行器已关闭
    #[error("索引存储已关闭")]
    StoreClosed,

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Io(std::io::Error),
}

impl Error {
    /// 仅临时错误可重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;

        match e.kind() {
            ErrorKind::NotFound => Error::NotFound(e.to_string()),
            ErrorKind::AlreadyExists => Error::AlreadyExists(e.to_string()),
            ErrorKind::Interrupted
            | ErrorKind::TimedOut
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Error::Transient(e.to_string()),
            _ => Error::Io(e),
        }
    }
}

impl From<opendal::Error> for Error {
    fn from(e: opendal::Error) -> Self {
        use opendal::ErrorKind;

        match e.kind() {
            ErrorKind::NotFound => Error::NotFound(e.to_string()),
            ErrorKind::AlreadyExists => Error::AlreadyExists(e.to_string()),
            ErrorKind::RateLimited => Error::Transient(e.to_string()),
            _ if e.is_temporary() => Error::Transient(e.to_string()),
            _ => Error::Fatal(e.to_string()),
        }
    }
}
