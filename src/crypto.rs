//! 加密接口
//!
//! 具体算法由外部实现；同步引擎只通过 [`Cipher`] 调用路径加密和流加密。

use crate::error::Result;
use crate::storage::BoxReader;
use std::sync::Arc;

pub trait Cipher: Send + Sync {
    /// 加密逻辑路径；`ivs` 为空时生成新的 IV，否则复用
    fn encrypt_path(&self, path: &str, ivs: &[u8]) -> Result<(String, Vec<u8>)>;

    /// 解密原始路径，返回逻辑路径和 IV
    fn decrypt_path(&self, path: &str) -> Result<(String, Vec<u8>)>;

    fn encrypt_stream(&self, input: BoxReader) -> BoxReader;

    fn decrypt_stream(&self, input: BoxReader) -> BoxReader;

    /// 明文大小对应的填充后大小（不含头部开销）
    fn padded_size(&self, size: u64) -> u64;

    /// 加密文件的固定头部开销
    fn overhead(&self) -> u64;
}

pub type SharedCipher = Arc<dyn Cipher>;

/// 不加密：路径和内容原样通过
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCipher;

impl PlainCipher {
    pub fn shared() -> SharedCipher {
        Arc::new(PlainCipher)
    }
}

impl Cipher for PlainCipher {
    fn encrypt_path(&self, path: &str, _ivs: &[u8]) -> Result<(String, Vec<u8>)> {
        Ok((path.to_string(), Vec::new()))
    }

    fn decrypt_path(&self, path: &str) -> Result<(String, Vec<u8>)> {
        Ok((path.to_string(), Vec::new()))
    }

    fn encrypt_stream(&self, input: BoxReader) -> BoxReader {
        input
    }

    fn decrypt_stream(&self, input: BoxReader) -> BoxReader {
        input
    }

    fn padded_size(&self, size: u64) -> u64 {
        size
    }

    fn overhead(&self) -> u64 {
        0
    }
}
