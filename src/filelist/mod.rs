//! 文件列表 - 持久化在索引存储中的节点表

mod duplicate_list;
mod file_list;

pub use duplicate_list::{DuplicateList, DuplicateRecord};
pub use file_list::{FileList, NodeCursor};

use crate::error::{Error, Result};
use crate::paths;
use crate::store::{Row, Value};
use serde::{Deserialize, Serialize};

/// 节点类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    File,
    Dir,
}

impl NodeType {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::File => "f",
            NodeType::Dir => "d",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "f" => Some(NodeType::File),
            "d" => Some(NodeType::Dir),
            _ => None,
        }
    }
}

/// 一个文件或目录记录
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// None 表示条目不存在或无法识别
    pub node_type: Option<NodeType>,
    pub path: String,
    /// 修改时间（Unix 秒）
    pub modified: i64,
    /// 加密后的大小，用于变更检测
    pub padded_size: u64,
    #[serde(default)]
    pub ivs: Vec<u8>,
}

impl Node {
    pub fn file(path: impl Into<String>, modified: i64, padded_size: u64) -> Self {
        Self {
            node_type: Some(NodeType::File),
            path: path.into(),
            modified,
            padded_size,
            ivs: Vec::new(),
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            node_type: Some(NodeType::Dir),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_ivs(mut self, ivs: Vec<u8>) -> Self {
        self.ivs = ivs;
        self
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == Some(NodeType::Dir)
    }

    pub fn is_file(&self) -> bool {
        self.node_type == Some(NodeType::File)
    }

    /// 持久化使用的路径形式：目录以 `/` 结尾
    pub(crate) fn stored_path(&self) -> String {
        if self.is_dir() {
            paths::dir_normalize(&self.path)
        } else {
            self.path.clone()
        }
    }

    pub(crate) fn to_params(&self) -> Result<Vec<Value>> {
        let node_type = self
            .node_type
            .ok_or_else(|| Error::Integrity(format!("节点类型未定义: {}", self.path)))?;

        Ok(vec![
            node_type.as_str().into(),
            self.modified.into(),
            Value::Integer(self.padded_size as i64),
            self.stored_path().into(),
            self.ivs.clone().into(),
        ])
    }

    /// 按 `type, modified, padded_size, path, IVs` 列顺序解析
    pub(crate) fn from_row(row: &Row) -> Self {
        Self {
            node_type: row.text(0).and_then(NodeType::parse),
            modified: row.integer(1).unwrap_or(0),
            padded_size: row.integer(2).unwrap_or(0).max(0) as u64,
            path: row.text(3).unwrap_or_default().to_string(),
            ivs: row.blob(4).map(<[u8]>::to_vec).unwrap_or_default(),
        }
    }
}

/// 子树匹配的 GLOB 模式（包括目录本身）
pub(crate) fn subtree_glob(path: &str) -> String {
    format!("{}*", paths::escape_glob(&paths::dir_normalize(path)))
}
