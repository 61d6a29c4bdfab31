use super::Folder;
use crate::error::{Error, Result};
use crate::filelist::{Node, NodeType};
use crate::paths;
use crate::storage::Meta;
use tracing::{debug, warn};

/// 存储中的一个条目
///
/// `path` 是解密后的逻辑路径，`raw_path` 是存储中的实际路径；
/// 未加密的目录两者相同。
#[derive(Clone)]
pub struct Scannable {
    pub folder: Folder,
    pub path: String,
    pub raw_path: String,
    pub node_type: Option<NodeType>,
    pub modified: i64,
    pub size: u64,
    /// 前缀以下各级路径的 IV
    pub ivs: Vec<u8>,
}

/// 一次 `scan` 得到的直接子项
#[derive(Default)]
pub struct ScanResult {
    pub files: Vec<Scannable>,
    pub dirs: Vec<Scannable>,
}

impl ScanResult {
    pub fn len(&self) -> usize {
        self.files.len() + self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_entries(self) -> impl Iterator<Item = Scannable> {
        self.dirs.into_iter().chain(self.files)
    }
}

impl Scannable {
    /// 目录的根条目
    pub fn root(folder: &Folder) -> Self {
        Self::at(folder, folder.prefix.clone(), folder.prefix.clone(), Vec::new())
    }

    /// 已知逻辑路径和存储路径的条目（尚未识别类型）
    pub fn at(folder: &Folder, path: String, raw_path: String, ivs: Vec<u8>) -> Self {
        Self {
            folder: folder.clone(),
            path,
            raw_path,
            node_type: None,
            modified: 0,
            size: 0,
            ivs,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_type == Some(NodeType::Dir)
    }

    pub fn is_file(&self) -> bool {
        self.node_type == Some(NodeType::File)
    }

    fn apply_meta(&mut self, meta: &Meta) {
        self.node_type = Some(meta.node_type);
        self.modified = meta.modified;
        self.size = meta.size;
    }

    /// 查询存储确定类型；不存在时类型保持为 None
    pub async fn identify(&mut self) -> Result<()> {
        match self.folder.storage.get_meta(&self.raw_path).await {
            Ok(meta) => {
                self.apply_meta(&meta);
                Ok(())
            }
            Err(Error::NotFound(_)) => {
                self.node_type = None;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 由原始名称构造子项；加密名称无法解密时返回 None
    fn child(&self, meta: &Meta) -> Option<Scannable> {
        let raw_path = paths::join(&self.raw_path, &meta.name);

        let (name, ivs) = if self.folder.encrypted {
            match self.folder.cipher.decrypt_path(&meta.name) {
                Ok((name, name_ivs)) => {
                    let mut ivs = self.ivs.clone();
                    ivs.extend_from_slice(&name_ivs);
                    (name, ivs)
                }
                Err(e) => {
                    warn!("无法解密 {}: {}", raw_path, e);
                    return None;
                }
            }
        } else {
            (meta.name.clone(), Vec::new())
        };

        let path = paths::join(&self.path, &name);
        let mut child = Scannable::at(&self.folder, path, raw_path, ivs);
        child.apply_meta(meta);
        Some(child)
    }

    /// 是否通过所在目录的过滤规则
    pub fn is_allowed(&self) -> bool {
        self.folder.allows(&self.path, self.is_dir())
    }

    /// 列出直接子项，跳过被过滤规则排除的条目
    pub async fn scan(&self) -> Result<ScanResult> {
        let mut result = ScanResult::default();

        for meta in self.folder.storage.listdir(&self.raw_path).await? {
            let Some(child) = self.child(&meta) else {
                continue;
            };
            if !child.is_allowed() {
                debug!("跳过 {}", child.path);
                continue;
            }

            if child.is_dir() {
                result.dirs.push(child);
            } else {
                result.files.push(child);
            }
        }

        Ok(result)
    }

    async fn sorted_children(&self) -> Result<Vec<Scannable>> {
        let mut children: Vec<Scannable> = self.scan().await?.into_entries().collect();
        children.sort_by(|a, b| paths::compare(&a.path, &b.path));
        Ok(children)
    }

    /// 子树（不含自身）的先序遍历游标
    pub fn walk(&self) -> TreeWalk {
        TreeWalk {
            root: Some(self.clone()),
            pending: Vec::new(),
        }
    }

    /// 转换为索引节点
    pub fn to_node(&self) -> Node {
        let padded_size = if !self.is_file() {
            0
        } else if self.folder.encrypted {
            self.size.saturating_sub(self.folder.cipher.overhead())
        } else {
            self.folder.cipher.padded_size(self.size)
        };

        Node {
            node_type: self.node_type,
            path: self.path.clone(),
            modified: self.modified,
            padded_size,
            ivs: self.ivs.clone(),
        }
    }
}

/// 按路径顺序逐个产出条目，每次只展开一个目录
pub struct TreeWalk {
    root: Option<Scannable>,
    /// 逆序存放，栈顶是下一个条目
    pending: Vec<Scannable>,
}

impl TreeWalk {
    async fn expand(&mut self, dir: &Scannable) -> Result<()> {
        let mut children = dir.sorted_children().await?;
        children.reverse();
        self.pending.extend(children);
        Ok(())
    }

    pub async fn next(&mut self) -> Result<Option<Scannable>> {
        if let Some(root) = self.root.take() {
            self.expand(&root).await?;
        }

        let Some(entry) = self.pending.pop() else {
            return Ok(None);
        };
        if entry.is_dir() {
            self.expand(&entry).await?;
        }
        Ok(Some(entry))
    }
}
