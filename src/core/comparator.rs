//! 文件比较器
//!
//! 对两个按路径排序的节点流做归并遍历，惰性地产生 `new` / `rm` 操作。
//! 路径在比较前去掉各自的前缀，并统一为不带结尾 `/` 的形式。

use crate::error::Result;
use crate::filelist::{Node, NodeCursor, NodeType};
use crate::paths;
use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::VecDeque;

/// 按路径升序产生节点的数据源
#[async_trait]
pub trait NodeSource: Send {
    async fn next_node(&mut self) -> Result<Option<Node>>;
}

#[async_trait]
impl NodeSource for NodeCursor {
    async fn next_node(&mut self) -> Result<Option<Node>> {
        self.next().await
    }
}

/// 内存中的节点序列（调用方保证已排序）
pub struct NodeStream(VecDeque<Node>);

impl From<Vec<Node>> for NodeStream {
    fn from(nodes: Vec<Node>) -> Self {
        Self(nodes.into())
    }
}

impl FromIterator<Node> for NodeStream {
    fn from_iter<I: IntoIterator<Item = Node>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[async_trait]
impl NodeSource for NodeStream {
    async fn next_node(&mut self) -> Result<Option<Node>> {
        Ok(self.0.pop_front())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffAction {
    New,
    Rm,
}

/// 一条同步操作
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diff {
    pub action: DiffAction,
    pub node_type: NodeType,
    /// 去掉前缀后的相对路径
    pub path: String,
    /// `new` 时为新节点，`rm` 时为基准节点；路径同为相对路径
    pub node: Node,
    /// 基准中已有的 IV（更新和删除时非空）
    pub ivs: Vec<u8>,
}

/// 去掉前缀后的节点
struct Entry {
    path: String,
    node_type: NodeType,
    node: Node,
}

pub struct FileComparator<N, B> {
    new: N,
    baseline: B,
    new_prefix: String,
    baseline_prefix: String,
    cur_new: Option<Entry>,
    cur_base: Option<Entry>,
    new_done: bool,
    base_done: bool,
    last_rm: Option<String>,
    pending: VecDeque<Diff>,
}

impl<N, B> FileComparator<N, B>
where
    N: NodeSource,
    B: NodeSource,
{
    pub fn new(new: N, baseline: B, new_prefix: &str, baseline_prefix: &str) -> Self {
        Self {
            new,
            baseline,
            new_prefix: paths::normalize(new_prefix),
            baseline_prefix: paths::normalize(baseline_prefix),
            cur_new: None,
            cur_base: None,
            new_done: false,
            base_done: false,
            last_rm: None,
            pending: VecDeque::new(),
        }
    }

    /// 读取下一个位于前缀下、类型已知的节点
    async fn pull<S: NodeSource>(source: &mut S, prefix: &str) -> Result<Option<Entry>> {
        while let Some(mut node) = source.next_node().await? {
            let Some(node_type) = node.node_type else {
                continue;
            };
            let Some(path) = paths::cut_prefix(&paths::dir_denormalize(&node.path), prefix)
            else {
                continue;
            };

            node.path = path.clone();
            return Ok(Some(Entry {
                path,
                node_type,
                node,
            }));
        }
        Ok(None)
    }

    async fn fill(&mut self) -> Result<()> {
        if self.cur_new.is_none() && !self.new_done {
            self.cur_new = Self::pull(&mut self.new, &self.new_prefix).await?;
            self.new_done = self.cur_new.is_none();
        }
        if self.cur_base.is_none() && !self.base_done {
            self.cur_base = Self::pull(&mut self.baseline, &self.baseline_prefix).await?;
            self.base_done = self.cur_base.is_none();
        }
        Ok(())
    }

    /// 删除候选：已删除目录下的条目被省略
    fn push_rm(&mut self, entry: Entry) {
        if let Some(last) = &self.last_rm {
            if paths::contains(last, &entry.path) {
                return;
            }
        }

        if entry.node_type == NodeType::Dir {
            self.last_rm = Some(entry.path.clone());
        }

        self.pending.push_back(Diff {
            action: DiffAction::Rm,
            node_type: entry.node_type,
            path: entry.path,
            ivs: entry.node.ivs.clone(),
            node: entry.node,
        });
    }

    fn push_new(&mut self, entry: Entry, ivs: Vec<u8>) {
        self.pending.push_back(Diff {
            action: DiffAction::New,
            node_type: entry.node_type,
            path: entry.path,
            node: entry.node,
            ivs,
        });
    }

    /// 产生下一条操作；两个流都结束后返回 None
    pub async fn next(&mut self) -> Result<Option<Diff>> {
        loop {
            if let Some(diff) = self.pending.pop_front() {
                return Ok(Some(diff));
            }

            self.fill().await?;

            match (self.cur_new.take(), self.cur_base.take()) {
                (None, None) => return Ok(None),
                (Some(new), None) => self.push_new(new, Vec::new()),
                (None, Some(base)) => self.push_rm(base),
                (Some(new), Some(base)) => match paths::compare(&new.path, &base.path) {
                    Ordering::Less => {
                        self.cur_base = Some(base);
                        self.push_new(new, Vec::new());
                    }
                    Ordering::Greater => {
                        self.cur_new = Some(new);
                        self.push_rm(base);
                    }
                    Ordering::Equal if new.node_type != base.node_type => {
                        self.push_rm(base);
                        self.push_new(new, Vec::new());
                    }
                    Ordering::Equal => {
                        let changed = new.node_type == NodeType::File
                            && (new.node.modified > base.node.modified
                                || new.node.padded_size != base.node.padded_size);
                        if changed {
                            let ivs = base.node.ivs;
                            self.push_new(new, ivs);
                        }
                    }
                },
            }
        }
    }

    /// 读取全部剩余操作
    pub async fn collect(mut self) -> Result<Vec<Diff>> {
        let mut diffs = Vec::new();
        while let Some(diff) = self.next().await? {
            diffs.push(diff);
        }
        Ok(diffs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn file(path: &str, modified: i64, size: u64) -> Node {
        Node::file(path, modified, size)
    }

    fn dir(path: &str) -> Node {
        Node::dir(path)
    }

    async fn diff(new: Vec<Node>, baseline: Vec<Node>) -> Vec<(DiffAction, NodeType, String)> {
        FileComparator::new(NodeStream::from(new), NodeStream::from(baseline), "/", "/")
            .collect()
            .await
            .unwrap()
            .into_iter()
            .map(|d| (d.action, d.node_type, d.path))
            .collect()
    }

    #[tokio::test]
    async fn test_update_by_mtime() {
        let ops = diff(vec![file("/a", 2, 10)], vec![file("/a", 1, 10)]).await;
        assert_eq!(ops, vec![(DiffAction::New, NodeType::File, "/a".to_string())]);
    }

    #[tokio::test]
    async fn test_update_by_size_and_older_mtime_ignored() {
        let ops = diff(vec![file("/a", 1, 11)], vec![file("/a", 1, 10)]).await;
        assert_eq!(ops.len(), 1);

        let ops = diff(vec![file("/a", 1, 10)], vec![file("/a", 5, 10)]).await;
        assert!(ops.is_empty());
    }

    #[tokio::test]
    async fn test_directory_removal_suppresses_children() {
        let ops = diff(vec![], vec![dir("/dir/"), file("/dir/x", 1, 1)]).await;
        assert_eq!(ops, vec![(DiffAction::Rm, NodeType::Dir, "/dir".to_string())]);
    }

    #[tokio::test]
    async fn test_file_to_directory_transition() {
        let ops = diff(
            vec![dir("/p/"), file("/p/inner", 1, 1)],
            vec![file("/p", 1, 1)],
        )
        .await;
        assert_eq!(
            ops,
            vec![
                (DiffAction::Rm, NodeType::File, "/p".to_string()),
                (DiffAction::New, NodeType::Dir, "/p".to_string()),
                (DiffAction::New, NodeType::File, "/p/inner".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_directory_to_file_transition() {
        let ops = diff(
            vec![file("/p", 1, 1)],
            vec![dir("/p/"), file("/p/old", 1, 1)],
        )
        .await;
        assert_eq!(
            ops,
            vec![
                (DiffAction::Rm, NodeType::Dir, "/p".to_string()),
                (DiffAction::New, NodeType::File, "/p".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_identical_streams_are_idempotent() {
        let nodes = vec![
            dir("/"),
            file("/a", 1, 1),
            dir("/d/"),
            file("/d/x", 3, 4),
            file("/d-y", 1, 2),
        ];
        assert!(diff(nodes.clone(), nodes).await.is_empty());
    }

    #[tokio::test]
    async fn test_prefixes_are_cut() {
        let new = vec![dir("/local/"), file("/local/a", 2, 1), file("/local/b", 1, 1)];
        let baseline = vec![
            dir("/remote/").with_ivs(vec![9]),
            file("/remote/a", 1, 1).with_ivs(vec![7]),
            file("/remote/c", 1, 1),
        ];

        let diffs = FileComparator::new(
            NodeStream::from(new),
            NodeStream::from(baseline),
            "/local",
            "/remote",
        )
        .collect()
        .await
        .unwrap();

        let ops: Vec<(DiffAction, &str, &[u8])> = diffs
            .iter()
            .map(|d| (d.action, d.path.as_str(), d.ivs.as_slice()))
            .collect();
        assert_eq!(
            ops,
            vec![
                (DiffAction::New, "/a", &[7u8][..]),
                (DiffAction::New, "/b", &[][..]),
                (DiffAction::Rm, "/c", &[][..]),
            ]
        );
        assert_eq!(diffs[0].node.path, "/a");
        assert_eq!(diffs[0].node.modified, 2);
    }

    #[tokio::test]
    async fn test_unrelated_siblings_not_suppressed() {
        let ops = diff(
            vec![],
            vec![dir("/d/"), file("/d/x", 1, 1), file("/d-x", 1, 1)],
        )
        .await;
        assert_eq!(
            ops,
            vec![
                (DiffAction::Rm, NodeType::Dir, "/d".to_string()),
                (DiffAction::Rm, NodeType::File, "/d-x".to_string()),
            ]
        );
    }
}
