use super::{subtree_glob, Node};
use crate::error::Result;
use crate::paths;
use crate::store::{Connection, StoreManager, TransactionMode, Value};
use std::collections::VecDeque;
use std::path::Path;

const COLUMNS: &str = "type, modified, padded_size, path, IVs";

/// 持久化的节点列表
#[derive(Clone)]
pub struct FileList {
    conn: Connection,
    fetch_size: usize,
}

impl FileList {
    pub async fn open(stores: &StoreManager, path: &Path, fetch_size: usize) -> Result<Self> {
        Ok(Self::new(stores.open(path).await?, fetch_size))
    }

    /// 在已有的逻辑连接上使用（与 DuplicateList 共享事务）
    pub fn new(conn: Connection, fetch_size: usize) -> Self {
        Self {
            conn,
            fetch_size: fetch_size.max(1),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub async fn create(&self) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "CREATE TABLE IF NOT EXISTS filelist (
                        type TEXT,
                        modified INTEGER,
                        padded_size INTEGER,
                        path TEXT COLLATE {} UNIQUE ON CONFLICT REPLACE,
                        IVs BLOB
                    )",
                    paths::PATH_COLLATION
                ),
                vec![],
            )
            .await?;
        self.conn
            .execute(
                "CREATE INDEX IF NOT EXISTS filelist_path_index ON filelist(path ASC)",
                vec![],
            )
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM filelist", vec![]).await?;
        Ok(())
    }

    /// 插入节点，相同路径的旧记录被替换
    pub async fn insert_node(&self, node: &Node) -> Result<()> {
        self.conn
            .execute(
                &format!("INSERT INTO filelist ({}) VALUES (?, ?, ?, ?, ?)", COLUMNS),
                node.to_params()?,
            )
            .await?;
        Ok(())
    }

    /// 删除节点（同时匹配文件路径和目录路径形式）
    pub async fn remove_node(&self, path: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM filelist WHERE path = ? OR path = ?",
                vec![
                    paths::dir_denormalize(path).into(),
                    paths::dir_normalize(path).into(),
                ],
            )
            .await?;
        Ok(())
    }

    /// 删除目录下的全部节点（包括目录本身）
    pub async fn remove_node_children(&self, path: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM filelist WHERE path GLOB ?",
                vec![subtree_glob(path).into()],
            )
            .await?;
        Ok(())
    }

    pub async fn find_node(&self, path: &str) -> Result<Option<Node>> {
        let row = self
            .conn
            .fetch_one(
                &format!(
                    "SELECT {} FROM filelist WHERE path = ? OR path = ? LIMIT 1",
                    COLUMNS
                ),
                vec![
                    paths::dir_denormalize(path).into(),
                    paths::dir_normalize(path).into(),
                ],
            )
            .await?;

        Ok(row.as_ref().map(Node::from_row))
    }

    /// 按路径顺序遍历子树（包括目录本身）
    pub fn find_node_children(&self, path: &str) -> NodeCursor {
        NodeCursor::new(self.conn.clone(), Some(subtree_glob(path)), self.fetch_size)
    }

    /// 按路径顺序遍历全部节点
    pub fn select_all_nodes(&self) -> NodeCursor {
        NodeCursor::new(self.conn.clone(), None, self.fetch_size)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        let row = self
            .conn
            .fetch_one("SELECT 1 FROM filelist LIMIT 1", vec![])
            .await?;
        Ok(row.is_none())
    }

    /// 子树中的节点数量
    pub async fn get_children_count(&self, path: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM filelist WHERE path GLOB ?",
            vec![subtree_glob(path).into()],
        )
        .await
    }

    /// 子树中的文件数量；path 为 None 时统计全部
    pub async fn get_file_count(&self, path: Option<&str>) -> Result<u64> {
        match path {
            Some(path) => {
                self.count(
                    "SELECT COUNT(*) FROM filelist WHERE type = 'f' AND path GLOB ?",
                    vec![subtree_glob(path).into()],
                )
                .await
            }
            None => {
                self.count("SELECT COUNT(*) FROM filelist WHERE type = 'f'", vec![])
                    .await
            }
        }
    }

    async fn count(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let row = self.conn.fetch_one(sql, params).await?;
        Ok(row.and_then(|r| r.integer(0)).unwrap_or(0).max(0) as u64)
    }

    pub async fn begin_transaction(&self) -> Result<()> {
        self.conn.begin(TransactionMode::Deferred).await
    }

    pub async fn commit(&self) -> Result<()> {
        self.conn.commit().await
    }

    pub async fn rollback(&self) -> Result<()> {
        self.conn.rollback().await
    }
}

/// 分批读取节点的游标
///
/// 每批最多 `fetch_size` 行，下一批从上一批最后一个路径之后继续。
pub struct NodeCursor {
    conn: Connection,
    glob: Option<String>,
    last_path: Option<String>,
    batch: VecDeque<Node>,
    fetch_size: usize,
    exhausted: bool,
}

impl NodeCursor {
    fn new(conn: Connection, glob: Option<String>, fetch_size: usize) -> Self {
        Self {
            conn,
            glob,
            last_path: None,
            batch: VecDeque::new(),
            fetch_size,
            exhausted: false,
        }
    }

    pub async fn next(&mut self) -> Result<Option<Node>> {
        if self.batch.is_empty() && !self.exhausted {
            self.fill().await?;
        }
        Ok(self.batch.pop_front())
    }

    /// 读取剩余的全部节点
    pub async fn collect(mut self) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        while let Some(node) = self.next().await? {
            nodes.push(node);
        }
        Ok(nodes)
    }

    async fn fill(&mut self) -> Result<()> {
        let mut conditions = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(glob) = &self.glob {
            conditions.push("path GLOB ?");
            params.push(glob.as_str().into());
        }
        if let Some(last) = &self.last_path {
            conditions.push("path > ?");
            params.push(last.as_str().into());
        }

        let filter = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };
        params.push(Value::Integer(self.fetch_size as i64));

        let rows = self
            .conn
            .fetch(
                &format!(
                    "SELECT {} FROM filelist{} ORDER BY path ASC LIMIT ?",
                    COLUMNS, filter
                ),
                params,
            )
            .await?;

        if rows.len() < self.fetch_size {
            self.exhausted = true;
        }

        self.batch.extend(rows.iter().map(Node::from_row));
        if let Some(last) = self.batch.back() {
            self.last_path = Some(last.path.clone());
        }
        Ok(())
    }
}
