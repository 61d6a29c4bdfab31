use super::{subtree_glob, NodeType};
use crate::error::Result;
use crate::paths;
use crate::store::{Connection, Row, StoreManager, Value};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// 解密后名称冲突的同级条目
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateRecord {
    pub node_type: NodeType,
    pub ivs: Vec<u8>,
    pub path: String,
}

impl DuplicateRecord {
    fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            node_type: row.text(0).and_then(NodeType::parse)?,
            ivs: row.blob(1).map(<[u8]>::to_vec).unwrap_or_default(),
            path: row.text(2)?.to_string(),
        })
    }
}

/// 重复条目列表
#[derive(Clone)]
pub struct DuplicateList {
    conn: Connection,
}

impl DuplicateList {
    pub async fn open(stores: &StoreManager, path: &Path) -> Result<Self> {
        Ok(Self::new(stores.open(path).await?))
    }

    pub fn new(conn: Connection) -> Self {
        Self { conn }
    }

    pub async fn create(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS duplicates (type TEXT, IVs BLOB, path TEXT)",
                vec![],
            )
            .await?;
        self.conn
            .execute(
                "CREATE INDEX IF NOT EXISTS duplicates_path_index ON duplicates(path ASC)",
                vec![],
            )
            .await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM duplicates", vec![]).await?;
        Ok(())
    }

    pub async fn insert(&self, node_type: NodeType, ivs: &[u8], path: &str) -> Result<()> {
        let path = match node_type {
            NodeType::Dir => paths::dir_normalize(path),
            NodeType::File => path.to_string(),
        };

        self.conn
            .execute(
                "INSERT INTO duplicates VALUES (?, ?, ?)",
                vec![node_type.as_str().into(), ivs.into(), path.into()],
            )
            .await?;
        Ok(())
    }

    /// 删除某个路径的记录；给定 IVs 时只删除匹配的那一条
    pub async fn remove(&self, path: &str, ivs: Option<&[u8]>) -> Result<()> {
        let mut params: Vec<Value> = vec![
            paths::dir_denormalize(path).into(),
            paths::dir_normalize(path).into(),
        ];

        let sql = match ivs {
            Some(ivs) => {
                params.push(ivs.into());
                "DELETE FROM duplicates WHERE (path = ? OR path = ?) AND IVs = ?"
            }
            None => "DELETE FROM duplicates WHERE path = ? OR path = ?",
        };

        self.conn.execute(sql, params).await?;
        Ok(())
    }

    pub async fn remove_children(&self, path: &str) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM duplicates WHERE path GLOB ?",
                vec![subtree_glob(path).into()],
            )
            .await?;
        Ok(())
    }

    pub async fn find(&self, path: &str) -> Result<Vec<DuplicateRecord>> {
        self.select(
            "SELECT type, IVs, path FROM duplicates WHERE path = ? OR path = ?",
            vec![
                paths::dir_denormalize(path).into(),
                paths::dir_normalize(path).into(),
            ],
        )
        .await
    }

    pub async fn find_children(&self, path: &str) -> Result<Vec<DuplicateRecord>> {
        self.select(
            "SELECT type, IVs, path FROM duplicates WHERE path GLOB ? ORDER BY path ASC",
            vec![subtree_glob(path).into()],
        )
        .await
    }

    pub async fn select_all(&self) -> Result<Vec<DuplicateRecord>> {
        self.select(
            "SELECT type, IVs, path FROM duplicates ORDER BY path ASC",
            vec![],
        )
        .await
    }

    pub async fn get_count(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM duplicates", vec![]).await
    }

    pub async fn get_children_count(&self, path: &str) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM duplicates WHERE path GLOB ?",
            vec![subtree_glob(path).into()],
        )
        .await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.get_count().await? == 0)
    }

    async fn select(&self, sql: &str, params: Vec<Value>) -> Result<Vec<DuplicateRecord>> {
        let rows = self.conn.fetch(sql, params).await?;
        Ok(rows.iter().filter_map(DuplicateRecord::from_row).collect())
    }

    async fn count(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let row = self.conn.fetch_one(sql, params).await?;
        Ok(row.and_then(|r| r.integer(0)).unwrap_or(0).max(0) as u64)
    }
}
