//! 逻辑连接句柄

use super::serializer::{ConnId, Op, Reply, Serializer};
use super::{Row, Value};
use crate::error::{Error, Result};
use std::sync::Arc;

/// 事务模式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TransactionMode {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionMode {
    fn statement(self) -> &'static str {
        match self {
            TransactionMode::Deferred => "BEGIN DEFERRED TRANSACTION",
            TransactionMode::Immediate => "BEGIN IMMEDIATE TRANSACTION",
            TransactionMode::Exclusive => "BEGIN EXCLUSIVE TRANSACTION",
        }
    }
}

struct Handle {
    id: ConnId,
    serializer: Arc<Serializer>,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.serializer.deregister(self.id);
    }
}

/// 一个逻辑连接
///
/// 克隆得到的句柄共享同一个连接 ID（同一个事务）。最后一个句柄释放时注销连接，
/// 未提交的事务会被回滚。
#[derive(Clone)]
pub struct Connection {
    handle: Arc<Handle>,
}

impl Connection {
    pub(crate) async fn register(serializer: Arc<Serializer>) -> Result<Self> {
        let id = serializer.register().await?;
        Ok(Self {
            handle: Arc::new(Handle { id, serializer }),
        })
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    async fn submit(&self, op: Op) -> Result<Reply> {
        let rx = self.handle.serializer.enqueue(self.handle.id, op).await?;
        rx.await.map_err(|_| Error::StoreClosed)?
    }

    /// 执行语句，返回受影响的行数
    ///
    /// BEGIN / COMMIT / ROLLBACK 语句按事务操作处理。
    pub async fn execute(&self, sql: &str, params: Vec<Value>) -> Result<u64> {
        let op = match leading_keyword(sql).as_str() {
            "BEGIN" => Op::Begin(sql.to_string()),
            "COMMIT" | "END" => Op::Commit,
            "ROLLBACK" if !sql.to_uppercase().contains(" TO ") => Op::Rollback,
            _ => Op::Execute {
                sql: sql.to_string(),
                params,
            },
        };

        match self.submit(op).await? {
            Reply::Done(n) => Ok(n),
            Reply::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// 执行查询并返回全部结果行
    pub async fn fetch(&self, sql: &str, params: Vec<Value>) -> Result<Vec<Row>> {
        let op = Op::Fetch {
            sql: sql.to_string(),
            params,
        };

        match self.submit(op).await? {
            Reply::Rows(rows) => Ok(rows),
            Reply::Done(_) => Ok(Vec::new()),
        }
    }

    pub async fn fetch_one(&self, sql: &str, params: Vec<Value>) -> Result<Option<Row>> {
        Ok(self.fetch(sql, params).await?.into_iter().next())
    }

    pub async fn begin(&self, mode: TransactionMode) -> Result<()> {
        self.submit(Op::Begin(mode.statement().to_string())).await?;
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        self.submit(Op::Commit).await?;
        Ok(())
    }

    pub async fn rollback(&self) -> Result<()> {
        self.submit(Op::Rollback).await?;
        Ok(())
    }

    /// 当前连接是否持有未结束的事务
    pub fn in_transaction(&self) -> bool {
        self.handle.serializer.in_transaction(self.handle.id)
    }

    /// 占用串行器，直到返回的 [`Group`] 被释放
    ///
    /// 期间其他连接的请求被推迟，本连接的多个操作连续执行。
    pub async fn group(&self) -> Result<Group> {
        self.submit(Op::Acquire).await?;
        Ok(Group { conn: self.clone() })
    }
}

/// 串行器占用守卫
pub struct Group {
    conn: Connection,
}

impl std::ops::Deref for Group {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for Group {
    fn drop(&mut self) {
        self.conn
            .handle
            .serializer
            .enqueue_now(self.conn.handle.id, Op::Release);
    }
}

fn leading_keyword(sql: &str) -> String {
    sql.trim_start()
        .split(|c: char| !c.is_ascii_alphabetic())
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreManager;
    use std::time::Duration;

    #[test]
    fn test_leading_keyword() {
        assert_eq!(leading_keyword("  begin immediate"), "BEGIN");
        assert_eq!(leading_keyword("SELECT 1"), "SELECT");
        assert_eq!(leading_keyword(""), "");
    }

    async fn open_table(manager: &StoreManager, path: &std::path::Path) -> Connection {
        let conn = manager.open(path).await.unwrap();
        conn.execute("CREATE TABLE IF NOT EXISTS t (v INTEGER)", vec![])
            .await
            .unwrap();
        conn
    }

    #[tokio::test]
    async fn test_execute_and_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let manager = StoreManager::new(10);
        let conn = open_table(&manager, &dir.path().join("a.db")).await;

        conn.execute("INSERT INTO t VALUES (?)", vec![Value::Integer(3)])
            .await
            .unwrap();
        let row = conn.fetch_one("SELECT v FROM t", vec![]).await.unwrap();
        assert_eq!(row.and_then(|r| r.integer(0)), Some(3));
    }

    #[tokio::test]
    async fn test_transaction_defers_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tx.db");
        let manager = StoreManager::new(10);
        let a = open_table(&manager, &path).await;
        let b = manager.open(&path).await.unwrap();

        a.begin(TransactionMode::Deferred).await.unwrap();
        a.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();

        let reader = {
            let b = b.clone();
            tokio::spawn(async move { b.fetch("SELECT v FROM t", vec![]).await.unwrap() })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!reader.is_finished());

        a.execute("INSERT INTO t VALUES (2)", vec![]).await.unwrap();
        a.commit().await.unwrap();

        // B 只能看到提交后的完整结果
        let rows = reader.await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(!a.in_transaction());
    }

    #[tokio::test]
    async fn test_drop_rolls_back_open_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("drop.db");
        let manager = StoreManager::new(10);
        let keeper = open_table(&manager, &path).await;

        {
            let a = manager.open(&path).await.unwrap();
            a.execute("BEGIN", vec![]).await.unwrap();
            assert!(a.in_transaction());
            a.execute("INSERT INTO t VALUES (9)", vec![]).await.unwrap();
        }

        let rows = keeper.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_serializer_restarts_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("restart.db");
        let manager = StoreManager::new(10);

        {
            let conn = open_table(&manager, &path).await;
            conn.execute("INSERT INTO t VALUES (5)", vec![]).await.unwrap();
        }

        for _ in 0..50 {
            if !manager.is_running(&path) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!manager.is_running(&path));

        let conn = manager.open(&path).await.unwrap();
        assert!(manager.is_running(&path));
        let rows = conn.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_requests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("closed.db");
        let manager = StoreManager::new(10);
        let conn = open_table(&manager, &path).await;

        manager.close(&path);
        let err = conn.fetch("SELECT v FROM t", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::StoreClosed));
    }

    #[tokio::test]
    async fn test_group_keeps_operations_together() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("group.db");
        let manager = StoreManager::new(10);
        let a = open_table(&manager, &path).await;
        let b = manager.open(&path).await.unwrap();

        let group = a.group().await.unwrap();
        let writer = {
            let b = b.clone();
            tokio::spawn(async move { b.execute("DELETE FROM t", vec![]).await.unwrap() })
        };

        group.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let rows = group.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert_eq!(rows.len(), 1);
        drop(group);

        writer.await.unwrap();
        let rows = a.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_drained() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("limit.db");
        let manager = StoreManager::new(2);
        let a = open_table(&manager, &path).await;
        let b = manager.open(&path).await.unwrap();

        // A 占用串行器，B 的请求只能排队
        let group = a.group().await.unwrap();
        let writers: Vec<_> = (0..3)
            .map(|n| {
                let b = b.clone();
                tokio::spawn(async move {
                    b.execute("INSERT INTO t VALUES (?)", vec![Value::Integer(n)])
                        .await
                        .unwrap()
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        // 只有两个请求进入队列，第三个停在入队处
        assert_eq!(a.handle.serializer.queued(), 2);
        assert!(writers.iter().all(|w| !w.is_finished()));

        // 持有者不受队列上限限制
        let rows = group.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert!(rows.is_empty());
        drop(group);

        for writer in writers {
            tokio::time::timeout(Duration::from_secs(5), writer)
                .await
                .unwrap()
                .unwrap();
        }
        let rows = a.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[tokio::test]
    async fn test_failed_statement_only_affects_caller() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail.db");
        let manager = StoreManager::new(10);
        let a = open_table(&manager, &path).await;
        let b = manager.open(&path).await.unwrap();

        let (bad, good) = tokio::join!(
            a.execute("INSERT INTO missing VALUES (1)", vec![]),
            b.execute("INSERT INTO t VALUES (7)", vec![])
        );
        assert!(matches!(bad, Err(Error::Database(_))));
        assert_eq!(good.unwrap(), 1);

        // 出错后串行器继续为两个连接服务
        a.execute("INSERT INTO t VALUES (8)", vec![]).await.unwrap();
        let rows = b.fetch("SELECT v FROM t ORDER BY v", vec![]).await.unwrap();
        let values: Vec<i64> = rows.iter().filter_map(|r| r.integer(0)).collect();
        assert_eq!(values, vec![7, 8]);
    }

    #[tokio::test]
    async fn test_uncommitted_writes_hidden_from_other_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("many.db");
        let manager = StoreManager::new(10);
        let writer = open_table(&manager, &path).await;
        let others: Vec<Connection> = open_many(&manager, &path, 3).await;

        writer.begin(TransactionMode::Immediate).await.unwrap();
        writer.execute("INSERT INTO t VALUES (1)", vec![]).await.unwrap();

        let readers: Vec<_> = others
            .iter()
            .cloned()
            .map(|conn| {
                tokio::spawn(async move { conn.fetch("SELECT v FROM t", vec![]).await.unwrap() })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(readers.iter().all(|r| !r.is_finished()));

        // 事务内自己的写入可见
        let own = writer.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert_eq!(own.len(), 1);
        writer.execute("INSERT INTO t VALUES (2)", vec![]).await.unwrap();
        writer.commit().await.unwrap();

        for reader in readers {
            assert_eq!(reader.await.unwrap().len(), 2);
        }

        // 提交后其他连接可以各自写入
        for (n, conn) in others.iter().enumerate() {
            conn.execute("INSERT INTO t VALUES (?)", vec![Value::Integer(10 + n as i64)])
                .await
                .unwrap();
        }
        let rows = writer.fetch("SELECT v FROM t", vec![]).await.unwrap();
        assert_eq!(rows.len(), 5);
    }

    async fn open_many(
        manager: &StoreManager,
        path: &std::path::Path,
        n: usize,
    ) -> Vec<Connection> {
        let mut conns = Vec::with_capacity(n);
        for _ in 0..n {
            conns.push(manager.open(path).await.unwrap());
        }
        conns
    }
}
