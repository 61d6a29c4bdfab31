//! 单个数据库文件的串行器任务

use super::{Row, Value};
use crate::error::{Error, Result};
use crate::paths;
use sqlx::query::Query;
use sqlx::sqlite::{
    Sqlite, SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqliteRow,
};
use sqlx::{ConnectOptions, Connection as _, Row as _, TypeInfo, ValueRef};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

pub(crate) type ConnId = u64;

pub(crate) enum Op {
    /// 开始事务，携带完整的 BEGIN 语句
    Begin(String),
    Commit,
    Rollback,
    Execute { sql: String, params: Vec<Value> },
    Fetch { sql: String, params: Vec<Value> },
    /// 占用串行器，直到对应的 Release
    Acquire,
    Release,
}

pub(crate) enum Reply {
    Done(u64),
    Rows(Vec<Row>),
}

struct Request {
    conn: ConnId,
    op: Op,
    reply: oneshot::Sender<Result<Reply>>,
    _permit: Option<OwnedSemaphorePermit>,
}

#[derive(Default)]
struct State {
    primary: VecDeque<Request>,
    /// 事务被其他连接占用时推迟的请求
    deferred: VecDeque<Request>,
    owner: Option<ConnId>,
    in_transaction: bool,
    group_depth: usize,
    connections: usize,
    running: bool,
    stopped: bool,
}

impl State {
    fn release_owner_if_idle(&mut self) {
        if !self.in_transaction && self.group_depth == 0 {
            self.owner = None;
        }
    }
}

pub(crate) struct Serializer {
    path: PathBuf,
    state: Mutex<State>,
    wakeup: Notify,
    /// 队列深度上限
    gate: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl Serializer {
    pub(crate) fn new(path: PathBuf, queue_limit: usize) -> Self {
        Self {
            path,
            state: Mutex::new(State::default()),
            wakeup: Notify::new(),
            gate: Arc::new(Semaphore::new(queue_limit.max(1))),
            next_id: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn is_running(&self) -> bool {
        self.lock().running
    }

    pub(crate) fn stop(&self) {
        self.lock().stopped = true;
        self.wakeup.notify_one();
    }

    /// 注册一个逻辑连接；串行器未运行时先建立数据库连接并启动任务
    pub(crate) async fn register(self: &Arc<Self>) -> Result<ConnId> {
        let need_start = {
            let mut state = self.lock();
            state.connections += 1;
            state.stopped = false;
            !std::mem::replace(&mut state.running, true)
        };

        if need_start {
            match connect(&self.path).await {
                Ok(conn) => {
                    tokio::spawn(self.clone().run(conn));
                }
                Err(e) => {
                    warn!("打开索引文件失败 {:?}: {}", self.path, e);
                    let mut state = self.lock();
                    state.connections -= 1;
                    state.running = false;
                    state.owner = None;
                    state.in_transaction = false;
                    state.group_depth = 0;
                    // 丢弃等待中的请求，等待者收到 StoreClosed
                    state.primary.clear();
                    state.deferred.clear();
                    return Err(e);
                }
            }
        }

        Ok(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// 注销逻辑连接；若它仍持有事务或占用，则排入回滚和释放
    pub(crate) fn deregister(&self, conn: ConnId) {
        {
            let mut state = self.lock();
            state.connections = state.connections.saturating_sub(1);

            if state.owner == Some(conn) {
                state.group_depth = 0;
                if state.in_transaction {
                    let (reply, _) = oneshot::channel();
                    state.primary.push_front(Request {
                        conn,
                        op: Op::Rollback,
                        reply,
                        _permit: None,
                    });
                } else {
                    state.owner = None;
                }
            }
        }
        self.wakeup.notify_one();
    }

    /// 已入队（含推迟）但尚未执行的请求数
    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        let state = self.lock();
        state.primary.len() + state.deferred.len()
    }

    pub(crate) fn is_owner(&self, conn: ConnId) -> bool {
        self.lock().owner == Some(conn)
    }

    pub(crate) fn in_transaction(&self, conn: ConnId) -> bool {
        let state = self.lock();
        state.owner == Some(conn) && state.in_transaction
    }

    /// 把请求放入队列，返回接收结果的通道
    ///
    /// 队列已满时等待，但当前事务持有者不受限制。
    pub(crate) async fn enqueue(
        &self,
        conn: ConnId,
        op: Op,
    ) -> Result<oneshot::Receiver<Result<Reply>>> {
        let permit = if self.is_owner(conn) {
            None
        } else {
            Some(
                self.gate
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::StoreClosed)?,
            )
        };

        self.push(conn, op, permit)
    }

    /// 不等待队列空位直接排入（用于 Drop 中的释放）
    pub(crate) fn enqueue_now(&self, conn: ConnId, op: Op) {
        let _ = self.push(conn, op, None);
    }

    fn push(
        &self,
        conn: ConnId,
        op: Op,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Result<oneshot::Receiver<Result<Reply>>> {
        let (reply, rx) = oneshot::channel();
        {
            let mut state = self.lock();
            if !state.running || state.stopped {
                return Err(Error::StoreClosed);
            }
            state.primary.push_back(Request {
                conn,
                op,
                reply,
                _permit: permit,
            });
        }
        self.wakeup.notify_one();
        Ok(rx)
    }

    /// 取出下一个可执行的请求；None 表示串行器应退出
    fn next_request(&self) -> Option<Option<Request>> {
        let mut state = self.lock();

        loop {
            if state.stopped
                || (state.connections == 0 && state.primary.is_empty() && state.deferred.is_empty())
            {
                state.running = false;
                state.owner = None;
                state.in_transaction = false;
                state.group_depth = 0;
                state.primary.clear();
                state.deferred.clear();
                return None;
            }

            if state.owner.is_none() && !state.deferred.is_empty() {
                // 推迟的请求按原顺序放回队首
                let mut deferred = std::mem::take(&mut state.deferred);
                deferred.append(&mut state.primary);
                state.primary = deferred;
            }

            let Some(request) = state.primary.pop_front() else {
                return Some(None);
            };

            match state.owner {
                Some(owner) if owner != request.conn => state.deferred.push_back(request),
                _ => return Some(Some(request)),
            }
        }
    }

    async fn run(self: Arc<Self>, mut conn: SqliteConnection) {
        debug!("索引串行器启动: {:?}", self.path);

        while let Some(next) = self.next_request() {
            let Some(request) = next else {
                self.wakeup.notified().await;
                continue;
            };

            let result = self.execute(&mut conn, request.conn, &request.op).await;
            let _ = request.reply.send(result);
        }

        if let Err(e) = conn.close().await {
            warn!("关闭索引连接失败 {:?}: {}", self.path, e);
        }
        debug!("索引串行器退出: {:?}", self.path);
    }

    async fn execute(&self, conn: &mut SqliteConnection, id: ConnId, op: &Op) -> Result<Reply> {
        match op {
            Op::Begin(sql) => {
                sqlx::query(sql).execute(&mut *conn).await?;
                let mut state = self.lock();
                state.owner = Some(id);
                state.in_transaction = true;
                Ok(Reply::Done(0))
            }
            Op::Commit | Op::Rollback => {
                if !self.in_transaction(id) {
                    return Ok(Reply::Done(0));
                }

                let commit = matches!(op, Op::Commit);
                let sql = if commit { "COMMIT" } else { "ROLLBACK" };
                let result = sqlx::query(sql).execute(&mut *conn).await;

                // 提交失败时事务仍然有效，由调用者回滚
                if !commit || result.is_ok() {
                    let mut state = self.lock();
                    state.in_transaction = false;
                    state.release_owner_if_idle();
                }

                result?;
                Ok(Reply::Done(0))
            }
            Op::Execute { sql, params } => {
                let result = bind_params(sqlx::query(sql), params)
                    .execute(&mut *conn)
                    .await?;
                Ok(Reply::Done(result.rows_affected()))
            }
            Op::Fetch { sql, params } => {
                let rows = bind_params(sqlx::query(sql), params)
                    .fetch_all(&mut *conn)
                    .await?;
                let rows = rows.iter().map(decode_row).collect::<Result<Vec<_>>>()?;
                Ok(Reply::Rows(rows))
            }
            Op::Acquire => {
                let mut state = self.lock();
                state.owner = Some(id);
                state.group_depth += 1;
                Ok(Reply::Done(0))
            }
            Op::Release => {
                let mut state = self.lock();
                if state.owner == Some(id) {
                    state.group_depth = state.group_depth.saturating_sub(1);
                    state.release_owner_if_idle();
                }
                Ok(Reply::Done(0))
            }
        }
    }
}

async fn connect(path: &Path) -> Result<SqliteConnection> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .collation(paths::PATH_COLLATION, |a: &str, b: &str| paths::compare(a, b));

    Ok(options.connect().await?)
}

fn bind_params<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &'q [Value],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in params {
        query = match value {
            Value::Null => query.bind(None::<i64>),
            Value::Integer(v) => query.bind(*v),
            Value::Real(v) => query.bind(*v),
            Value::Text(v) => query.bind(v.as_str()),
            Value::Blob(v) => query.bind(v.as_slice()),
        };
    }
    query
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
    let mut values = Vec::with_capacity(row.len());

    for idx in 0..row.len() {
        let raw = row.try_get_raw(idx)?;
        if raw.is_null() {
            values.push(Value::Null);
            continue;
        }

        let info = raw.type_info();
        let value = match info.name() {
            "INTEGER" | "BOOLEAN" => Value::Integer(row.try_get_unchecked(idx)?),
            "REAL" | "NUMERIC" => Value::Real(row.try_get_unchecked(idx)?),
            "BLOB" => Value::Blob(row.try_get_unchecked(idx)?),
            _ => Value::Text(row.try_get_unchecked(idx)?),
        };
        values.push(value);
    }

    Ok(Row(values))
}
