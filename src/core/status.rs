//! 任务和目标共用的状态机
//!
//! `unset -> pending -> {finished | failed | suspended}`，`suspended -> pending` 表示恢复。

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Unset,
    Pending,
    Finished,
    Failed,
    Suspended,
}

impl Status {
    /// 只有 unset / pending 状态下可以继续工作，其他状态都视为停止请求
    pub fn is_active(self) -> bool {
        matches!(self, Status::Unset | Status::Pending)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Status::Pending,
            2 => Status::Finished,
            3 => Status::Failed,
            4 => Status::Suspended,
            _ => Status::Unset,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Status::Unset => 0,
            Status::Pending => 1,
            Status::Finished => 2,
            Status::Failed => 3,
            Status::Suspended => 4,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Unset => write!(f, "unset"),
            Status::Pending => write!(f, "pending"),
            Status::Finished => write!(f, "finished"),
            Status::Failed => write!(f, "failed"),
            Status::Suspended => write!(f, "suspended"),
        }
    }
}

/// 可跨任务共享的原子状态
#[derive(Debug)]
pub struct StatusCell(AtomicU8);

impl Default for StatusCell {
    fn default() -> Self {
        Self::new(Status::Unset)
    }
}

impl StatusCell {
    pub fn new(status: Status) -> Self {
        Self(AtomicU8::new(status.as_u8()))
    }

    pub fn get(&self) -> Status {
        Status::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn set(&self, status: Status) {
        self.0.store(status.as_u8(), Ordering::Release);
    }

    pub fn is_active(&self) -> bool {
        self.get().is_active()
    }

    /// 仅在当前状态为 `from` 时切换，返回是否成功
    pub fn transition(&self, from: Status, to: Status) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 仍在工作时切换到终止状态；已终止的状态保持不变
    pub fn settle(&self, to: Status) -> bool {
        self.transition(Status::Pending, to) || self.transition(Status::Unset, to)
    }
}
