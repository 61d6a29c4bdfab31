//! 生命周期和进度事件

use super::{Status, TargetKind};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    TargetStarted {
        target: Uuid,
        kind: TargetKind,
    },
    TargetFinished {
        target: Uuid,
        status: Status,
    },
    TaskStarted {
        target: Uuid,
        path: String,
    },
    TaskProgress {
        target: Uuid,
        path: String,
        bytes: u64,
    },
    /// 扫描进入一个目录
    NextNode {
        target: Uuid,
        path: String,
    },
    /// 多个原始条目解密后得到同一路径
    DuplicatesFound {
        target: Uuid,
        path: String,
        count: usize,
    },
    ScanFinished {
        target: Uuid,
        files: u64,
        dirs: u64,
        duplicates: u64,
    },
    Error {
        target: Option<Uuid>,
        message: String,
    },
}

/// 事件发送端；没有订阅者时事件被丢弃，发送从不阻塞
#[derive(Debug, Clone, Default)]
pub struct EventSender(Option<mpsc::UnboundedSender<Event>>);

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self(Some(tx))
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.0 {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = Event::Error {
            target: None,
            message: "boom".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "error");
        assert_eq!(json["message"], "boom");
    }

    #[test]
    fn test_sender_without_receiver_is_silent() {
        EventSender::default().emit(Event::Error {
            target: None,
            message: "ignored".into(),
        });

        let (events, mut rx) = EventSender::channel();
        events.emit(Event::NextNode {
            target: Uuid::nil(),
            path: "/".into(),
        });
        assert!(matches!(rx.try_recv(), Ok(Event::NextNode { .. })));
    }
}
