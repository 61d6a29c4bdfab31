use super::{Event, EventSender, Status, Target};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

pub type SharedTarget = Arc<dyn Target>;

/// 按顺序逐个执行目标
///
/// 停止请求只传给当前目标，排队中的目标保持原状态。
pub struct TargetManager {
    targets: Mutex<VecDeque<SharedTarget>>,
    current: Mutex<Option<SharedTarget>>,
    stop_requested: AtomicBool,
    events: EventSender,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl TargetManager {
    pub fn new(events: EventSender) -> Self {
        Self {
            targets: Mutex::new(VecDeque::new()),
            current: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            events,
        }
    }

    pub fn add(&self, target: SharedTarget) {
        lock(&self.targets).push_back(target);
    }

    pub fn len(&self) -> usize {
        lock(&self.targets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn current(&self) -> Option<SharedTarget> {
        lock(&self.current).clone()
    }

    /// 显式停止，或当前目标已离开 unset / pending
    pub fn stopped(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            || self.current().is_some_and(|t| !t.status().is_active())
    }

    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Some(target) = self.current() {
            info!("停止当前目标: {}", target.id());
            target.stop();
        }
    }

    pub fn set_upload_limit(&self, bytes_per_sec: u64) {
        if let Some(target) = self.current() {
            target.set_upload_limit(bytes_per_sec);
        }
        for target in lock(&self.targets).iter() {
            target.set_upload_limit(bytes_per_sec);
        }
    }

    pub fn set_download_limit(&self, bytes_per_sec: u64) {
        if let Some(target) = self.current() {
            target.set_download_limit(bytes_per_sec);
        }
        for target in lock(&self.targets).iter() {
            target.set_download_limit(bytes_per_sec);
        }
    }

    /// 依次运行队列中的目标，直到队列为空或收到停止请求
    pub async fn work(&self) {
        self.stop_requested.store(false, Ordering::SeqCst);

        while !self.stopped() {
            let Some(target) = lock(&self.targets).pop_front() else {
                break;
            };

            // 单独挂起的排队目标跳过
            if target.status() == Status::Suspended {
                info!("跳过已挂起的目标: {}", target.id());
                continue;
            }

            // 与 stop 在同一把锁下交接：要么这里看到停止请求，要么 stop 看到当前目标
            let token = {
                let mut current = lock(&self.current);
                if self.stop_requested.load(Ordering::SeqCst) {
                    info!("收到停止请求，目标放回队列: {}", target.id());
                    lock(&self.targets).push_front(target);
                    break;
                }
                let token = target.state().begin_run();
                *current = Some(target.clone());
                token
            };
            let _current = scopeguard::guard(&self.current, |current| {
                *lock(current) = None;
            });

            self.events.emit(Event::TargetStarted {
                target: target.id(),
                kind: target.kind(),
            });

            match target.execute(token).await {
                Ok(()) => {
                    target.state().status().settle(Status::Finished);
                }
                Err(e) if e.is_interrupted() => {
                    warn!("目标被中断: {}", target.id());
                    target.state().status().settle(Status::Suspended);
                }
                Err(e) => {
                    error!("目标失败 {}: {}", target.id(), e);
                    target.state().status().settle(Status::Failed);
                    self.events.emit(Event::Error {
                        target: Some(target.id()),
                        message: e.to_string(),
                    });
                }
            }

            self.events.emit(Event::TargetFinished {
                target: target.id(),
                status: target.status(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{TargetKind, TargetState};
    use crate::error::{Error, Result};
    use crate::EngineConfig;
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Sleeper {
        state: TargetState,
        fail: bool,
        delay: Duration,
    }

    impl Sleeper {
        fn new(fail: bool) -> Arc<Self> {
            Self::with_delay(fail, Duration::from_millis(20))
        }

        fn with_delay(fail: bool, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                state: TargetState::new(&EngineConfig::default()),
                fail,
                delay,
            })
        }
    }

    #[async_trait]
    impl Target for Sleeper {
        fn state(&self) -> &TargetState {
            &self.state
        }

        fn kind(&self) -> TargetKind {
            TargetKind::Scan
        }

        async fn execute(&self, token: CancellationToken) -> Result<()> {
            if self.fail {
                return Err(Error::Fatal("broken".into()));
            }
            tokio::select! {
                _ = token.cancelled() => Err(Error::Interrupted),
                _ = tokio::time::sleep(self.delay) => {
                    self.state.status().set(Status::Finished);
                    Ok(())
                }
            }
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_stop_queue() {
        let (events, mut rx) = EventSender::channel();
        let manager = TargetManager::new(events);
        let failing = Sleeper::new(true);
        let ok = Sleeper::new(false);
        manager.add(failing.clone());
        manager.add(ok.clone());

        manager.work().await;

        assert_eq!(failing.status(), Status::Failed);
        assert_eq!(ok.status(), Status::Finished);
        assert!(manager.current().is_none());

        let mut errors = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, Event::Error { .. }) {
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn test_stop_only_touches_current_target() {
        let manager = Arc::new(TargetManager::new(EventSender::default()));
        let slow = Sleeper::with_delay(false, Duration::from_secs(30));
        let queued = Sleeper::new(false);
        manager.add(slow.clone());
        manager.add(queued.clone());

        let worker = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.work().await })
        };
        while manager.current().is_none() {
            tokio::task::yield_now().await;
        }
        manager.stop();
        worker.await.unwrap();

        assert!(manager.stopped());
        assert_eq!(slow.status(), Status::Suspended);
        assert_eq!(queued.status(), Status::Unset);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_limits_reach_queued_targets() {
        let manager = TargetManager::new(EventSender::default());
        let target = Sleeper::new(false);
        manager.add(target.clone());

        manager.set_upload_limit(512);
        manager.set_download_limit(1024);
        assert_eq!(target.state().upload_limit().get(), 512);
        assert_eq!(target.state().download_limit().get(), 1024);
    }

    struct FailsThenWaits {
        state: TargetState,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl Target for FailsThenWaits {
        fn state(&self) -> &TargetState {
            &self.state
        }

        fn kind(&self) -> TargetKind {
            TargetKind::Sync
        }

        async fn execute(&self, _token: CancellationToken) -> Result<()> {
            self.state.status().set(Status::Failed);
            self.release.notified().await;
            Err(Error::Fatal("late".into()))
        }
    }

    #[tokio::test]
    async fn test_settled_current_target_counts_as_stopped() {
        let manager = Arc::new(TargetManager::new(EventSender::default()));
        let failing = Arc::new(FailsThenWaits {
            state: TargetState::new(&EngineConfig::default()),
            release: tokio::sync::Notify::new(),
        });
        let next = Sleeper::new(false);
        manager.add(failing.clone());
        manager.add(next.clone());

        let worker = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.work().await })
        };
        while !manager
            .current()
            .is_some_and(|t| t.status() == Status::Failed)
        {
            tokio::task::yield_now().await;
        }
        assert!(manager.stopped());

        failing.release.notify_one();
        worker.await.unwrap();

        // 目标自己失败不影响队列中的下一个
        assert_eq!(next.status(), Status::Finished);
        assert!(!manager.stopped());
    }

    /// 在管理器检查其状态时发出停止请求
    struct StopsOnCheck {
        state: TargetState,
        manager: std::sync::OnceLock<std::sync::Weak<TargetManager>>,
        ran: AtomicBool,
    }

    #[async_trait]
    impl Target for StopsOnCheck {
        fn state(&self) -> &TargetState {
            &self.state
        }

        fn kind(&self) -> TargetKind {
            TargetKind::Download
        }

        fn status(&self) -> Status {
            if let Some(manager) = self.manager.get().and_then(|m| m.upgrade()) {
                manager.stop();
            }
            self.state.status().get()
        }

        async fn execute(&self, _token: CancellationToken) -> Result<()> {
            self.ran.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_between_pop_and_start_is_kept() {
        let manager = Arc::new(TargetManager::new(EventSender::default()));
        let target = Arc::new(StopsOnCheck {
            state: TargetState::new(&EngineConfig::default()),
            manager: std::sync::OnceLock::new(),
            ran: AtomicBool::new(false),
        });
        let _ = target.manager.set(Arc::downgrade(&manager));
        manager.add(target.clone());

        manager.work().await;

        assert!(!target.ran.load(Ordering::SeqCst));
        assert_eq!(target.state.status().get(), Status::Unset);
        assert_eq!(manager.len(), 1);
        assert!(manager.stopped());
    }
}
