pub mod comparator;
pub mod downloader;
pub mod events;
pub mod scannable;
pub mod scanner;
pub mod status;
pub mod synchronizer;
pub mod target;
pub mod target_manager;
pub mod worker;

pub use comparator::{Diff, DiffAction, FileComparator, NodeSource, NodeStream};
pub use downloader::{DownloadSummary, DownloadTarget, DownloadTask};
pub use events::{Event, EventSender};
pub use scannable::{ScanResult, Scannable, TreeWalk};
pub use scanner::{ScanSummary, ScanTarget};
pub use status::{Status, StatusCell};
pub use synchronizer::{SyncSummary, SyncTarget};
pub use target::{Folder, Progress, ProgressCounters, Target, TargetKind, TargetState};
pub use target_manager::{SharedTarget, TargetManager};
pub use worker::{FailedTask, PoolReport, Producer, TaskHandler, TaskQueue, WorkerPool};
