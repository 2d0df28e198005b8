//! Core: 任务模型、队列调度、传输 worker、持久化与事件分发

pub mod controller;
pub mod error;
pub mod events;
pub mod messages;
pub mod store;
pub mod task;
pub mod verify;
pub mod worker;

pub use controller::QueueController;
pub use error::{DownloadError, ErrorKind, TaskError};
pub use events::{DownloadEvent, EventNotifier};
pub use messages::{
    Cancel, Enqueue, GetTask, ListTasks, Pause, Purge, PurgeFinished, Resume, Retry, SetConcurrency, Shutdown,
    Subscribe,
};
pub use task::{Checksum, ChecksumAlgorithm, DownloadRequest, DownloadTask, TaskId, TaskState};
