use actix::Message;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::core::error::DownloadError;
use crate::core::events::DownloadEvent;
use crate::core::task::{DownloadRequest, DownloadTask, TaskId};

// ================== 对外命令 ==================

/// 添加下载任务，同一目标路径重复添加时返回已有任务
pub struct Enqueue(pub DownloadRequest);
impl Message for Enqueue { type Result = Result<TaskId, DownloadError>; }

/// 暂停任务（Active / Queued）
pub struct Pause(pub TaskId);
impl Message for Pause { type Result = Result<(), DownloadError>; }

/// 恢复暂停的任务
pub struct Resume(pub TaskId);
impl Message for Resume { type Result = Result<(), DownloadError>; }

/// 取消任务，可选删除未完成的文件
pub struct Cancel {
    pub id: TaskId,
    pub delete_partial: bool,
}
impl Message for Cancel { type Result = Result<(), DownloadError>; }

/// 重试失败或已取消的任务，重新排到队尾
pub struct Retry(pub TaskId);
impl Message for Retry { type Result = Result<(), DownloadError>; }

/// 调整并发上限，不会打断正在运行的任务
pub struct SetConcurrency(pub usize);
impl Message for SetConcurrency { type Result = Result<(), DownloadError>; }

/// 按创建时间列出全部任务
pub struct ListTasks;
impl Message for ListTasks { type Result = Vec<DownloadTask>; }

/// 查询单个任务
pub struct GetTask(pub TaskId);
impl Message for GetTask { type Result = Option<DownloadTask>; }

/// 删除一个终态任务的记录（不删除文件）
pub struct Purge(pub TaskId);
impl Message for Purge { type Result = Result<(), DownloadError>; }

/// 删除所有终态任务的记录，返回数量
pub struct PurgeFinished;
impl Message for PurgeFinished { type Result = usize; }

/// 订阅事件流
pub struct Subscribe;
impl Message for Subscribe { type Result = UnboundedReceiver<DownloadEvent>; }

/// 停止调度并让所有运行中的任务回到队列，记录提交后返回
pub struct Shutdown;
impl Message for Shutdown { type Result = (); }

// ================== worker 内部上报 ==================

/// 传输结束时的结果
#[derive(Debug)]
pub enum TransferOutcome {
    /// 已写满预期字节，等待校验
    Completed,
    /// 收到暂停/取消信号，在块边界停止
    Interrupted,
    Failed(DownloadError),
}

#[derive(Debug)]
pub enum ReportKind {
    Progress {
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        speed_bps: f64,
        eta_seconds: Option<f64>,
    },
    /// 文件已 sync，偏移量可以持久化
    Checkpoint {
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
    },
    Finished {
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        outcome: TransferOutcome,
    },
    Verified {
        result: Result<(), DownloadError>,
    },
    /// 未完成的文件已删除或清空
    Discarded,
}

/// worker 发给控制器的消息，lease 用来过滤过期 worker 的上报
#[derive(Debug)]
pub struct WorkerReport {
    pub id: TaskId,
    pub lease: u64,
    pub kind: ReportKind,
}
impl Message for WorkerReport { type Result = (); }
