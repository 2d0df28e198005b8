use serde::{Serialize, Deserialize};
use std::fmt;

/// 下载任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Active,
    Paused,
    Verifying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    /// 终态：只能通过显式 Retry 离开
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// 是否占用一个工作槽位
    pub fn holds_slot(self) -> bool {
        matches!(self, TaskState::Active | TaskState::Verifying)
    }

    pub fn can_pause(self) -> bool {
        matches!(self, TaskState::Active | TaskState::Queued)
    }

    pub fn can_resume(self) -> bool {
        self == TaskState::Paused
    }

    /// Verifying 开始后不再接受取消
    pub fn can_cancel(self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Active | TaskState::Paused)
    }

    pub fn can_retry(self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Queued => "queued",
            TaskState::Active => "active",
            TaskState::Paused => "paused",
            TaskState::Verifying => "verifying",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
