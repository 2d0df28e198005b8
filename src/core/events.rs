//! 事件分发：把任务状态和进度的变化推送给所有订阅者
//!
//! 所有事件都由控制器在处理消息时发出，同一任务的事件顺序与状态变化顺序一致。

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::core::error::TaskError;
use crate::core::task::{DownloadTask, TaskId, TaskState};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    TaskAdded {
        task: DownloadTask,
    },
    StateChanged {
        id: TaskId,
        old_state: TaskState,
        new_state: TaskState,
        error: Option<TaskError>,
    },
    Progress {
        id: TaskId,
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        speed_bps: f64,
        eta_seconds: Option<f64>,
    },
    TaskRemoved {
        id: TaskId,
    },
}

impl DownloadEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            DownloadEvent::TaskAdded { task } => task.id,
            DownloadEvent::StateChanged { id, .. }
            | DownloadEvent::Progress { id, .. }
            | DownloadEvent::TaskRemoved { id } => *id,
        }
    }
}

/// 订阅者列表，接收端关闭后自动移除
#[derive(Default)]
pub struct EventNotifier {
    subscribers: Vec<UnboundedSender<DownloadEvent>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> UnboundedReceiver<DownloadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: DownloadEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
