use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::collections::HashMap;

use crate::core::events::DownloadEvent;
use crate::core::task::{DownloadTask, TaskId, TaskState};
use super::{format_eta, format_size, format_speed};

const BAR_TEMPLATE: &str = "{prefix:>10} [{bar:32.cyan/blue}] {bytes}/{total_bytes} {msg}";

// 结构体：ProgressManager
// 每个任务一条进度条，全部由事件驱动
pub struct ProgressManager {
    multi: MultiProgress,
    bars: HashMap<TaskId, ProgressBar>,
    style: ProgressStyle,
}

impl ProgressManager {
    pub fn new() -> Self {
        Self::with_target(ProgressDrawTarget::stderr())
    }

    /// 不输出到终端，测试用
    pub fn hidden() -> Self {
        Self::with_target(ProgressDrawTarget::hidden())
    }

    fn with_target(target: ProgressDrawTarget) -> Self {
        let style = ProgressStyle::with_template(BAR_TEMPLATE)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("━━╌");
        ProgressManager {
            multi: MultiProgress::with_draw_target(target),
            bars: HashMap::new(),
            style,
        }
    }

    /// 为已有任务（例如启动时恢复的任务）创建进度条
    pub fn track(&mut self, task: &DownloadTask) {
        if self.bars.contains_key(&task.id) {
            return;
        }
        let pb = self.multi.add(ProgressBar::new(task.expected_size_bytes.unwrap_or(0)));
        pb.set_style(self.style.clone());
        pb.set_prefix(task.state.as_str());
        pb.set_position(task.bytes_received);
        pb.set_message(task.filename.clone());
        self.bars.insert(task.id, pb);
    }

    pub fn handle_event(&mut self, event: &DownloadEvent) {
        match event {
            DownloadEvent::TaskAdded { task } => self.track(task),
            DownloadEvent::Progress { id, bytes_downloaded, total_bytes, speed_bps, eta_seconds } => {
                if let Some(pb) = self.bars.get(id) {
                    if let Some(total) = total_bytes {
                        pb.set_length(*total);
                    }
                    pb.set_position(*bytes_downloaded);
                    pb.set_message(format!(
                        "{} | ETA:{}",
                        format_speed(*speed_bps),
                        eta_seconds.map(format_eta).unwrap_or_else(|| "未知".to_string())
                    ));
                }
            }
            DownloadEvent::StateChanged { id, new_state, error, .. } => {
                if let Some(pb) = self.bars.get(id) {
                    pb.set_prefix(new_state.as_str());
                    match (new_state, error) {
                        (TaskState::Completed, _) => {
                            if let Some(len) = pb.length() {
                                pb.set_position(len);
                            }
                            pb.set_message("✓ 完成");
                        }
                        (TaskState::Failed, Some(e)) => pb.set_message(format!("✗ {}", e.message)),
                        (TaskState::Queued, Some(e)) => pb.set_message(format!("等待重试: {}", e.message)),
                        _ => pb.set_message(String::new()),
                    }
                }
            }
            DownloadEvent::TaskRemoved { id } => {
                if let Some(pb) = self.bars.remove(id) {
                    pb.finish_and_clear();
                    self.multi.remove(&pb);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn finish(&self) {
        for pb in self.bars.values() {
            pb.abandon();
        }
    }

    pub fn println(&self, message: &str) {
        let _ = self.multi.println(message);
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}
