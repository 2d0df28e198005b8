mod progress;

use std::fmt;
pub use progress::ProgressManager;

use crate::core::task::{DownloadTask, TaskState};

pub fn print_success(message: &str) {
    println!("✓ {}", message);
}

pub fn print_error(message: &str) {
    println!("✗ {}", message);
}

/// 任务列表汇总
#[derive(Debug, Default)]
pub struct DownloadSummary {
    pub total_files: usize,
    pub total_size: u64,
    pub elapsed_time: std::time::Duration,
    pub success_count: usize,
    pub failed_count: usize,
    pub unfinished_count: usize,
}

impl DownloadSummary {
    pub fn from_tasks(tasks: &[DownloadTask], elapsed_time: std::time::Duration) -> Self {
        let mut summary = DownloadSummary {
            total_files: tasks.len(),
            elapsed_time,
            ..Default::default()
        };
        for task in tasks {
            match task.state {
                TaskState::Completed => {
                    summary.success_count += 1;
                    summary.total_size += task.bytes_downloaded;
                }
                TaskState::Failed => summary.failed_count += 1,
                TaskState::Cancelled => {}
                _ => summary.unfinished_count += 1,
            }
        }
        summary
    }
}

impl fmt::Display for DownloadSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n下载摘要:")?;
        writeln!(f, "总文件数: {}", self.total_files)?;
        writeln!(f, "已完成大小: {}", format_size(self.total_size))?;
        writeln!(f, "耗时: {:.2}秒", self.elapsed_time.as_secs_f64())?;
        writeln!(f, "成功: {}", self.success_count)?;
        writeln!(f, "失败: {}", self.failed_count)?;
        writeln!(f, "未完成: {}", self.unfinished_count)?;
        Ok(())
    }
}

/// 单行任务描述，用于 --list
pub fn describe_task(task: &DownloadTask) -> String {
    let total = task
        .expected_size_bytes
        .map(format_size)
        .unwrap_or_else(|| "?".to_string());
    let mut line = format!(
        "{} {:>9} {:>10}/{:<10} {}",
        task.id,
        task.state.as_str(),
        format_size(task.bytes_downloaded),
        total,
        task.destination_path.display()
    );
    if let Some(error) = &task.last_error {
        line.push_str(&format!("  ({})", error.message));
    }
    line
}

pub fn format_size(size: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64))
}

pub fn format_eta(seconds: f64) -> String {
    let seconds = seconds.max(0.0) as u64;
    if seconds >= 3600 {
        format!("{}h{}m", seconds / 3600, (seconds % 3600) / 60)
    } else if seconds >= 60 {
        format!("{}m{}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}
