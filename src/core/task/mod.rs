//! `task` 模块包含了与单个下载任务相关的数据与规则
//!
//! 主要包括：
//! - `state`: 任务状态 `TaskState` 及允许的状态转换
//! - `retry`: 重试与退避策略
//! - `util`: 测速窗口、Content-Range 解析、文件名工具

pub mod state;
pub mod retry;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

use crate::core::error::{DownloadError, TaskError};

pub use state::TaskState;
pub use retry::RetryStrategy;
pub use util::SpeedMeter;

pub type TaskId = Uuid;

/// 校验算法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    pub fn hex_len(self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => f.write_str("sha256"),
            ChecksumAlgorithm::Sha512 => f.write_str("sha512"),
        }
    }
}

/// 带算法标签的期望校验值
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn sha256(hex: impl Into<String>) -> Self {
        Self { algorithm: ChecksumAlgorithm::Sha256, hex: hex.into() }
    }

    pub fn validate(&self) -> Result<(), DownloadError> {
        let hex = self.hex.trim();
        if hex.len() != self.algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(DownloadError::invalid_request(format!("{} 校验值格式错误: {}", self.algorithm, self.hex)));
        }
        Ok(())
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.hex)
    }
}

/// 解析 `sha256:<hex>`，省略算法前缀时按 sha256 处理
impl FromStr for Checksum {
    type Err = DownloadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algorithm, hex) = match s.split_once(':') {
            Some((algo, hex)) => {
                let algorithm = match algo.to_ascii_lowercase().as_str() {
                    "sha256" => ChecksumAlgorithm::Sha256,
                    "sha512" => ChecksumAlgorithm::Sha512,
                    other => return Err(DownloadError::invalid_request(format!("不支持的校验算法: {}", other))),
                };
                (algorithm, hex)
            }
            None => (ChecksumAlgorithm::Sha256, s),
        };
        let checksum = Checksum { algorithm, hex: hex.trim().to_string() };
        checksum.validate()?;
        Ok(checksum)
    }
}

/// 来源适配器给出的下载请求
#[derive(Debug, Clone, Default)]
pub struct DownloadRequest {
    pub source_id: String,
    pub filename: String,
    pub url: String,
    /// 为空时由配置的下载目录推导
    pub destination: Option<PathBuf>,
    pub expected_size: Option<u64>,
    pub expected_checksum: Option<Checksum>,
}

impl DownloadRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), ..Default::default() }
    }

    pub fn source(mut self, source_id: impl Into<String>, filename: impl Into<String>) -> Self {
        self.source_id = source_id.into();
        self.filename = filename.into();
        self
    }

    pub fn destination(mut self, path: impl Into<PathBuf>) -> Self {
        self.destination = Some(path.into());
        self
    }

    pub fn expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn checksum(mut self, checksum: Checksum) -> Self {
        self.expected_checksum = Some(checksum);
        self
    }
}

/// 下载任务（持久化记录）
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct DownloadTask {
    pub id: TaskId,
    pub source_id: String,
    pub filename: String,
    pub source_url: String,
    pub destination_path: PathBuf,
    pub expected_size_bytes: Option<u64>,
    pub expected_checksum: Option<Checksum>,
    pub bytes_downloaded: u64,
    pub state: TaskState,
    pub retry_count: u32,
    pub last_error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// 最近一次进入 Queued 的时间，决定 FIFO 顺序
    pub queued_at: DateTime<Utc>,
    /// 退避中的任务在此之前不会被调度
    #[serde(default)]
    pub retry_at: Option<DateTime<Utc>>,
    /// 已写入但可能尚未 sync 的字节数，只在内存中
    #[serde(skip)]
    pub bytes_received: u64,
    #[serde(skip)]
    pub speed_bps: f64,
    #[serde(skip)]
    pub eta_seconds: Option<f64>,
}

impl DownloadTask {
    pub fn new(
        source_id: String,
        filename: String,
        source_url: String,
        destination_path: PathBuf,
        expected_size_bytes: Option<u64>,
        expected_checksum: Option<Checksum>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            source_id,
            filename,
            source_url,
            destination_path,
            expected_size_bytes,
            expected_checksum,
            bytes_downloaded: 0,
            state: TaskState::Queued,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            queued_at: now,
            retry_at: None,
            bytes_received: 0,
            speed_bps: 0.0,
            eta_seconds: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// 进度 (0.0 ~ 1.0)，总大小未知时为 0
    pub fn progress(&self) -> f64 {
        match self.expected_size_bytes {
            Some(0) | None => 0.0,
            Some(total) => (self.bytes_downloaded as f64 / total as f64).min(1.0),
        }
    }

    pub fn reset_stats(&mut self) {
        self.bytes_received = self.bytes_downloaded;
        self.speed_bps = 0.0;
        self.eta_seconds = None;
    }

    /// 记录新的偏移量，已知总大小时不会越界
    pub fn set_bytes_downloaded(&mut self, bytes: u64) {
        self.bytes_downloaded = match self.expected_size_bytes {
            Some(total) => bytes.min(total),
            None => bytes,
        };
        self.bytes_received = self.bytes_downloaded;
    }

    /// 传输中的实时字节数，不会越过已知总大小
    pub fn set_bytes_received(&mut self, bytes: u64) {
        self.bytes_received = match self.expected_size_bytes {
            Some(total) => bytes.min(total),
            None => bytes,
        };
    }
}
