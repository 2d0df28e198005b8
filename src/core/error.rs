use thiserror::Error;
use serde::{Serialize, Deserialize};
use std::io;
use uuid::Uuid;

use crate::core::task::state::TaskState;

#[derive(Error, Debug)]
pub enum DownloadError {
    /// 连接重置、超时、5xx、429：按退避策略自动重试
    #[error("网络暂时性错误: {0}")]
    NetworkTransient(String),

    /// 429 以外的 4xx、无法解析的地址
    #[error("网络错误: {0}")]
    NetworkFatal(String),

    /// 服务器忽略了 Range 请求，需要从零开始
    #[error("服务器不支持断点续传: {0}")]
    RangeUnsupported(String),

    #[error("IO错误: {0}")]
    DiskIo(#[from] io::Error),

    #[error("文件大小不匹配: 预期 {expected} 字节, 实际 {actual} 字节")]
    SizeMismatch {
        expected: u64,
        actual: u64,
    },

    #[error("校验和不匹配: 预期 {expected}, 实际 {actual}")]
    ChecksumMismatch {
        expected: String,
        actual: String,
    },

    #[error("无效的请求: {0}")]
    InvalidRequest(String),

    #[error("非法的状态转换: 任务 {id} 处于 {from} 状态, 无法执行 {action}")]
    InvalidTransition {
        id: Uuid,
        from: TaskState,
        action: &'static str,
    },

    #[error("任务ID不存在: {0}")]
    TaskNotFound(Uuid),

    #[error("任务存储错误: {0}")]
    Store(String),
}

/// 持久化在任务记录里的错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NetworkTransient,
    NetworkFatal,
    RangeUnsupported,
    DiskIo,
    VerificationFailed,
    InvalidRequest,
    InvalidTransition,
    NotFound,
    Store,
}

impl DownloadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DownloadError::NetworkTransient(_) => ErrorKind::NetworkTransient,
            DownloadError::NetworkFatal(_) => ErrorKind::NetworkFatal,
            DownloadError::RangeUnsupported(_) => ErrorKind::RangeUnsupported,
            DownloadError::DiskIo(_) => ErrorKind::DiskIo,
            DownloadError::SizeMismatch { .. } | DownloadError::ChecksumMismatch { .. } => ErrorKind::VerificationFailed,
            DownloadError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            DownloadError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            DownloadError::TaskNotFound(_) => ErrorKind::NotFound,
            DownloadError::Store(_) => ErrorKind::Store,
        }
    }

    /// 只有暂时性网络错误会被自动重新调度
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::NetworkTransient(_))
    }

    /// 校验失败也计入重试预算
    pub fn counts_toward_retries(&self) -> bool {
        self.is_retryable() || self.kind() == ErrorKind::VerificationFailed
    }

    /// 根据 HTTP 状态码归类
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 429 | 500..=599 => DownloadError::NetworkTransient(format!("服务器返回 {}", status)),
            _ => DownloadError::NetworkFatal(format!("服务器返回 {}", status)),
        }
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        DownloadError::InvalidRequest(msg.into())
    }
}

/// 任务记录中的 lastError
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&DownloadError> for TaskError {
    fn from(error: &DownloadError) -> Self {
        TaskError {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
