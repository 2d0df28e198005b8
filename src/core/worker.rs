//! 单任务传输：带 Range 的流式下载，按固定大小的块追加写盘
//!
//! worker 只通过 `WorkerReport` 与控制器通信。偏移量只有在文件 sync 之后才会
//! 作为 Checkpoint 上报，因此持久化记录里的 bytes_downloaded 永远不超过磁盘上
//! 的文件长度。

use actix::Recipient;
use awc::error::PayloadError;
use awc::http::header::{self, HeaderMap};
use awc::http::StatusCode;
use awc::Client;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::error::{DownloadError, ErrorKind};
use crate::core::messages::{ReportKind, TransferOutcome, WorkerReport};
use crate::core::task::util::{estimate_eta, parse_content_range};
use crate::core::task::{Checksum, SpeedMeter, TaskId};
use crate::core::verify;

/// 传输参数
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub chunk_size: usize,
    pub persist_every_chunks: u32,
    pub persist_interval: Duration,
    pub progress_interval: Duration,
    pub speed_window: Duration,
    pub read_timeout: Duration,
}

impl From<&Config> for TransferSettings {
    fn from(config: &Config) -> Self {
        Self {
            chunk_size: config.chunk_size,
            persist_every_chunks: config.persist_every_chunks,
            persist_interval: Duration::from_millis(config.persist_interval_ms),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
            speed_window: Duration::from_secs(config.speed_window_secs.max(1)),
            read_timeout: Duration::from_secs(config.read_timeout),
        }
    }
}

/// 构建 HTTP 客户端；整体超时关闭，响应头和响应体都由读取超时检测卡死的连接
pub fn build_client(config: &Config) -> Client {
    Client::builder()
        .disable_timeout()
        .connector(awc::Connector::new().timeout(Duration::from_secs(config.connect_timeout)))
        .max_redirects(config.max_redirects)
        .add_default_header((header::USER_AGENT, config.user_agent.clone()))
        .finish()
}

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, PayloadError>>>>;

/// 已收到响应头的请求
struct Opened {
    status: StatusCode,
    headers: HeaderMap,
    body: BodyStream,
}

/// 一次传输所需的任务信息
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: TaskId,
    pub lease: u64,
    pub url: String,
    pub destination: PathBuf,
    /// 已持久化的偏移
    pub offset: u64,
    pub expected_size: Option<u64>,
}

pub struct TransferWorker {
    client: Client,
    settings: TransferSettings,
    job: TransferJob,
    token: CancellationToken,
    reporter: Recipient<WorkerReport>,
    meter: SpeedMeter,
    written: u64,
    total: Option<u64>,
    chunks_since_persist: u32,
    last_persist: Instant,
    last_progress: Option<Instant>,
}

impl TransferWorker {
    pub fn new(
        client: Client,
        settings: TransferSettings,
        job: TransferJob,
        token: CancellationToken,
        reporter: Recipient<WorkerReport>,
    ) -> Self {
        let meter = SpeedMeter::new(settings.speed_window);
        let written = job.offset;
        let total = job.expected_size;
        Self {
            client,
            settings,
            job,
            token,
            reporter,
            meter,
            written,
            total,
            chunks_since_persist: 0,
            last_persist: Instant::now(),
            last_progress: None,
        }
    }

    /// 执行传输，结束时总会上报一次 Finished
    pub async fn run(mut self) {
        log::info!("开始传输 {} -> {} (偏移 {})", self.job.url, self.job.destination.display(), self.job.offset);
        let outcome = match self.transfer().await {
            Ok(outcome) => outcome,
            Err(e) => TransferOutcome::Failed(e),
        };
        match &outcome {
            TransferOutcome::Completed => {
                self.report_progress(true);
                log::info!("传输完成: {} ({} 字节)", self.job.destination.display(), self.written);
            }
            TransferOutcome::Interrupted => log::info!("传输已中断: {} (偏移 {})", self.job.destination.display(), self.written),
            TransferOutcome::Failed(e) => {
                log::error!("传输失败: {} - {}", self.job.url, e);
                if e.kind() == ErrorKind::VerificationFailed && self.written > 0 {
                    match truncate_file(&self.job.destination, 0).await {
                        Ok(()) => self.written = 0,
                        Err(io) => log::error!("清空文件 {} 失败: {}", self.job.destination.display(), io),
                    }
                }
            }
        }
        self.report(ReportKind::Finished {
            bytes_downloaded: self.written,
            total_bytes: self.total,
            outcome,
        });
    }

    fn report(&self, kind: ReportKind) {
        self.reporter.do_send(WorkerReport { id: self.job.id, lease: self.job.lease, kind });
    }

    fn report_checkpoint(&mut self) {
        self.chunks_since_persist = 0;
        self.last_persist = Instant::now();
        log::debug!("持久化偏移 {} -> {}", self.job.id, self.written);
        self.report(ReportKind::Checkpoint { bytes_downloaded: self.written, total_bytes: self.total });
    }

    fn report_progress(&mut self, force: bool) {
        let now = Instant::now();
        if !force {
            if let Some(last) = self.last_progress {
                if now.duration_since(last) < self.settings.progress_interval {
                    return;
                }
            }
        }
        self.last_progress = Some(now);
        let speed_bps = self.meter.speed_at(now);
        self.report(ReportKind::Progress {
            bytes_downloaded: self.written,
            total_bytes: self.total,
            speed_bps,
            eta_seconds: estimate_eta(self.total, self.written, speed_bps),
        });
    }

    async fn transfer(&mut self) -> Result<TransferOutcome, DownloadError> {
        if let Some(parent) = self.job.destination.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let offset = self.prepare_partial().await?;
        if offset != self.job.offset {
            self.written = offset;
            self.report_checkpoint();
        }

        if self.total == Some(offset) {
            log::info!("文件已完整存在, 跳过下载: {}", self.job.destination.display());
            if offset == 0 {
                File::create(&self.job.destination).await?;
            }
            return Ok(TransferOutcome::Completed);
        }

        let Some(body) = self.open_stream(offset).await? else {
            return Ok(TransferOutcome::Interrupted);
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.job.destination)
            .await?;

        let result = self.stream_body(&mut file, body).await;
        let closed = async {
            file.flush().await?;
            file.sync_all().await
        }
        .await;

        match (result, closed) {
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e.into()),
            (Ok(outcome), Ok(())) => Ok(outcome),
        }
    }

    /// 把磁盘上的文件对齐到已持久化的偏移，多出的未记录字节直接截掉
    async fn prepare_partial(&mut self) -> Result<u64, DownloadError> {
        let len = match tokio::fs::metadata(&self.job.destination).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut offset = self.job.offset.min(len);
        if let Some(total) = self.total {
            if offset > total {
                offset = 0;
            }
        }
        if len != offset {
            log::warn!("截断 {} 到已持久化的偏移 {} (原长度 {})", self.job.destination.display(), offset, len);
            truncate_file(&self.job.destination, offset).await?;
        }
        Ok(offset)
    }

    async fn send(&self, offset: u64) -> Result<Option<Opened>, DownloadError> {
        let mut request = self
            .client
            .get(&self.job.url)
            .insert_header((header::ACCEPT_ENCODING, "identity"))
            .no_decompress();
        if offset > 0 {
            request = request.insert_header((header::RANGE, format!("bytes={}-", offset)));
        }

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Ok(None),
            // 客户端没有整体超时，响应头同样受读取超时约束
            result = tokio::time::timeout(self.settings.read_timeout, request.send()) => match result {
                Err(_) => Err(DownloadError::NetworkTransient(format!(
                    "等待响应头超时 ({} 秒)",
                    self.settings.read_timeout.as_secs()
                ))),
                Ok(Ok(response)) => Ok(Some(Opened {
                    status: response.status(),
                    headers: response.headers().clone(),
                    body: Box::pin(response),
                })),
                Ok(Err(awc::error::SendRequestError::Url(e))) => Err(DownloadError::NetworkFatal(format!("无效的URL: {}", e))),
                Ok(Err(awc::error::SendRequestError::Http(e))) => Err(DownloadError::NetworkFatal(format!("请求构造失败: {}", e))),
                Ok(Err(e)) => Err(DownloadError::NetworkTransient(format!("请求失败: {}", e))),
            },
        }
    }

    /// 发起请求并确定续传位置；服务器不支持 Range 时丢弃已有数据从零开始
    async fn open_stream(&mut self, mut offset: u64) -> Result<Option<BodyStream>, DownloadError> {
        let mut restarted = false;
        loop {
            let Some(response) = self.send(offset).await? else {
                return Ok(None);
            };
            let status = response.status;

            let range_rejected = if offset > 0 && status == StatusCode::PARTIAL_CONTENT {
                match header_str(&response.headers, header::CONTENT_RANGE).and_then(parse_content_range) {
                    Some((start, _, total)) if start == offset => {
                        let remote_total = total.or_else(|| content_length(&response.headers).map(|len| offset + len));
                        if let Some(remote_total) = remote_total {
                            self.learn_total(remote_total)?;
                        }
                        return Ok(Some(response.body));
                    }
                    _ => Some(DownloadError::RangeUnsupported("Content-Range 与请求的偏移不一致".to_string())),
                }
            } else if offset > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
                Some(DownloadError::RangeUnsupported(format!("偏移 {} 超出远端文件", offset)))
            } else {
                None
            };

            if let Some(reason) = range_rejected {
                if restarted {
                    return Err(DownloadError::NetworkFatal(reason.to_string()));
                }
                log::warn!("{}: {}, 重新从头下载", self.job.url, reason);
                restarted = true;
                offset = self.discard_partial().await?;
                continue;
            }

            if !status.is_success() {
                return Err(DownloadError::from_status(status.as_u16()));
            }

            if offset > 0 {
                // 200 完整响应：直接复用这次响应体，从零写起
                log::warn!("服务器忽略了 Range 请求, 丢弃已有的 {} 字节从头下载: {}", offset, self.job.url);
                self.discard_partial().await?;
            }
            let total = if status == StatusCode::PARTIAL_CONTENT {
                header_str(&response.headers, header::CONTENT_RANGE)
                    .and_then(parse_content_range)
                    .and_then(|(_, _, total)| total)
            } else {
                content_length(&response.headers)
            };
            if let Some(total) = total {
                self.learn_total(total)?;
            }
            return Ok(Some(response.body));
        }
    }

    /// 记录远端总大小；与已知大小冲突时按校验失败处理
    fn learn_total(&mut self, remote_total: u64) -> Result<(), DownloadError> {
        if remote_total == 0 {
            return Ok(());
        }
        match self.total {
            None => {
                log::info!("从响应头得到文件大小: {} 字节", remote_total);
                self.total = Some(remote_total);
                Ok(())
            }
            Some(expected) if expected != remote_total => Err(DownloadError::SizeMismatch {
                expected,
                actual: remote_total,
            }),
            Some(_) => Ok(()),
        }
    }

    async fn discard_partial(&mut self) -> Result<u64, DownloadError> {
        truncate_file(&self.job.destination, 0).await?;
        self.written = 0;
        self.report_checkpoint();
        Ok(0)
    }

    async fn stream_body(
        &mut self,
        file: &mut File,
        mut body: BodyStream,
    ) -> Result<TransferOutcome, DownloadError> {
        let chunk_size = self.settings.chunk_size;
        let mut buffer = BytesMut::with_capacity(chunk_size);

        let ended: Result<bool, DownloadError> = 'stream: loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break 'stream Ok(false),
                item = tokio::time::timeout(self.settings.read_timeout, body.next()) => item,
            };
            match next {
                Err(_) => break 'stream Err(DownloadError::NetworkTransient("读取超时".to_string())),
                Ok(None) => break 'stream Ok(true),
                Ok(Some(Err(e))) => break 'stream Err(DownloadError::NetworkTransient(format!("网络流错误: {}", e))),
                Ok(Some(Ok(bytes))) => {
                    buffer.extend_from_slice(&bytes);
                    while buffer.len() >= chunk_size {
                        let chunk = buffer.split_to(chunk_size);
                        self.write_chunk(file, &chunk).await?;
                        if self.token.is_cancelled() {
                            break 'stream Ok(false);
                        }
                    }
                }
            }
        };

        // 已收到的尾部数据同样有效，写完再退出
        if !buffer.is_empty() {
            self.write_chunk(file, &buffer).await?;
        }

        match ended {
            Ok(false) => {
                self.sync_and_checkpoint(file).await?;
                Ok(TransferOutcome::Interrupted)
            }
            Ok(true) => {
                file.sync_all().await?;
                match self.total {
                    Some(total) if self.written < total => {
                        self.report_checkpoint();
                        Err(DownloadError::NetworkTransient(format!(
                            "连接提前关闭: 已接收 {} / {} 字节",
                            self.written, total
                        )))
                    }
                    Some(_) => Ok(TransferOutcome::Completed),
                    None => {
                        self.total = Some(self.written);
                        Ok(TransferOutcome::Completed)
                    }
                }
            }
            Err(e) => {
                self.sync_and_checkpoint(file).await?;
                Err(e)
            }
        }
    }

    /// 追加一块；失败时截回写入前的长度，已有字节保持不变
    async fn write_chunk(&mut self, file: &mut File, data: &[u8]) -> Result<(), DownloadError> {
        let before = self.written;
        let after = before + data.len() as u64;
        if let Some(total) = self.total {
            if after > total {
                return Err(DownloadError::SizeMismatch { expected: total, actual: after });
            }
        }

        let written = async {
            file.write_all(data).await?;
            file.flush().await
        }
        .await;
        if let Err(e) = written {
            log::error!("写入失败 {}: {}, 回退到 {} 字节", self.job.destination.display(), e, before);
            let _ = file.set_len(before).await;
            return Err(DownloadError::DiskIo(e));
        }

        self.written = after;
        self.meter.record(data.len() as u64);
        self.chunks_since_persist += 1;

        if self.chunks_since_persist >= self.settings.persist_every_chunks
            || self.last_persist.elapsed() >= self.settings.persist_interval
        {
            self.sync_and_checkpoint(file).await?;
        }
        self.report_progress(false);
        Ok(())
    }

    async fn sync_and_checkpoint(&mut self, file: &mut File) -> Result<(), DownloadError> {
        file.sync_data().await?;
        self.report_checkpoint();
        Ok(())
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    header_str(headers, header::CONTENT_LENGTH).and_then(|s| s.trim().parse().ok())
}

async fn truncate_file(path: &Path, len: u64) -> Result<(), DownloadError> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    file.sync_all().await?;
    Ok(())
}

/// 校验下载结果并上报；校验失败时清空文件，下次重试从头下载
pub async fn verify_download(
    id: TaskId,
    lease: u64,
    path: PathBuf,
    expected_size: Option<u64>,
    checksum: Option<Checksum>,
    reporter: Recipient<WorkerReport>,
) {
    let result = verify::verify_file(&path, expected_size, checksum.as_ref()).await;
    if let Err(e) = &result {
        if e.kind() == ErrorKind::VerificationFailed {
            if let Err(io) = truncate_file(&path, 0).await {
                log::error!("清空校验失败的文件 {} 失败: {}", path.display(), io);
            }
        }
    }
    reporter.do_send(WorkerReport { id, lease, kind: ReportKind::Verified { result } });
}

/// 删除未完成的文件
pub async fn discard_file(id: TaskId, lease: u64, path: PathBuf, reporter: Recipient<WorkerReport>) {
    match tokio::fs::remove_file(&path).await {
        Ok(()) => log::info!("已删除未完成的文件: {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::error!("删除文件 {} 失败: {}", path.display(), e),
    }
    reporter.do_send(WorkerReport { id, lease, kind: ReportKind::Discarded });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = Config::default();
        config.chunk_size = 4096;
        config.persist_interval_ms = 500;
        config.speed_window_secs = 0;
        let settings = TransferSettings::from(&config);
        assert_eq!(settings.chunk_size, 4096);
        assert_eq!(settings.persist_interval, Duration::from_millis(500));
        // 窗口至少一秒
        assert_eq!(settings.speed_window, Duration::from_secs(1));
    }

    #[actix_rt::test]
    async fn test_truncate_file_keeps_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        tokio_test::assert_ok!(truncate_file(&path, 4).await);
        assert_eq!(std::fs::read(&path).unwrap(), b"0123");
    }
}
