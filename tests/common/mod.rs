#![allow(dead_code)]

use actix::prelude::*;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use wiremock::{Request, Respond, ResponseTemplate};

use modeldown::config::Config;
use modeldown::core::{DownloadTask, GetTask, QueueController, TaskId};

/// 可预测的测试内容
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// 小块、频繁持久化、几乎没有退避延迟的配置
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.download_dir = dir.join("models").to_string_lossy().to_string();
    config.state_dir = dir.join("state").to_string_lossy().to_string();
    config.log_file = dir.join("modeldown.log").to_string_lossy().to_string();
    config.max_concurrent_downloads = 3;
    config.chunk_size = 1024;
    config.persist_every_chunks = 1;
    config.persist_interval_ms = 50;
    config.progress_interval_ms = 0;
    config.connect_timeout = 5;
    config.read_timeout = 5;
    config.retry_count = 3;
    config.retry_delay_ms = 10;
    config.retry_max_delay_ms = 50;
    config.retry_jitter = 0.0;
    config
}

pub fn start_controller(config: Config) -> Addr<QueueController> {
    QueueController::new(config).expect("无法创建控制器").start()
}

/// 轮询直到任务满足条件
pub async fn wait_for<F>(addr: &Addr<QueueController>, id: TaskId, mut pred: F) -> DownloadTask
where
    F: FnMut(&DownloadTask) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let task = addr.send(GetTask(id)).await.unwrap().expect("任务不存在");
        if pred(&task) {
            return task;
        }
        assert!(Instant::now() < deadline, "等待超时, 当前任务: {:?}", task);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// 静态文件服务；`honor_range` 为 false 时忽略 Range，总是返回 200
pub struct RangeFile {
    pub body: Vec<u8>,
    pub honor_range: bool,
    pub delay: Option<Duration>,
}

impl RangeFile {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body, honor_range: true, delay: None }
    }

    pub fn ignoring_range(body: Vec<u8>) -> Self {
        Self { body, honor_range: false, delay: None }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

pub fn range_start(request: &Request) -> Option<u64> {
    let value = request.headers.get("range")?.to_str().ok()?;
    value.strip_prefix("bytes=")?.trim_end_matches('-').parse().ok()
}

impl Respond for RangeFile {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len() as u64;
        let template = match range_start(request) {
            Some(start) if self.honor_range && start >= total => ResponseTemplate::new(416)
                .insert_header("Content-Range", format!("bytes */{}", total)),
            Some(start) if self.honor_range => ResponseTemplate::new(206)
                .insert_header("Content-Range", format!("bytes {}-{}/{}", start, total - 1, total))
                .set_body_bytes(self.body[start as usize..].to_vec()),
            _ => ResponseTemplate::new(200).set_body_bytes(self.body.clone()),
        };
        match self.delay {
            Some(delay) => template.set_delay(delay),
            None => template,
        }
    }
}

/// 前 `failures` 次请求返回 503，之后正常提供文件
pub struct Flaky {
    pub failures: usize,
    pub seen: AtomicUsize,
    pub file: RangeFile,
}

impl Respond for Flaky {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if self.seen.fetch_add(1, Ordering::SeqCst) < self.failures {
            return ResponseTemplate::new(503);
        }
        self.file.respond(request)
    }
}

/// 首次完整请求只发送前 `stall_after` 字节然后挂起连接；带 Range 的请求正常返回剩余部分。
/// `ranges` 记录每个请求的 Range 起点
pub struct StallingServer {
    pub uri: String,
    pub ranges: Arc<Mutex<Vec<Option<u64>>>>,
}

impl StallingServer {
    pub async fn start(body: Vec<u8>, stall_after: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("http://{}", listener.local_addr().unwrap());
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let seen = ranges.clone();
        let body = Arc::new(body);
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (body, seen) = (body.clone(), seen.clone());
                tokio::spawn(async move {
                    let _ = serve_stalling(socket, &body, stall_after, &seen).await;
                });
            }
        });
        Self { uri, ranges }
    }

    pub fn ranges(&self) -> Vec<Option<u64>> {
        self.ranges.lock().unwrap().clone()
    }
}

async fn serve_stalling(
    mut socket: TcpStream,
    body: &[u8],
    stall_after: usize,
    seen: &Mutex<Vec<Option<u64>>>,
) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }
    let start = String::from_utf8_lossy(&head)
        .to_lowercase()
        .lines()
        .find_map(|line| line.strip_prefix("range: bytes=").map(|v| v.trim().trim_end_matches('-').to_string()))
        .and_then(|v| v.parse::<usize>().ok());
    seen.lock().unwrap().push(start.map(|s| s as u64));

    let total = body.len();
    match start {
        None => {
            let header = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n", total);
            socket.write_all(header.as_bytes()).await?;
            socket.write_all(&body[..stall_after.min(total)]).await?;
            socket.flush().await?;
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Some(start) if start >= total => {
            let header = format!("HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", total);
            socket.write_all(header.as_bytes()).await?;
        }
        Some(start) => {
            let header = format!(
                "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {}-{}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                start,
                total - 1,
                total,
                total - start
            );
            socket.write_all(header.as_bytes()).await?;
            socket.write_all(&body[start..]).await?;
        }
    }
    socket.flush().await
}
