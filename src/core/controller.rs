//! 队列控制器：唯一持有任务表的 Actor
//!
//! 所有命令和 worker 上报都经过这个 Actor 的邮箱串行处理，状态转换、持久化
//! 和事件发送因此天然有序。每个被调度的任务得到一个 lease 编号和一个
//! `CancellationToken`；worker 退出（上报 Finished / Verified / Discarded）
//! 之前，同一目标文件不会再被调度，保证每个文件任何时刻只有一个写入者。

use actix::prelude::*;
use awc::Client;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::error::{DownloadError, ErrorKind, TaskError};
use crate::core::events::{DownloadEvent, EventNotifier};
use crate::core::messages::*;
use crate::core::store::{recover_tasks, Barrier, DeleteTask, JsonTaskStore, SaveTask, StoreActor};
use crate::core::task::util::filename_from_url;
use crate::core::task::{DownloadRequest, DownloadTask, RetryStrategy, TaskId, TaskState};
use crate::core::worker::{self, TransferJob, TransferSettings, TransferWorker};
use crate::utils::validator;

/// 关闭时等待 worker 退出的上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// 正在占用目标文件的后台任务（传输、校验或删除）
struct Lease {
    lease: u64,
    token: CancellationToken,
    destination: PathBuf,
}

pub struct QueueController {
    config: Config,
    retry: RetryStrategy,
    settings: TransferSettings,
    client: Client,
    store: Addr<StoreActor>,
    tasks: HashMap<TaskId, DownloadTask>,
    leases: HashMap<TaskId, Lease>,
    next_lease: u64,
    /// 取消时要求删除文件、但 worker 尚未退出的任务
    discard_on_exit: HashSet<TaskId>,
    notifier: EventNotifier,
    max_concurrent: usize,
    accepting: bool,
    retry_timer: Option<SpawnHandle>,
    idle_waiters: Vec<oneshot::Sender<()>>,
}

impl QueueController {
    /// 打开任务存储并恢复上次的任务；需要在 actix System 中调用
    pub fn new(config: Config) -> Result<Self, DownloadError> {
        config.validate()?;
        let store = JsonTaskStore::open(&config.state_dir)?;
        let recovered = recover_tasks(store.load_all()?, config.auto_resume_on_startup);
        for task in recovered.iter().filter(|t| !t.state.is_terminal()) {
            store.save(task)?;
        }
        log::info!("从 {} 恢复了 {} 个任务", store.dir().display(), recovered.len());

        Ok(Self {
            retry: config.retry_strategy(),
            settings: TransferSettings::from(&config),
            client: worker::build_client(&config),
            store: StoreActor::start(store),
            tasks: recovered.into_iter().map(|t| (t.id, t)).collect(),
            leases: HashMap::new(),
            next_lease: 0,
            discard_on_exit: HashSet::new(),
            notifier: EventNotifier::new(),
            max_concurrent: config.max_concurrent_downloads,
            accepting: true,
            retry_timer: None,
            idle_waiters: Vec::new(),
            config,
        })
    }

    fn task(&self, id: TaskId) -> Result<&DownloadTask, DownloadError> {
        self.tasks.get(&id).ok_or(DownloadError::TaskNotFound(id))
    }

    fn active_count(&self) -> usize {
        self.tasks.values().filter(|t| t.state.holds_slot()).count()
    }

    fn persist(&self, id: TaskId) {
        if let Some(task) = self.tasks.get(&id) {
            self.store.do_send(SaveTask(task.clone()));
        }
    }

    fn new_lease(&mut self, id: TaskId, destination: PathBuf) -> (u64, CancellationToken) {
        self.next_lease += 1;
        let token = CancellationToken::new();
        self.leases.insert(id, Lease { lease: self.next_lease, token: token.clone(), destination });
        (self.next_lease, token)
    }

    fn release(&mut self, id: TaskId) {
        self.leases.remove(&id);
        if self.leases.is_empty() {
            for waiter in self.idle_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

    fn destination_busy(&self, destination: &PathBuf) -> bool {
        self.leases.values().any(|l| &l.destination == destination)
    }

    /// 修改状态、持久化并发出事件
    fn transition(&mut self, id: TaskId, new_state: TaskState, error: Option<TaskError>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let old_state = task.state;
        task.state = new_state;
        if error.is_some() {
            task.last_error = error.clone();
        }
        if !new_state.holds_slot() {
            task.reset_stats();
        }
        task.touch();
        match &error {
            Some(e) => log::info!("任务 {} 状态 {} -> {} ({})", id, old_state, new_state, e.message),
            None => log::info!("任务 {} 状态 {} -> {}", id, old_state, new_state),
        }
        self.persist(id);
        self.notifier.emit(DownloadEvent::StateChanged { id, old_state, new_state, error });
    }

    /// 按 FIFO 顺序填满空闲的并发槽位
    fn admit(&mut self, ctx: &mut Context<Self>) {
        if !self.accepting {
            return;
        }
        let now = Utc::now();
        let mut running = self.active_count();
        if running < self.max_concurrent {
            let mut candidates: Vec<&DownloadTask> = self
                .tasks
                .values()
                .filter(|t| t.state == TaskState::Queued)
                .filter(|t| t.retry_at.map_or(true, |at| at <= now))
                .filter(|t| !self.destination_busy(&t.destination_path))
                .collect();
            candidates.sort_by_key(|t| (t.queued_at, t.created_at, t.id));
            let ready: Vec<TaskId> = candidates.into_iter().map(|t| t.id).collect();

            for id in ready {
                if running >= self.max_concurrent {
                    break;
                }
                self.start_transfer(id, ctx);
                running += 1;
            }
        }
        self.schedule_retry_timer(ctx);
    }

    /// 为最早到期的退避任务安排一次调度
    fn schedule_retry_timer(&mut self, ctx: &mut Context<Self>) {
        if let Some(handle) = self.retry_timer.take() {
            ctx.cancel_future(handle);
        }
        let now = Utc::now();
        let next = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Queued)
            .filter_map(|t| t.retry_at)
            .filter(|at| *at > now)
            .min();
        if let Some(at) = next {
            let delay = (at - now).to_std().unwrap_or_default();
            self.retry_timer = Some(ctx.run_later(delay, |act, ctx| {
                act.retry_timer = None;
                act.admit(ctx);
            }));
        }
    }

    fn start_transfer(&mut self, id: TaskId, ctx: &mut Context<Self>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        task.retry_at = None;
        let (url, destination, offset, expected_size) = (
            task.source_url.clone(),
            task.destination_path.clone(),
            task.bytes_downloaded,
            task.expected_size_bytes,
        );
        let (lease, token) = self.new_lease(id, destination.clone());
        self.transition(id, TaskState::Active, None);

        let job = TransferJob { id, lease, url, destination, offset, expected_size };
        let worker = TransferWorker::new(
            self.client.clone(),
            self.settings.clone(),
            job,
            token,
            ctx.address().recipient(),
        );
        actix::spawn(worker.run());
    }

    fn start_verification(&mut self, id: TaskId, ctx: &mut Context<Self>) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let (path, expected_size, checksum) = (
            task.destination_path.clone(),
            task.expected_size_bytes,
            task.expected_checksum.clone(),
        );
        let (lease, _token) = self.new_lease(id, path.clone());
        self.transition(id, TaskState::Verifying, None);
        actix::spawn(worker::verify_download(id, lease, path, expected_size, checksum, ctx.address().recipient()));
    }

    fn start_discard(&mut self, id: TaskId, ctx: &mut Context<Self>) {
        let Some(task) = self.tasks.get(&id) else {
            return;
        };
        let path = task.destination_path.clone();
        let (lease, _token) = self.new_lease(id, path.clone());
        actix::spawn(worker::discard_file(id, lease, path, ctx.address().recipient()));
    }

    /// 重新排到队尾
    fn requeue(&mut self, id: TaskId, retry_at: Option<chrono::DateTime<Utc>>, error: Option<TaskError>) {
        if let Some(task) = self.tasks.get_mut(&id) {
            task.queued_at = Utc::now();
            task.retry_at = retry_at;
        }
        self.transition(id, TaskState::Queued, error);
    }

    fn fail_or_retry(&mut self, id: TaskId, error: DownloadError) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        let recorded = TaskError::from(&error);
        if self.retry.should_retry(&error, task.retry_count) {
            let delay = self.retry.get_delay(task.retry_count);
            task.retry_count += 1;
            log::warn!("任务 {} 第 {} 次重试, {:?} 后重新调度: {}", id, task.retry_count, delay, error);
            let retry_at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            self.requeue(id, Some(retry_at), Some(recorded));
        } else {
            if error.counts_toward_retries() && !error.is_retryable() {
                task.retry_count += 1;
            }
            log::error!("任务 {} 失败: {}", id, error);
            self.transition(id, TaskState::Failed, Some(recorded));
        }
    }

    fn on_progress(&mut self, id: TaskId, bytes_downloaded: u64, total_bytes: Option<u64>, speed_bps: f64, eta_seconds: Option<f64>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        // 暂停或取消之后到达的进度直接丢弃
        if task.state != TaskState::Active {
            return;
        }
        if task.expected_size_bytes.is_none() {
            task.expected_size_bytes = total_bytes;
        }
        task.set_bytes_received(bytes_downloaded);
        task.speed_bps = speed_bps;
        task.eta_seconds = eta_seconds;
        self.notifier.emit(DownloadEvent::Progress {
            id,
            bytes_downloaded,
            total_bytes: task.expected_size_bytes,
            speed_bps,
            eta_seconds,
        });
    }

    /// 记录已 sync 的偏移
    fn record_offset(&mut self, id: TaskId, bytes_downloaded: u64, total_bytes: Option<u64>) {
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.state == TaskState::Completed {
            return;
        }
        if task.expected_size_bytes.is_none() {
            task.expected_size_bytes = total_bytes;
        }
        task.set_bytes_downloaded(bytes_downloaded);
        task.touch();
        self.persist(id);
    }

    fn on_finished(&mut self, id: TaskId, bytes_downloaded: u64, total_bytes: Option<u64>, outcome: TransferOutcome, ctx: &mut Context<Self>) {
        self.release(id);
        self.record_offset(id, bytes_downloaded, total_bytes);
        let Some(state) = self.tasks.get(&id).map(|t| t.state) else {
            return;
        };

        if state != TaskState::Active {
            // 暂停、取消或关闭之后的收尾
            log::debug!("任务 {} 的 worker 已退出 (状态 {}, 偏移 {})", id, state, bytes_downloaded);
            if self.discard_on_exit.remove(&id) {
                self.start_discard(id, ctx);
            }
            return;
        }

        match outcome {
            TransferOutcome::Completed => self.start_verification(id, ctx),
            TransferOutcome::Interrupted => {
                log::warn!("任务 {} 的传输被意外中断, 重新排队", id);
                self.requeue(id, None, None);
            }
            TransferOutcome::Failed(error) => self.fail_or_retry(id, error),
        }
    }

    fn on_verified(&mut self, id: TaskId, result: Result<(), DownloadError>) {
        self.release(id);
        let Some(task) = self.tasks.get_mut(&id) else {
            return;
        };
        if task.state != TaskState::Verifying {
            log::debug!("任务 {} 已不在校验状态, 忽略校验结果", id);
            return;
        }
        match result {
            Ok(()) => {
                if let Some(total) = task.expected_size_bytes {
                    task.bytes_downloaded = total;
                }
                task.last_error = None;
                task.retry_at = None;
                self.transition(id, TaskState::Completed, None);
            }
            Err(error) => {
                if error.kind() == ErrorKind::VerificationFailed {
                    // 文件已被清空，重试时从头下载
                    task.bytes_downloaded = 0;
                }
                self.fail_or_retry(id, error);
            }
        }
    }

    fn on_discarded(&mut self, id: TaskId) {
        self.release(id);
        if let Some(task) = self.tasks.get_mut(&id) {
            task.set_bytes_downloaded(0);
            task.touch();
            self.persist(id);
        }
    }

    fn remove_record(&mut self, id: TaskId) {
        if self.tasks.remove(&id).is_some() {
            self.discard_on_exit.remove(&id);
            self.store.do_send(DeleteTask(id));
            self.notifier.emit(DownloadEvent::TaskRemoved { id });
            log::info!("已删除任务记录 {}", id);
        }
    }
}

impl Actor for QueueController {
    type Context = Context<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        log::info!("队列控制器已启动, 并发上限 {}", self.max_concurrent);
        self.admit(ctx);
    }
}

impl QueueController {
    /// 校验请求并生成新任务（尚未登记）
    fn build_task(&self, request: DownloadRequest) -> Result<DownloadTask, DownloadError> {
        if !self.accepting {
            return Err(DownloadError::invalid_request("下载器正在关闭"));
        }
        let url = validator::parse_download_url(&request.url)?;
        if let Some(checksum) = &request.expected_checksum {
            checksum.validate()?;
        }
        let filename = if request.filename.trim().is_empty() {
            filename_from_url(&url)
                .ok_or_else(|| DownloadError::invalid_request(format!("无法从URL推断文件名: {}", url)))?
        } else {
            request.filename.trim().to_string()
        };
        validator::validate_filename(&filename)?;
        let destination = match request.destination {
            Some(path) if path.as_os_str().is_empty() => {
                return Err(DownloadError::invalid_request("目标路径不能为空"));
            }
            Some(path) => path,
            None => self.config.destination_for(&request.source_id, &filename),
        };
        Ok(DownloadTask::new(
            request.source_id,
            filename,
            url.to_string(),
            destination,
            request.expected_size,
            request.expected_checksum,
        ))
    }

    /// 同一目标路径只对应一个任务；失败或取消的任务重新排队
    fn reuse_existing(&mut self, destination: &Path, ctx: &mut Context<Self>) -> Option<TaskId> {
        let (id, state) = self
            .tasks
            .values()
            .find(|t| t.destination_path == destination)
            .map(|t| (t.id, t.state))?;
        log::info!("目标 {} 已有任务 {} ({})", destination.display(), id, state);
        if state.can_retry() {
            if let Some(task) = self.tasks.get_mut(&id) {
                task.retry_count = 0;
                task.last_error = None;
            }
            self.requeue(id, None, None);
            self.admit(ctx);
        }
        Some(id)
    }

    fn insert_task(&mut self, mut task: DownloadTask, existing_len: Option<u64>, ctx: &mut Context<Self>) -> Result<TaskId, DownloadError> {
        if !self.accepting {
            return Err(DownloadError::invalid_request("下载器正在关闭"));
        }
        // 等待文件信息期间可能已有同一目标的任务登记
        if let Some(id) = self.reuse_existing(&task.destination_path, ctx) {
            return Ok(id);
        }
        // 接管已经存在的文件
        if let Some(len) = existing_len {
            match task.expected_size_bytes {
                Some(expected) if len > expected => {
                    log::warn!("已存在的文件 {} 大于预期大小, 将重新下载", task.destination_path.display());
                }
                _ => {
                    log::info!("接管已存在的文件 {} ({} 字节)", task.destination_path.display(), len);
                    task.set_bytes_downloaded(len);
                }
            }
        }

        let id = task.id;
        log::info!("添加任务 {}: {} -> {}", id, task.source_url, task.destination_path.display());
        self.store.do_send(SaveTask(task.clone()));
        self.notifier.emit(DownloadEvent::TaskAdded { task: task.clone() });
        self.tasks.insert(id, task);
        self.admit(ctx);
        Ok(id)
    }
}

impl Handler<Enqueue> for QueueController {
    type Result = ResponseActFuture<Self, Result<TaskId, DownloadError>>;

    fn handle(&mut self, msg: Enqueue, ctx: &mut Self::Context) -> Self::Result {
        let task = match self.build_task(msg.0) {
            Ok(task) => task,
            Err(e) => return Box::pin(actix::fut::ready(Err(e))),
        };
        if let Some(id) = self.reuse_existing(&task.destination_path, ctx) {
            return Box::pin(actix::fut::ready(Ok(id)));
        }

        // 文件信息在邮箱之外读取
        let path = task.destination_path.clone();
        Box::pin(
            async move {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => Some(meta.len()),
                    _ => None,
                }
            }
            .into_actor(self)
            .map(move |existing_len, act, ctx| act.insert_task(task, existing_len, ctx)),
        )
    }
}

impl Handler<Pause> for QueueController {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: Pause, ctx: &mut Self::Context) -> Self::Result {
        let id = msg.0;
        let state = self.task(id)?.state;
        if !state.can_pause() {
            return Err(DownloadError::InvalidTransition { id, from: state, action: "pause" });
        }
        if let Some(lease) = self.leases.get(&id) {
            lease.token.cancel();
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.retry_at = None;
        }
        self.transition(id, TaskState::Paused, None);
        self.admit(ctx);
        Ok(())
    }
}

impl Handler<Resume> for QueueController {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: Resume, ctx: &mut Self::Context) -> Self::Result {
        let id = msg.0;
        let state = self.task(id)?.state;
        if !state.can_resume() {
            return Err(DownloadError::InvalidTransition { id, from: state, action: "resume" });
        }
        self.requeue(id, None, None);
        self.admit(ctx);
        Ok(())
    }
}

impl Handler<Cancel> for QueueController {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: Cancel, ctx: &mut Self::Context) -> Self::Result {
        let id = msg.id;
        let state = self.task(id)?.state;
        if !state.can_cancel() {
            return Err(DownloadError::InvalidTransition { id, from: state, action: "cancel" });
        }
        let running = match self.leases.get(&id) {
            Some(lease) => {
                lease.token.cancel();
                true
            }
            None => false,
        };
        if let Some(task) = self.tasks.get_mut(&id) {
            task.retry_at = None;
        }
        self.transition(id, TaskState::Cancelled, None);
        if msg.delete_partial {
            if running {
                self.discard_on_exit.insert(id);
            } else {
                self.start_discard(id, ctx);
            }
        }
        self.admit(ctx);
        Ok(())
    }
}

impl Handler<Retry> for QueueController {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: Retry, ctx: &mut Self::Context) -> Self::Result {
        let id = msg.0;
        let state = self.task(id)?.state;
        if !state.can_retry() {
            return Err(DownloadError::InvalidTransition { id, from: state, action: "retry" });
        }
        if let Some(task) = self.tasks.get_mut(&id) {
            task.retry_count = 0;
            task.last_error = None;
        }
        self.requeue(id, None, None);
        self.admit(ctx);
        Ok(())
    }
}

impl Handler<SetConcurrency> for QueueController {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: SetConcurrency, ctx: &mut Self::Context) -> Self::Result {
        if msg.0 == 0 {
            return Err(DownloadError::invalid_request("并发下载数必须大于0"));
        }
        log::info!("并发上限 {} -> {}", self.max_concurrent, msg.0);
        // 调低时不打断正在运行的任务，等它们自然结束
        self.max_concurrent = msg.0;
        self.admit(ctx);
        Ok(())
    }
}

impl Handler<ListTasks> for QueueController {
    type Result = MessageResult<ListTasks>;

    fn handle(&mut self, _msg: ListTasks, _ctx: &mut Self::Context) -> Self::Result {
        let mut tasks: Vec<DownloadTask> = self.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.id));
        MessageResult(tasks)
    }
}

impl Handler<GetTask> for QueueController {
    type Result = Option<DownloadTask>;

    fn handle(&mut self, msg: GetTask, _ctx: &mut Self::Context) -> Self::Result {
        self.tasks.get(&msg.0).cloned()
    }
}

impl Handler<Purge> for QueueController {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: Purge, _ctx: &mut Self::Context) -> Self::Result {
        let id = msg.0;
        let state = self.task(id)?.state;
        if !state.is_terminal() {
            return Err(DownloadError::InvalidTransition { id, from: state, action: "purge" });
        }
        self.remove_record(id);
        Ok(())
    }
}

impl Handler<PurgeFinished> for QueueController {
    type Result = usize;

    fn handle(&mut self, _msg: PurgeFinished, _ctx: &mut Self::Context) -> Self::Result {
        let finished: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state.is_terminal())
            .map(|t| t.id)
            .collect();
        for id in &finished {
            self.remove_record(*id);
        }
        finished.len()
    }
}

impl Handler<Subscribe> for QueueController {
    type Result = MessageResult<Subscribe>;

    fn handle(&mut self, _msg: Subscribe, _ctx: &mut Self::Context) -> Self::Result {
        MessageResult(self.notifier.subscribe())
    }
}

impl Handler<Shutdown> for QueueController {
    type Result = ResponseFuture<()>;

    fn handle(&mut self, _msg: Shutdown, ctx: &mut Self::Context) -> Self::Result {
        log::info!("停止调度, 等待 {} 个后台任务退出", self.leases.len());
        self.accepting = false;
        if let Some(handle) = self.retry_timer.take() {
            ctx.cancel_future(handle);
        }
        for lease in self.leases.values() {
            lease.token.cancel();
        }
        let running: Vec<TaskId> = self
            .tasks
            .values()
            .filter(|t| t.state.holds_slot())
            .map(|t| t.id)
            .collect();
        // 保留原来的排队时间，重启后按原顺序继续
        for id in running {
            self.transition(id, TaskState::Queued, None);
        }

        let (tx, rx) = oneshot::channel();
        if self.leases.is_empty() {
            let _ = tx.send(());
        } else {
            self.idle_waiters.push(tx);
        }
        let store = self.store.clone();
        Box::pin(async move {
            if tokio::time::timeout(SHUTDOWN_GRACE, rx).await.is_err() {
                log::warn!("等待后台任务退出超时");
            }
            if let Err(e) = store.send(Barrier).await {
                log::error!("提交任务记录失败: {}", e);
            }
        })
    }
}

impl Handler<WorkerReport> for QueueController {
    type Result = ();

    fn handle(&mut self, report: WorkerReport, ctx: &mut Self::Context) {
        let id = report.id;
        let current = self.leases.get(&id).map(|l| l.lease) == Some(report.lease);
        if !current {
            // 过期 worker 退出时的偏移仍然有效，前提是没有新的 worker 在写同一个文件
            if let ReportKind::Finished { bytes_downloaded, total_bytes, .. } = report.kind {
                if !self.leases.contains_key(&id) {
                    log::debug!("记录过期 worker 的最终偏移: 任务 {} lease {} -> {}", id, report.lease, bytes_downloaded);
                    self.record_offset(id, bytes_downloaded, total_bytes);
                    return;
                }
            }
            log::debug!("忽略过期的上报: 任务 {} lease {}", id, report.lease);
            return;
        }

        match report.kind {
            ReportKind::Progress { bytes_downloaded, total_bytes, speed_bps, eta_seconds } => {
                self.on_progress(id, bytes_downloaded, total_bytes, speed_bps, eta_seconds);
                return;
            }
            ReportKind::Checkpoint { bytes_downloaded, total_bytes } => {
                self.record_offset(id, bytes_downloaded, total_bytes);
                return;
            }
            ReportKind::Finished { bytes_downloaded, total_bytes, outcome } => {
                self.on_finished(id, bytes_downloaded, total_bytes, outcome, ctx);
            }
            ReportKind::Verified { result } => self.on_verified(id, result),
            ReportKind::Discarded => self.on_discarded(id),
        }
        self.admit(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.download_dir = dir.join("models").to_string_lossy().to_string();
        config.state_dir = dir.join("state").to_string_lossy().to_string();
        config.max_concurrent_downloads = 1;
        config
    }

    #[actix_rt::test]
    async fn test_enqueue_rejects_invalid_requests() {
        let dir = tempfile::tempdir().unwrap();
        let addr = QueueController::new(test_config(dir.path())).unwrap().start();

        let bad_url = addr.send(Enqueue(crate::core::task::DownloadRequest::new("not a url"))).await.unwrap();
        assert!(matches!(bad_url, Err(DownloadError::InvalidRequest(_))));

        let no_name = addr.send(Enqueue(crate::core::task::DownloadRequest::new("http://127.0.0.1:1/"))).await.unwrap();
        assert!(matches!(no_name, Err(DownloadError::InvalidRequest(_))));

        let empty_dest = addr
            .send(Enqueue(crate::core::task::DownloadRequest::new("http://127.0.0.1:1/a.bin").destination("")))
            .await
            .unwrap();
        assert!(matches!(empty_dest, Err(DownloadError::InvalidRequest(_))));

        assert!(addr.send(ListTasks).await.unwrap().is_empty());
    }

    #[actix_rt::test]
    async fn test_unknown_task_and_invalid_transitions() {
        let dir = tempfile::tempdir().unwrap();
        let addr = QueueController::new(test_config(dir.path())).unwrap().start();

        let missing = uuid::Uuid::new_v4();
        assert!(matches!(addr.send(Pause(missing)).await.unwrap(), Err(DownloadError::TaskNotFound(_))));
        assert!(addr.send(GetTask(missing)).await.unwrap().is_none());

        // 端口 1 上没有服务，任务会因连接失败进入退避，保持 Queued 或 Active
        let id = addr
            .send(Enqueue(crate::core::task::DownloadRequest::new("http://127.0.0.1:1/a.bin").source("org/m", "a.bin")))
            .await
            .unwrap()
            .unwrap();
        let resume = addr.send(Resume(id)).await.unwrap();
        assert!(matches!(resume, Err(DownloadError::InvalidTransition { action: "resume", .. })));
        let retry = addr.send(Retry(id)).await.unwrap();
        assert!(matches!(retry, Err(DownloadError::InvalidTransition { action: "retry", .. })));
        assert!(matches!(addr.send(Purge(id)).await.unwrap(), Err(DownloadError::InvalidTransition { .. })));

        addr.send(Pause(id)).await.unwrap().unwrap();
        let again = addr.send(Pause(id)).await.unwrap();
        assert!(matches!(again, Err(DownloadError::InvalidTransition { from: TaskState::Paused, .. })));
        assert!(matches!(addr.send(SetConcurrency(0)).await.unwrap(), Err(DownloadError::InvalidRequest(_))));

        addr.send(Shutdown).await.unwrap();
    }

    #[actix_rt::test]
    async fn test_enqueue_derives_destination_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let expected = config.destination_for("org/model", "w.bin");
        let addr = QueueController::new(config).unwrap().start();

        let request = crate::core::task::DownloadRequest::new("http://127.0.0.1:1/files/w.bin").source("org/model", "");
        let first = addr.send(Enqueue(request.clone())).await.unwrap().unwrap();
        let second = addr.send(Enqueue(request)).await.unwrap().unwrap();
        assert_eq!(first, second);

        let task = addr.send(GetTask(first)).await.unwrap().unwrap();
        assert_eq!(task.destination_path, expected);
        assert_eq!(task.filename, "w.bin");
        assert_eq!(addr.send(ListTasks).await.unwrap().len(), 1);

        addr.send(Shutdown).await.unwrap();
    }

    #[actix_rt::test]
    async fn test_concurrent_enqueue_of_same_destination() {
        let dir = tempfile::tempdir().unwrap();
        let addr = QueueController::new(test_config(dir.path())).unwrap().start();

        let request = DownloadRequest::new("http://127.0.0.1:1/same.bin").destination(dir.path().join("same.bin"));
        let (first, second) = futures::join!(addr.send(Enqueue(request.clone())), addr.send(Enqueue(request)));
        assert_eq!(first.unwrap().unwrap(), second.unwrap().unwrap());
        assert_eq!(addr.send(ListTasks).await.unwrap().len(), 1);

        addr.send(Shutdown).await.unwrap();
    }

    #[actix_rt::test]
    async fn test_stale_finished_report_records_offset() {
        let dir = tempfile::tempdir().unwrap();
        let destination = dir.path().join("stale.bin");
        std::fs::write(&destination, vec![7u8; 100]).unwrap();
        let addr = QueueController::new(test_config(dir.path())).unwrap().start();

        let id = addr
            .send(Enqueue(DownloadRequest::new("http://127.0.0.1:1/stale.bin").destination(&destination)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(addr.send(GetTask(id)).await.unwrap().unwrap().bytes_downloaded, 100);
        addr.send(Pause(id)).await.unwrap().unwrap();
        // 等 worker 退出、释放 lease
        tokio::time::sleep(Duration::from_millis(500)).await;

        addr.send(WorkerReport {
            id,
            lease: u64::MAX,
            kind: ReportKind::Progress { bytes_downloaded: 90, total_bytes: None, speed_bps: 1.0, eta_seconds: None },
        })
        .await
        .unwrap();
        addr.send(WorkerReport {
            id,
            lease: u64::MAX,
            kind: ReportKind::Finished { bytes_downloaded: 60, total_bytes: None, outcome: TransferOutcome::Interrupted },
        })
        .await
        .unwrap();

        let task = addr.send(GetTask(id)).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Paused);
        assert_eq!(task.bytes_downloaded, 60);
        assert_eq!(task.speed_bps, 0.0);

        addr.send(Shutdown).await.unwrap();
    }
}
