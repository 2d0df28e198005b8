//! 任务记录持久化
//!
//! 每个任务一个 JSON 文件：`<state_dir>/tasks/<id>.json`。写入先落到
//! `<id>.json.tmp`，`sync_all` 之后再原子 rename，中断的写入不会留下
//! 半截记录。

use actix::prelude::*;
use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::error::DownloadError;
use crate::core::task::{DownloadTask, TaskId, TaskState};

const RECORD_EXT: &str = "json";
const TMP_EXT: &str = "tmp";

/// 基于目录的任务存储
#[derive(Debug, Clone)]
pub struct JsonTaskStore {
    dir: PathBuf,
}

impl JsonTaskStore {
    pub fn open(state_dir: impl AsRef<Path>) -> Result<Self, DownloadError> {
        let dir = state_dir.as_ref().join("tasks");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{}.{}", id, RECORD_EXT))
    }

    pub fn save(&self, task: &DownloadTask) -> Result<(), DownloadError> {
        let json = serde_json::to_vec_pretty(task)
            .map_err(|e| DownloadError::Store(format!("序列化失败: {}", e)))?;
        let path = self.record_path(task.id);
        let tmp = path.with_extension(format!("{}.{}", RECORD_EXT, TMP_EXT));

        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        sync_dir(&self.dir);
        Ok(())
    }

    /// 读取全部记录；损坏的记录跳过并告警，残留的临时文件直接清理
    pub fn load_all(&self) -> Result<Vec<DownloadTask>, DownloadError> {
        let mut tasks = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(RECORD_EXT) => {}
                Some(TMP_EXT) => {
                    log::warn!("清理未完成的记录写入: {}", path.display());
                    let _ = fs::remove_file(&path);
                    continue;
                }
                _ => continue,
            }
            let data = fs::read(&path)?;
            match serde_json::from_slice::<DownloadTask>(&data) {
                Ok(task) => tasks.push(task),
                Err(e) => log::warn!("跳过无法解析的任务记录 {}: {}", path.display(), e),
            }
        }
        tasks.sort_by_key(|t| t.created_at);
        Ok(tasks)
    }

    pub fn delete(&self, id: TaskId) -> Result<(), DownloadError> {
        match fs::remove_file(self.record_path(id)) {
            Ok(()) => {
                sync_dir(&self.dir);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// 进程启动时整理记录：没有 worker 持有的任务一律回到 Queued，
/// 偏移量不超过磁盘上的实际文件长度
pub fn recover_tasks(tasks: Vec<DownloadTask>, auto_resume: bool) -> Vec<DownloadTask> {
    tasks
        .into_iter()
        .map(|mut task| {
            let requeue = match task.state {
                TaskState::Active | TaskState::Verifying | TaskState::Queued => true,
                TaskState::Paused => auto_resume,
                _ => false,
            };
            if requeue {
                if task.state != TaskState::Queued {
                    log::info!("恢复任务 {} ({} -> queued), 偏移 {}", task.id, task.state, task.bytes_downloaded);
                }
                task.state = TaskState::Queued;
            }
            if !task.state.is_terminal() {
                let on_disk = fs::metadata(&task.destination_path).map(|m| m.len()).unwrap_or(0);
                if on_disk < task.bytes_downloaded {
                    log::warn!("任务 {} 的记录偏移 {} 超过文件长度 {}, 已回退", task.id, task.bytes_downloaded, on_disk);
                    task.bytes_downloaded = on_disk;
                    task.updated_at = Utc::now();
                }
            }
            task.bytes_received = task.bytes_downloaded;
            task
        })
        .collect()
}

// ================== 存储 Actor ==================

/// 持久化记录的唯一写入者，运行在独立的 SyncArbiter 线程上
pub struct StoreActor {
    store: JsonTaskStore,
}

impl StoreActor {
    pub fn new(store: JsonTaskStore) -> Self {
        Self { store }
    }

    pub fn start(store: JsonTaskStore) -> Addr<StoreActor> {
        SyncArbiter::start(1, move || StoreActor::new(store.clone()))
    }
}

impl Actor for StoreActor {
    type Context = SyncContext<Self>;
}

/// 保存任务快照
pub struct SaveTask(pub DownloadTask);
impl Message for SaveTask { type Result = (); }
impl Handler<SaveTask> for StoreActor {
    type Result = ();
    fn handle(&mut self, msg: SaveTask, _ctx: &mut Self::Context) {
        if let Err(e) = self.store.save(&msg.0) {
            log::error!("保存任务 {} 失败: {}", msg.0.id, e);
        }
    }
}

/// 删除任务记录
pub struct DeleteTask(pub TaskId);
impl Message for DeleteTask { type Result = (); }
impl Handler<DeleteTask> for StoreActor {
    type Result = ();
    fn handle(&mut self, msg: DeleteTask, _ctx: &mut Self::Context) {
        if let Err(e) = self.store.delete(msg.0) {
            log::error!("删除任务记录 {} 失败: {}", msg.0, e);
        }
    }
}

/// 等待此前的写入全部提交
pub struct Barrier;
impl Message for Barrier { type Result = (); }
impl Handler<Barrier> for StoreActor {
    type Result = ();
    fn handle(&mut self, _msg: Barrier, _ctx: &mut Self::Context) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task_at(dest: PathBuf, state: TaskState, bytes: u64) -> DownloadTask {
        let mut task = DownloadTask::new(
            "org/model".to_string(),
            "model.bin".to_string(),
            "https://example.com/model.bin".to_string(),
            dest,
            Some(100),
            None,
        );
        task.state = state;
        task.bytes_downloaded = bytes;
        task
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::open(dir.path()).unwrap();
        let task = task_at(dir.path().join("a.bin"), TaskState::Paused, 10);

        store.save(&task).unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, task.id);
        assert_eq!(loaded[0].bytes_downloaded, 10);

        store.delete(task.id).unwrap();
        assert!(store.load_all().unwrap().is_empty());
        // 重复删除不报错
        store.delete(task.id).unwrap();
    }

    #[test]
    fn test_save_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::open(dir.path()).unwrap();
        let mut task = task_at(dir.path().join("a.bin"), TaskState::Active, 10);
        store.save(&task).unwrap();
        task.bytes_downloaded = 60;
        store.save(&task).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].bytes_downloaded, 60);
    }

    #[test]
    fn test_torn_writes_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonTaskStore::open(dir.path()).unwrap();
        let task = task_at(dir.path().join("a.bin"), TaskState::Queued, 0);
        store.save(&task).unwrap();

        // 模拟中断的写入：临时文件和截断的记录
        fs::write(store.dir().join("dead.json.tmp"), b"{\"id\":").unwrap();
        fs::write(store.dir().join("broken.json"), b"{\"id\":").unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(!store.dir().join("dead.json.tmp").exists());
    }

    #[test]
    fn test_recover_requeues_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let partial = dir.path().join("partial.bin");
        fs::write(&partial, vec![0u8; 40]).unwrap();

        let tasks = vec![
            task_at(partial.clone(), TaskState::Active, 70),
            task_at(dir.path().join("v.bin"), TaskState::Verifying, 0),
            task_at(dir.path().join("p.bin"), TaskState::Paused, 0),
            task_at(dir.path().join("done.bin"), TaskState::Completed, 100),
        ];

        let recovered = recover_tasks(tasks.clone(), true);
        assert_eq!(recovered[0].state, TaskState::Queued);
        assert_eq!(recovered[0].bytes_downloaded, 40);
        assert_eq!(recovered[1].state, TaskState::Queued);
        assert_eq!(recovered[2].state, TaskState::Queued);
        assert_eq!(recovered[3].state, TaskState::Completed);
        assert_eq!(recovered[3].bytes_downloaded, 100);

        assert_eq!(recovered[0].bytes_received, 40);

        // 关闭自动恢复只影响暂停的任务
        let kept_paused = recover_tasks(tasks, false);
        assert_eq!(kept_paused[0].state, TaskState::Queued);
        assert_eq!(kept_paused[1].state, TaskState::Queued);
        assert_eq!(kept_paused[2].state, TaskState::Paused);
    }
}
