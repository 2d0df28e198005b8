use chrono::Local; // 用于获取本地时间
use log::{Level, LevelFilter, Log, Metadata, Record};
use std::io::{Write, BufWriter};
use std::fs::{File, OpenOptions};
use std::path::Path;
use actix::prelude::*;

/// 日志消息
pub struct LogMsg {
    pub level: Level,
    pub target: String,
    pub message: String,
}
impl Message for LogMsg { type Result = (); }

/// 把缓冲区写入磁盘
pub struct Flush;
impl Message for Flush { type Result = (); }

/// 会话日志 Actor：写入文件，超过大小后轮转为 `.backup`
pub struct LoggerActor {
    pub writer: BufWriter<File>,
    pub level: LevelFilter,
    pub file_path: String,
    pub max_size: u64, // 最大文件大小 (bytes)
    pub current_size: u64,
}

impl LoggerActor {
    /// 创建新的日志Actor
    pub fn new(file_path: &str, level: LevelFilter, max_size: u64) -> Result<Self, std::io::Error> {
        // 确保日志目录存在
        if let Some(parent) = Path::new(file_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            writer: BufWriter::new(file),
            level,
            file_path: file_path.to_string(),
            max_size,
            current_size,
        })
    }

    /// 检查并执行日志轮转
    fn check_rotation(&mut self) -> Result<(), std::io::Error> {
        if self.current_size > self.max_size {
            self.writer.flush()?;

            let backup_path = format!("{}.backup", self.file_path);
            if Path::new(&backup_path).exists() {
                std::fs::remove_file(&backup_path)?;
            }
            std::fs::rename(&self.file_path, &backup_path)?;

            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;

            self.writer = BufWriter::new(file);
            self.current_size = 0;
        }
        Ok(())
    }

    fn write_log(&mut self, level: Level, target: &str, message: &str) -> Result<(), std::io::Error> {
        if level <= self.level {
            let log_entry = format!(
                "{} [{}] {} - {}\n",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level,
                target,
                message
            );

            self.check_rotation()?;

            self.writer.write_all(log_entry.as_bytes())?;
            self.current_size += log_entry.len() as u64;

            // 错误日志立即落盘
            if level <= Level::Warn || self.current_size % 1024 < log_entry.len() as u64 {
                self.writer.flush()?;
            }
        }
        Ok(())
    }
}

impl Actor for LoggerActor {
    type Context = Context<Self>;

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        let _ = self.writer.flush();
    }
}

impl Handler<LogMsg> for LoggerActor {
    type Result = ();
    fn handle(&mut self, msg: LogMsg, _ctx: &mut Self::Context) {
        if let Err(e) = self.write_log(msg.level, &msg.target, &msg.message) {
            eprintln!("日志写入失败: {}", e);
        }
    }
}

impl Handler<Flush> for LoggerActor {
    type Result = ();
    fn handle(&mut self, _msg: Flush, _ctx: &mut Self::Context) {
        if let Err(e) = self.writer.flush() {
            eprintln!("日志刷新失败: {}", e);
        }
    }
}

// 便捷的日志方法 - 为Addr<LoggerActor>提供扩展方法
pub trait LoggerExt {
    fn info(&self, message: &str);
    fn error(&self, message: &str);
    fn warn(&self, message: &str);
    fn debug(&self, message: &str);
}

impl LoggerExt for Addr<LoggerActor> {
    fn info(&self, message: &str) {
        send(self, Level::Info, message);
    }

    fn error(&self, message: &str) {
        send(self, Level::Error, message);
    }

    fn warn(&self, message: &str) {
        send(self, Level::Warn, message);
    }

    fn debug(&self, message: &str) {
        send(self, Level::Debug, message);
    }
}

fn send(addr: &Addr<LoggerActor>, level: Level, message: &str) {
    addr.do_send(LogMsg {
        level,
        target: "session".to_string(),
        message: message.to_string(),
    });
}

/// `log` 门面的实现：终端输出交给 env_logger（默认只显示 warn 以上，
/// 避免打乱进度条），同时把记录转发给会话日志文件
pub struct SessionLogger {
    console: env_logger::Logger,
    file: Addr<LoggerActor>,
    file_level: LevelFilter,
}

impl SessionLogger {
    /// 安装为全局 logger；需要在 actix System 中调用
    pub fn init(log_file: &str, file_level: LevelFilter) -> Result<Addr<LoggerActor>, std::io::Error> {
        let file = LoggerActor::new(log_file, file_level, 10 * 1024 * 1024)?.start();
        let console = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).build();
        let max_level = console.filter().max(file_level);
        let logger = SessionLogger { console, file: file.clone(), file_level };
        if log::set_boxed_logger(Box::new(logger)).is_ok() {
            log::set_max_level(max_level);
        }
        Ok(file)
    }
}

impl Log for SessionLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.file_level || self.console.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if self.console.matches(record) {
            self.console.log(record);
        }
        if record.level() <= self.file_level {
            self.file.do_send(LogMsg {
                level: record.level(),
                target: record.target().to_string(),
                message: record.args().to_string(),
            });
        }
    }

    fn flush(&self) {
        self.console.flush();
        self.file.do_send(Flush);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_logger_writes_and_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("session.log");
        let path = path.to_str().unwrap().to_string();

        let addr = LoggerActor::new(&path, LevelFilter::Info, 64).unwrap().start();
        addr.info("第一条日志");
        addr.debug("不会写入");
        addr.warn("第二条日志, 足够长以触发轮转 ..............................");
        addr.info("第三条日志");
        addr.send(Flush).await.unwrap();

        let current = std::fs::read_to_string(&path).unwrap();
        let backup = std::fs::read_to_string(format!("{}.backup", path)).unwrap();
        assert!(backup.contains("第一条日志"));
        assert!(!backup.contains("不会写入"));
        assert!(current.contains("第三条日志"));
    }
}
