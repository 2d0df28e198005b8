use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::core::error::DownloadError;
use crate::core::task::{RetryStrategy, util::sanitize_source_id};

/// 配置结构体
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// 默认下载目录
    pub download_dir: String,
    /// 任务记录目录
    pub state_dir: String,
    /// 最大并发下载数
    pub max_concurrent_downloads: usize,
    /// 每次写盘的块大小（字节）
    pub chunk_size: usize,
    /// 每写入多少块持久化一次偏移
    pub persist_every_chunks: u32,
    /// 最长多久持久化一次偏移（毫秒）
    pub persist_interval_ms: u64,
    /// 进度事件的最小间隔（毫秒）
    pub progress_interval_ms: u64,
    /// 测速滑动窗口（秒）
    pub speed_window_secs: u64,
    /// 连接超时（秒）
    pub connect_timeout: u64,
    /// 读取超时（秒），超过视为连接中断
    pub read_timeout: u64,
    /// User-Agent
    pub user_agent: String,
    /// 最大重定向次数
    pub max_redirects: u8,
    /// 自动重试次数上限
    pub retry_count: u32,
    /// 首次重试延迟（毫秒）
    pub retry_delay_ms: u64,
    /// 最大重试延迟（毫秒）
    pub retry_max_delay_ms: u64,
    /// 重试延迟抖动比例
    pub retry_jitter: f64,
    /// 启动时自动恢复暂停的任务
    pub auto_resume_on_startup: bool,
    /// 会话日志文件
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download_dir: "./models".to_string(),
            state_dir: "./.modeldown".to_string(),
            max_concurrent_downloads: 3,
            chunk_size: 256 * 1024,
            persist_every_chunks: 64,
            persist_interval_ms: 2000,
            progress_interval_ms: 250,
            speed_window_secs: 5,
            connect_timeout: 30,
            read_timeout: 60,
            user_agent: concat!("modeldown/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 10,
            retry_count: 3,
            retry_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            retry_jitter: 0.1,
            auto_resume_on_startup: true,
            log_file: "./.modeldown/modeldown.log".to_string(),
        }
    }
}

impl Config {
    /// 加载配置文件，不存在或格式错误时写入默认配置
    pub fn load(path: &str) -> Result<Self, DownloadError> {
        if Path::new(path).exists() {
            let content = fs::read_to_string(path)?;
            match toml::from_str(&content) {
                Ok(config) => Ok(config),
                Err(e) => {
                    log::warn!("配置文件格式错误: {}，将使用默认配置", e);
                    let config = Config::default();
                    config.save_with_tutorial(path)?;
                    Ok(config)
                }
            }
        } else {
            let config = Config::default();
            config.save_with_tutorial(path)?;
            Ok(config)
        }
    }

    /// 保存带说明的配置文件
    pub fn save_with_tutorial(&self, path: &str) -> Result<(), DownloadError> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent)?;
        }
        let config_content = toml::to_string_pretty(self)
            .map_err(|e| DownloadError::invalid_request(format!("无法序列化配置: {}", e)))?;
        let full_content = format!("{}\n{}", Config::tutorial_header(), config_content);
        fs::write(path, full_content)?;
        Ok(())
    }

    fn tutorial_header() -> &'static str {
        r#"# modeldown 配置文件
# ====================
#
# TOML 格式。命令行参数会覆盖这里的设置：命令行 > 配置文件 > 默认值
#
# download_dir             未指定目标路径时的下载目录，文件保存在 <download_dir>/<来源>/<文件名>
# state_dir                任务记录目录，重启后从这里恢复未完成的任务
# max_concurrent_downloads 同时进行的下载数
# chunk_size               每次写盘的块大小（字节），暂停/取消在块边界生效
# persist_every_chunks     每写入 N 块持久化一次偏移
# persist_interval_ms      或每隔 T 毫秒持久化一次，先到者为准；崩溃最多重下一个间隔的数据
# connect_timeout          连接超时（秒）
# read_timeout             读取超时（秒），超过视为暂时性网络错误
# retry_count              暂时性错误（超时、连接重置、5xx、429）的自动重试次数
# retry_delay_ms           首次重试延迟，之后每次翻倍
# retry_max_delay_ms       重试延迟上限
# auto_resume_on_startup   启动时是否把暂停的任务也重新排队
"#
    }

    /// 校验配置合法性
    pub fn validate(&self) -> Result<(), DownloadError> {
        if self.max_concurrent_downloads == 0 {
            return Err(DownloadError::invalid_request("并发下载数必须大于0"));
        }
        if self.chunk_size == 0 {
            return Err(DownloadError::invalid_request("分块大小必须大于0"));
        }
        if self.persist_every_chunks == 0 {
            return Err(DownloadError::invalid_request("持久化间隔块数必须大于0"));
        }
        if self.connect_timeout == 0 || self.read_timeout == 0 {
            return Err(DownloadError::invalid_request("超时时间必须大于0"));
        }
        if self.download_dir.is_empty() {
            return Err(DownloadError::invalid_request("下载目录不能为空"));
        }
        if self.state_dir.is_empty() {
            return Err(DownloadError::invalid_request("任务记录目录不能为空"));
        }
        if !(0.0..=1.0).contains(&self.retry_jitter) {
            return Err(DownloadError::invalid_request("重试抖动比例必须在 0 到 1 之间"));
        }
        Ok(())
    }

    /// 合并命令行参数到配置
    pub fn merge_from_args(&mut self, args: &crate::cli::Args) {
        if let Some(dir) = &args.download_dir {
            self.download_dir = dir.clone();
        }
        if let Some(n) = args.concurrency {
            self.max_concurrent_downloads = n;
        }
        if let Some(dir) = &args.state_dir {
            self.state_dir = dir.clone();
        }
    }

    pub fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy {
            max_retries: self.retry_count,
            base_delay: Duration::from_millis(self.retry_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            backoff_multiplier: 2.0,
            jitter_factor: self.retry_jitter,
        }
    }

    /// 未显式指定目标路径时的保存位置
    pub fn destination_for(&self, source_id: &str, filename: &str) -> PathBuf {
        let base = PathBuf::from(&self.download_dir);
        let source = sanitize_source_id(source_id);
        if source.is_empty() {
            base.join(filename)
        } else {
            base.join(source).join(filename)
        }
    }

    /// 获取配置摘要信息
    pub fn get_summary(&self) -> String {
        format!(
            "配置摘要:\n\
            - 下载目录: {}\n\
            - 任务记录: {}\n\
            - 并发数: {}\n\
            - 块大小: {} 字节\n\
            - 持久化间隔: {} 块 / {} 毫秒\n\
            - 重试次数: {}\n\
            - 启动恢复: {}",
            self.download_dir,
            self.state_dir,
            self.max_concurrent_downloads,
            self.chunk_size,
            self.persist_every_chunks,
            self.persist_interval_ms,
            self.retry_count,
            if self.auto_resume_on_startup { "启用" } else { "禁用" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.max_concurrent_downloads, 3);
        assert_eq!(config.retry_count, 3);
        assert!(config.auto_resume_on_startup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.max_concurrent_downloads = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.chunk_size = 0;
        assert!(config.validate().is_err());

        config = Config::default();
        config.retry_jitter = 2.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modeldown.conf");
        let path = path.to_str().unwrap();

        let mut config = Config::default();
        config.max_concurrent_downloads = 5;
        config.save_with_tutorial(path).expect("保存配置失败");

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("modeldown 配置文件"));

        let loaded = Config::load(path).expect("加载配置失败");
        assert_eq!(loaded.max_concurrent_downloads, 5);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("partial.conf");
        fs::write(&path, "max_concurrent_downloads = 7\n").unwrap();
        let loaded = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.max_concurrent_downloads, 7);
        assert_eq!(loaded.chunk_size, Config::default().chunk_size);
    }

    #[test]
    fn test_malformed_file_replaced_by_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.conf");
        fs::write(&path, "max_concurrent_downloads = \"many\"").unwrap();
        let loaded = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.max_concurrent_downloads, 3);
    }

    #[test]
    fn test_destination_for() {
        let mut config = Config::default();
        config.download_dir = "/data/models".to_string();
        assert_eq!(
            config.destination_for("TheBloke/Llama-2-7B-GGUF", "llama.gguf"),
            PathBuf::from("/data/models/TheBloke_Llama-2-7B-GGUF/llama.gguf")
        );
        assert_eq!(config.destination_for("", "a.bin"), PathBuf::from("/data/models/a.bin"));
    }

    #[test]
    fn test_retry_strategy_from_config() {
        let mut config = Config::default();
        config.retry_count = 5;
        config.retry_delay_ms = 10;
        let strategy = config.retry_strategy();
        assert_eq!(strategy.max_retries, 5);
        assert_eq!(strategy.base_delay, Duration::from_millis(10));
    }
}
