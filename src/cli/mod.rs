//! CLI: 命令行参数解析
//!
//! ## 支持的命令
//!
//! - 下载：`modeldown <url>...`
//! - 批量下载：`modeldown -f models.txt`
//! - 编辑配置：`modeldown -e`
//! - 查看任务：`modeldown --list`
//! - 清理已结束的任务记录：`modeldown --purge-finished`
//!
//! URL 文件每行一个任务：`<url> [sha256:<hex>] [大小]`，`#` 开头的行为注释。
//!
//! ## 配置文件位置
//!
//! - Windows: `%APPDATA%/modeldown/modeldown.conf`
//! - macOS: `~/Library/Application Support/modeldown/modeldown.conf`
//! - Linux: `~/.config/modeldown/modeldown.conf`

use clap::Parser;
use std::env;
use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::core::error::DownloadError;
use crate::core::task::{Checksum, DownloadRequest};
use crate::utils::validator;

/// 获取平台默认配置文件路径
pub fn default_config_path() -> String {
    #[cfg(target_os = "windows")]
    {
        let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        format!("{}/modeldown/modeldown.conf", appdata)
    }
    #[cfg(target_os = "macos")]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/Library/Application Support/modeldown/modeldown.conf", home)
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{}/.config/modeldown/modeldown.conf", home)
    }
}

/// 打开配置文件编辑器
pub fn open_config_in_editor(config_path: &str) {
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("notepad").arg(config_path).status().ok();
    }
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg("-e").arg(config_path).status().ok();
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let editor = env::var("EDITOR").unwrap_or_else(|_| "nano".to_string());
        if std::process::Command::new(&editor).arg(config_path).status().is_err() {
            let _ = std::process::Command::new("xdg-open").arg(config_path).status();
        }
    }
}

/// modeldown 命令行参数
///
/// 示例用法：
///   modeldown https://example.com/org/model/resolve/main/model.safetensors
///   modeldown -j 2 -f models.txt
///   modeldown --checksum sha256:<hex> --source org/model <url>
#[derive(Parser, Debug, Clone)]
#[command(
    name = "modeldown",
    version = env!("CARGO_PKG_VERSION"),
    about = "可断点续传的并发模型文件下载器",
    long_about = "排队下载大文件，限制并发数，断点续传，下载完成后校验大小和 SHA-256。\n\n运行中按 p 暂停全部、r 恢复全部、c 取消全部、q 保存进度并退出。\n"
)]
pub struct Args {
    /// 要下载的URL列表
    #[arg(required = false, help = "要下载的URL列表，可以同时指定多个URL。")]
    pub urls: Vec<String>,

    /// URL 列表文件
    #[arg(short, long, help = "URL 列表文件，每行：<url> [sha256:<hex>] [大小]。")]
    pub file: Option<String>,

    /// 配置文件路径
    #[arg(short = 'c', long, default_value_t = default_config_path(), help = "配置文件路径，默认为平台推荐路径。")]
    pub config: String,

    #[arg(short = 'e', long = "edit", help = "用系统编辑器打开配置文件并退出。")]
    pub edit_config: bool,

    #[arg(long, short = 'd', help = "下载目录，覆盖配置文件中的设置。")]
    pub download_dir: Option<String>,

    #[arg(long, help = "任务记录目录，覆盖配置文件中的设置。")]
    pub state_dir: Option<String>,

    #[arg(long, short = 'j', help = "最大并发下载数，覆盖配置文件中的设置。")]
    pub concurrency: Option<usize>,

    #[arg(long, help = "期望的校验值（sha256:<hex>），只能和单个URL一起使用。")]
    pub checksum: Option<String>,

    #[arg(long, short = 's', help = "来源标识（如 org/model），决定保存的子目录。")]
    pub source: Option<String>,

    #[arg(long, help = "列出已记录的任务并退出。")]
    pub list: bool,

    #[arg(long, help = "删除已结束（完成、失败、取消）的任务记录并退出。")]
    pub purge_finished: bool,
}

impl Args {
    /// 解析命令行参数并加载配置
    pub fn parse_args() -> Result<(Self, Config), DownloadError> {
        let args = Args::parse();
        let config = args.load_config()?;

        if args.edit_config {
            open_config_in_editor(&args.config);
            std::process::exit(0);
        }
        Ok((args, config))
    }

    /// 加载配置文件（不存在时生成带说明的默认配置），再合并命令行参数
    pub fn load_config(&self) -> Result<Config, DownloadError> {
        let mut config = Config::load(&self.config)?;
        config.merge_from_args(self);
        config.validate()?;
        Ok(config)
    }

    /// 收集命令行和文件中的下载请求
    pub fn get_requests(&self) -> Result<Vec<DownloadRequest>, DownloadError> {
        let source = self.source.clone().unwrap_or_default();
        let mut requests = Vec::new();

        for url in &self.urls {
            validator::parse_download_url(url)?;
            requests.push(DownloadRequest::new(url.trim()).source(source.clone(), ""));
        }

        if let Some(checksum) = &self.checksum {
            if requests.len() != 1 {
                return Err(DownloadError::invalid_request("--checksum 只能和单个URL一起使用"));
            }
            let checksum: Checksum = checksum.parse()?;
            let request = requests.remove(0).checksum(checksum);
            requests.push(request);
        }

        if let Some(file_path) = &self.file {
            if !Path::new(file_path).exists() {
                return Err(DownloadError::invalid_request(format!("URL文件不存在: {}", file_path)));
            }
            let content = fs::read_to_string(file_path)?;
            for (index, line) in content.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let request = parse_request_line(line).map_err(|e| {
                    DownloadError::invalid_request(format!("{} 第 {} 行: {}", file_path, index + 1, e))
                })?;
                requests.push(request.source(source.clone(), ""));
            }
        }

        Ok(requests)
    }
}

/// 解析 `<url> [sha256:<hex>] [大小]`，后两项顺序不限
pub fn parse_request_line(line: &str) -> Result<DownloadRequest, DownloadError> {
    let mut parts = line.split_whitespace();
    let url = parts
        .next()
        .ok_or_else(|| DownloadError::invalid_request("空行"))?;
    validator::parse_download_url(url)?;

    let mut request = DownloadRequest::new(url);
    for part in parts {
        if let Ok(size) = part.parse::<u64>() {
            request = request.expected_size(size);
        } else {
            request = request.checksum(part.parse()?);
        }
    }
    Ok(request)
}
