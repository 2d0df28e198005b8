//! modeldown: 可断点续传的并发模型文件下载器

pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
pub mod utils;
