use url::Url;
use crate::core::error::DownloadError;

/// 只接受 http / https 的绝对地址
pub fn parse_download_url(url: &str) -> Result<Url, DownloadError> {
    let parsed = Url::parse(url.trim())
        .map_err(|e| DownloadError::invalid_request(format!("无效的URL {}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Ok(parsed),
        "http" | "https" => Err(DownloadError::invalid_request(format!("URL 缺少主机名: {}", url))),
        other => Err(DownloadError::invalid_request(format!("不支持的协议 {}: {}", other, url))),
    }
}

pub fn is_valid_url(url: &str) -> bool {
    parse_download_url(url).is_ok()
}

/// 文件名不能为空，也不能跳出目标目录
pub fn validate_filename(filename: &str) -> Result<(), DownloadError> {
    let name = filename.trim();
    if name.is_empty() {
        return Err(DownloadError::invalid_request("文件名不能为空"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\\') {
        return Err(DownloadError::invalid_request(format!("非法的文件名: {}", filename)));
    }
    Ok(())
}

pub fn validate_urls(urls: &[String]) -> Result<(), DownloadError> {
    if urls.is_empty() {
        return Err(DownloadError::invalid_request("URL列表不能为空"));
    }
    for url in urls {
        parse_download_url(url)?;
    }
    Ok(())
}
