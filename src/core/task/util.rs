use std::collections::VecDeque;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use regex::Regex;

/// 滑动窗口测速器
#[derive(Debug)]
pub struct SpeedMeter {
    window: Duration,
    samples: VecDeque<(Instant, u64)>,
    window_bytes: u64,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
            window_bytes: 0,
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    pub fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.window_bytes += bytes;
        while let Some(&(at, n)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
                self.window_bytes -= n;
            } else {
                break;
            }
        }
    }

    /// 当前速度（B/s），样本不足时为 0
    pub fn speed_at(&self, now: Instant) -> f64 {
        let Some(&(first, _)) = self.samples.front() else {
            return 0.0;
        };
        let elapsed = now.duration_since(first).as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.window_bytes as f64 / elapsed
    }

    pub fn speed(&self) -> f64 {
        self.speed_at(Instant::now())
    }
}

/// ETA = 剩余字节 / 速度
pub fn estimate_eta(expected: Option<u64>, downloaded: u64, speed_bps: f64) -> Option<f64> {
    let total = expected?;
    if speed_bps <= 0.0 {
        return None;
    }
    Some(total.saturating_sub(downloaded) as f64 / speed_bps)
}

/// 解析 `Content-Range: bytes start-end/total`，total 可能为 `*`
pub fn parse_content_range(value: &str) -> Option<(u64, u64, Option<u64>)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^\s*bytes\s+(\d+)-(\d+)/(\d+|\*)\s*$").expect("content-range 正则无效")
    });
    let caps = re.captures(value)?;
    let start = caps[1].parse().ok()?;
    let end = caps[2].parse().ok()?;
    let total = match &caps[3] {
        "*" => None,
        n => Some(n.parse().ok()?),
    };
    Some((start, end, total))
}

/// 来源标识中的路径分隔符替换为下划线
pub fn sanitize_source_id(source_id: &str) -> String {
    source_id
        .trim()
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

/// 从URL路径中提取文件名
pub fn filename_from_url(url: &url::Url) -> Option<String> {
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_meter_window() {
        let mut meter = SpeedMeter::new(Duration::from_secs(2));
        let t0 = Instant::now();
        meter.record_at(t0, 1000);
        meter.record_at(t0 + Duration::from_secs(1), 1000);
        let speed = meter.speed_at(t0 + Duration::from_secs(1));
        assert!((speed - 2000.0).abs() < 1.0);

        // 超出窗口的样本被丢弃
        meter.record_at(t0 + Duration::from_secs(5), 500);
        assert_eq!(meter.samples.len(), 1);
        assert_eq!(meter.window_bytes, 500);
    }

    #[test]
    fn test_speed_meter_empty() {
        let meter = SpeedMeter::new(Duration::from_secs(1));
        assert_eq!(meter.speed(), 0.0);
    }

    #[test]
    fn test_estimate_eta() {
        assert_eq!(estimate_eta(Some(1000), 500, 100.0), Some(5.0));
        assert_eq!(estimate_eta(None, 500, 100.0), None);
        assert_eq!(estimate_eta(Some(1000), 500, 0.0), None);
    }

    #[test]
    fn test_parse_content_range() {
        assert_eq!(parse_content_range("bytes 500-1999/2000"), Some((500, 1999, Some(2000))));
        assert_eq!(parse_content_range("bytes 0-9/*"), Some((0, 9, None)));
        assert_eq!(parse_content_range("items 0-9/10"), None);
    }

    #[test]
    fn test_sanitize_source_id() {
        assert_eq!(sanitize_source_id("TheBloke/Llama-2-7B-GGUF"), "TheBloke_Llama-2-7B-GGUF");
    }

    #[test]
    fn test_filename_from_url() {
        let url = url::Url::parse("https://huggingface.co/org/model/resolve/main/model.Q4_K_M.gguf").unwrap();
        assert_eq!(filename_from_url(&url).as_deref(), Some("model.Q4_K_M.gguf"));
        let root = url::Url::parse("https://example.com/").unwrap();
        assert_eq!(filename_from_url(&root), None);
    }
}
