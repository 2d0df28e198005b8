use std::time::Duration;
use crate::core::error::DownloadError;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64, // 添加抖动因子避免重试风暴
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1, // 10% 的抖动
        }
    }
}

impl RetryStrategy {
    /// retry_count 为本次失败之前已经消耗的重试次数
    pub fn should_retry(&self, error: &DownloadError, retry_count: u32) -> bool {
        error.is_retryable() && retry_count < self.max_retries
    }

    /// base × multiplier^retry_count，封顶 max_delay
    pub fn get_delay(&self, retry_count: u32) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() *
            self.backoff_multiplier.powi(retry_count.min(32) as i32);
        let capped = delay_secs.min(self.max_delay.as_secs_f64());

        let jitter = if self.jitter_factor > 0.0 {
            capped * self.jitter_factor * (rand::random::<f64>() - 0.5)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped + jitter).max(0.0)).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> RetryStrategy {
        RetryStrategy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let s = strategy();
        assert_eq!(s.get_delay(0), Duration::from_millis(100));
        assert_eq!(s.get_delay(1), Duration::from_millis(200));
        assert_eq!(s.get_delay(2), Duration::from_millis(400));
        assert_eq!(s.get_delay(3), Duration::from_millis(500));
        assert_eq!(s.get_delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_ceiling() {
        let s = strategy();
        let transient = DownloadError::NetworkTransient("timeout".to_string());
        assert!(s.should_retry(&transient, 0));
        assert!(s.should_retry(&transient, 2));
        assert!(!s.should_retry(&transient, 3));
    }

    #[test]
    fn test_non_transient_never_retried() {
        let s = strategy();
        assert!(!s.should_retry(&DownloadError::from_status(404), 0));
        let mismatch = DownloadError::SizeMismatch { expected: 1, actual: 2 };
        assert!(!s.should_retry(&mismatch, 0));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let s = RetryStrategy { jitter_factor: 0.5, ..strategy() };
        for attempt in 0..10 {
            assert!(s.get_delay(attempt) <= s.max_delay);
        }
    }
}
