//! 指数退避（ExponentialBackoff）
//!
//! 生产/消费循环对基础设施错误无限重试：延迟按倍数增长并封顶，
//! 但没有最大总时长，只会退避、不会放弃；取消信号是唯一的退出方式。
//!
use crate::error::MessagingError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 退避配置
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    /// 首次重试延迟
    pub initial_interval: Duration,
    /// 单次延迟上限
    pub max_interval: Duration,
    /// 增长倍数（小于 1 时按 1 处理）
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current: config.initial_interval,
            config,
            attempts: 0,
        }
    }

    /// 返回本次应等待的时长并推进到下一档
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current.min(self.config.max_interval);
        let multiplier = self.config.multiplier.max(1.0);
        self.current = self
            .current
            .mul_f64(multiplier)
            .min(self.config.max_interval);
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.config.initial_interval;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// 无上限重试 `op` 直至成功；被取消时返回 `None`
///
/// 每次失败先调用 `on_error(err, delay)`，再等待 `delay`。
pub async fn retry_until_cancelled<T, F, Fut, E>(
    token: &CancellationToken,
    config: BackoffConfig,
    mut op: F,
    mut on_error: E,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MessagingError>>,
    E: FnMut(&MessagingError, Duration),
{
    let mut backoff = ExponentialBackoff::new(config);

    loop {
        if token.is_cancelled() {
            return None;
        }

        let result = tokio::select! {
            _ = token.cancelled() => return None,
            r = op() => r,
        };

        match result {
            Ok(value) => return Some(value),
            Err(err) => {
                let delay = backoff.next_delay();
                on_error(&err, delay);
                tokio::select! {
                    _ = token.cancelled() => return None,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}
