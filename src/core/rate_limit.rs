//! 按会话的最小发送间隔
//!
//! 采用预约方式：在锁内算出本次放行时刻 max(now, 上次放行 + 间隔) 并立即记下，解锁后再等待。
//! 同一会话的并发发送因此按到达顺序依次错开，不同会话互不影响。

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// 等到该会话可以发送为止，返回实际等待时长
    pub async fn acquire(&self, key: &str) -> Duration {
        let now = Instant::now();
        let ready_at = {
            let mut last_sent = self.last_sent.lock().unwrap_or_else(|e| e.into_inner());
            let ready_at = match last_sent.get(key) {
                Some(last) => (*last + self.min_interval).max(now),
                None => now,
            };
            last_sent.insert(key.to_string(), ready_at);
            ready_at
        };

        let wait = ready_at.saturating_duration_since(now);
        if !wait.is_zero() {
            tracing::debug!(conversation = %key, wait_ms = wait.as_millis() as u64, "rate limited");
            tokio::time::sleep_until(ready_at).await;
        }
        wait
    }

    /// 会话结束后清除记录
    pub fn forget(&self, key: &str) {
        self.last_sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}
