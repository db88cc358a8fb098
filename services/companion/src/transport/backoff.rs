//! 指数退避：`base * 2^attempt`，超过最大次数后放弃。

use std::time::Duration;

/// 移位上限，避免 `2^attempt` 溢出。
const MAX_SHIFT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReconnectPolicy {
    pub(crate) base: Duration,
    pub(crate) max_attempts: u32,
}

impl ReconnectPolicy {
    pub(crate) fn new(base: Duration, max_attempts: u32) -> Self {
        Self { base, max_attempts }
    }

    /// 第 `attempt` 次（从 0 开始）重连前的等待；达到上限返回 `None`。
    pub(crate) fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        Some(self.base.saturating_mul(1_u32 << attempt.min(MAX_SHIFT)))
    }
}
