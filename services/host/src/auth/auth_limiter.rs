//! 鉴权失败限流：同一 IP 在 15 分钟窗口内失败 5 次即封禁 15 分钟。
//!
//! 必须先于 token 校验执行；成功鉴权后以解析后的客户端 IP 清除记录。

use std::collections::HashMap;

use tokio::sync::Mutex;
use tracing::warn;

use crate::store::unix_now_ms;

/// 触发封禁的失败次数。
pub(crate) const MAX_AUTH_FAILURES: u32 = 5;
/// 失败计数窗口（自最近一次失败起算）。
pub(crate) const AUTH_WINDOW_MS: u64 = 15 * 60 * 1000;
/// 封禁时长。
pub(crate) const AUTH_BLOCK_MS: u64 = 15 * 60 * 1000;

#[derive(Debug, Clone, Copy)]
struct AuthAttempt {
    attempts: u32,
    last_attempt_ms: u64,
    blocked_until_ms: Option<u64>,
}

/// 限流检查结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AuthCheck {
    pub(crate) allowed: bool,
    pub(crate) retry_after_sec: Option<u64>,
}

#[derive(Default)]
pub(crate) struct AuthRateLimiter {
    entries: Mutex<HashMap<String, AuthAttempt>>,
}

impl AuthRateLimiter {
    pub(crate) async fn check(&self, ip: &str) -> AuthCheck {
        self.check_at(ip, unix_now_ms()).await
    }

    pub(crate) async fn check_at(&self, ip: &str, now_ms: u64) -> AuthCheck {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(ip).copied() else {
            return AuthCheck {
                allowed: true,
                retry_after_sec: None,
            };
        };
        if let Some(until) = entry.blocked_until_ms {
            if until > now_ms {
                return AuthCheck {
                    allowed: false,
                    retry_after_sec: Some((until - now_ms).div_ceil(1000)),
                };
            }
            entries.remove(ip);
        } else if now_ms.saturating_sub(entry.last_attempt_ms) > AUTH_WINDOW_MS {
            entries.remove(ip);
        }
        AuthCheck {
            allowed: true,
            retry_after_sec: None,
        }
    }

    /// 记录一次失败；返回本次是否触发封禁。
    pub(crate) async fn record_failure(&self, ip: &str) -> bool {
        self.record_failure_at(ip, unix_now_ms()).await
    }

    pub(crate) async fn record_failure_at(&self, ip: &str, now_ms: u64) -> bool {
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(ip.to_string()).or_insert(AuthAttempt {
            attempts: 0,
            last_attempt_ms: now_ms,
            blocked_until_ms: None,
        });
        if now_ms.saturating_sub(entry.last_attempt_ms) > AUTH_WINDOW_MS {
            entry.attempts = 0;
            entry.blocked_until_ms = None;
        }
        entry.attempts += 1;
        entry.last_attempt_ms = now_ms;
        if entry.attempts >= MAX_AUTH_FAILURES {
            entry.blocked_until_ms = Some(now_ms + AUTH_BLOCK_MS);
            warn!(ip, attempts = entry.attempts, "auth failures exceeded, ip blocked");
            return true;
        }
        false
    }

    /// 任一成功鉴权即完全清除。
    pub(crate) async fn clear(&self, ip: &str) {
        self.entries.lock().await.remove(ip);
    }

    pub(crate) async fn sweep(&self) -> usize {
        self.sweep_at(unix_now_ms()).await
    }

    /// 移除窗口与封禁都已过期的记录。
    pub(crate) async fn sweep_at(&self, now_ms: u64) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| {
            let window_live = now_ms.saturating_sub(entry.last_attempt_ms) <= AUTH_WINDOW_MS;
            let block_live = entry.blocked_until_ms.is_some_and(|until| until > now_ms);
            window_live || block_live
        });
        before - entries.len()
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
