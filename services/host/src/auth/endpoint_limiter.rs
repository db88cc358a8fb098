//! 接口级限流：按 `IP + METHOD + path` 的固定 60 秒窗口计数。
//!
//! 上限解析顺序：精确 `METHOD:path` → 最长前缀 → 全局默认；前缀只决定上限，不合并计数。

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::store::unix_now_ms;

pub(crate) const ENDPOINT_WINDOW_MS: u64 = 60 * 1000;
pub(crate) const DEFAULT_LIMIT_PER_MIN: u32 = 60;

/// 每分钟上限规则表；以 `/` 结尾的键按前缀匹配。
const ROUTE_LIMITS: &[(&str, u32)] = &[
    ("POST:/api/terminal/create", 10),
    ("POST:/api/auth/regenerate-token", 3),
    ("POST:/api/identity/regenerate", 3),
    ("POST:/api/pairing/qr", 10),
    ("POST:/api/terminal/", 600),
    ("GET:/api/terminal/", 120),
];

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u32,
    window_start_ms: u64,
}

/// 单次计数结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EndpointDecision {
    pub(crate) allowed: bool,
    pub(crate) limit: u32,
    pub(crate) remaining: u32,
    pub(crate) reset_in_ms: u64,
}

impl EndpointDecision {
    /// `Retry-After` 秒数（向上取整）。
    pub(crate) fn retry_after_sec(&self) -> u64 {
        self.reset_in_ms.div_ceil(1000).max(1)
    }
}

#[derive(Default)]
pub(crate) struct EndpointRateLimiter {
    counters: Mutex<HashMap<String, WindowCounter>>,
}

impl EndpointRateLimiter {
    pub(crate) async fn check_and_consume(
        &self,
        ip: &str,
        method: &str,
        path: &str,
    ) -> EndpointDecision {
        self.check_and_consume_at(ip, method, path, unix_now_ms())
            .await
    }

    pub(crate) async fn check_and_consume_at(
        &self,
        ip: &str,
        method: &str,
        path: &str,
        now_ms: u64,
    ) -> EndpointDecision {
        let limit = resolve_limit(method, path);
        let key = format!("{ip}|{}:{path}", method.to_ascii_uppercase());
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(key).or_insert(WindowCounter {
            count: 0,
            window_start_ms: now_ms,
        });
        if now_ms.saturating_sub(counter.window_start_ms) >= ENDPOINT_WINDOW_MS {
            counter.count = 0;
            counter.window_start_ms = now_ms;
        }
        let reset_in_ms = (counter.window_start_ms + ENDPOINT_WINDOW_MS).saturating_sub(now_ms);
        if counter.count >= limit {
            return EndpointDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_in_ms,
            };
        }
        counter.count += 1;
        EndpointDecision {
            allowed: true,
            limit,
            remaining: limit - counter.count,
            reset_in_ms,
        }
    }

    pub(crate) async fn sweep(&self) -> usize {
        self.sweep_at(unix_now_ms()).await
    }

    /// 删除窗口起点超过两个窗口的计数器。
    pub(crate) async fn sweep_at(&self, now_ms: u64) -> usize {
        let mut counters = self.counters.lock().await;
        let before = counters.len();
        counters.retain(|_, counter| {
            now_ms.saturating_sub(counter.window_start_ms) <= ENDPOINT_WINDOW_MS * 2
        });
        before - counters.len()
    }
}

/// 解析每分钟上限：精确匹配优先，其次最长前缀，否则默认值。
pub(crate) fn resolve_limit(method: &str, path: &str) -> u32 {
    let key = format!("{}:{path}", method.to_ascii_uppercase());
    if let Some((_, limit)) = ROUTE_LIMITS.iter().find(|(rule, _)| *rule == key) {
        return *limit;
    }
    ROUTE_LIMITS
        .iter()
        .filter(|(rule, _)| rule.ends_with('/') && key.starts_with(rule))
        .max_by_key(|(rule, _)| rule.len())
        .map(|(_, limit)| *limit)
        .unwrap_or(DEFAULT_LIMIT_PER_MIN)
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_LIMIT_PER_MIN, ENDPOINT_WINDOW_MS, EndpointRateLimiter, resolve_limit};

    #[test]
    fn exact_then_prefix_then_default() {
        assert_eq!(resolve_limit("post", "/api/terminal/create"), 10);
        assert_eq!(resolve_limit("POST", "/api/terminal/abc/write"), 600);
        assert_eq!(resolve_limit("GET", "/api/terminal/list"), 120);
        assert_eq!(resolve_limit("GET", "/api/auth/check"), DEFAULT_LIMIT_PER_MIN);
        assert_eq!(resolve_limit("DELETE", "/api/terminal/abc"), DEFAULT_LIMIT_PER_MIN);
    }

    #[tokio::test]
    async fn eleventh_create_in_window_is_rejected() {
        let limiter = EndpointRateLimiter::default();
        let start = 5_000;
        for i in 0..10 {
            let decision = limiter
                .check_and_consume_at("10.0.0.2", "POST", "/api/terminal/create", start + i * 1000)
                .await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 9 - i as u32);
        }
        let rejected = limiter
            .check_and_consume_at("10.0.0.2", "POST", "/api/terminal/create", start + 45_000)
            .await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.reset_in_ms, 15_000);
        assert_eq!(rejected.retry_after_sec(), 15);

        // 其他 IP 独立计数。
        assert!(
            limiter
                .check_and_consume_at("10.0.0.3", "POST", "/api/terminal/create", start + 45_000)
                .await
                .allowed
        );
        // 新窗口重新放行。
        assert!(
            limiter
                .check_and_consume_at("10.0.0.2", "POST", "/api/terminal/create", start + ENDPOINT_WINDOW_MS)
                .await
                .allowed
        );
    }

    #[tokio::test]
    async fn prefix_routes_share_ceiling_but_count_per_path() {
        let limiter = EndpointRateLimiter::default();
        let a = limiter
            .check_and_consume_at("ip", "POST", "/api/terminal/a/write", 0)
            .await;
        let b = limiter
            .check_and_consume_at("ip", "POST", "/api/terminal/b/resize", 1)
            .await;
        let a_again = limiter
            .check_and_consume_at("ip", "post", "/api/terminal/a/write", 2)
            .await;
        assert_eq!((a.limit, b.limit), (600, 600));
        assert_eq!(a.remaining, 599);
        assert_eq!(b.remaining, 599);
        assert_eq!(a_again.remaining, 598);

        // 同一路径不同方法各自计数。
        let get = limiter
            .check_and_consume_at("ip", "GET", "/api/terminal/a/write", 3)
            .await;
        assert_eq!(get.remaining, 119);
    }

    #[tokio::test]
    async fn sweep_removes_entries_stale_for_two_windows() {
        let limiter = EndpointRateLimiter::default();
        limiter.check_and_consume_at("old", "GET", "/health", 0).await;
        limiter
            .check_and_consume_at("new", "GET", "/health", ENDPOINT_WINDOW_MS * 2)
            .await;
        assert_eq!(limiter.sweep_at(ENDPOINT_WINDOW_MS * 2 + 1).await, 1);
    }
}
