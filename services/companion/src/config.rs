//! 配置模块职责：
//! 1. 读取 companion 运行所需的环境变量并提供默认值。
//! 2. 解析本地数据目录（已配对宿主机列表的落盘位置）。

use std::{path::PathBuf, time::Duration};

/// 默认重连退避基数（毫秒）。
pub(crate) const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
/// 默认最大重连次数。
pub(crate) const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
/// 默认心跳间隔（秒）。
pub(crate) const DEFAULT_PING_INTERVAL_SEC: u64 = 25;
/// 默认允许连续未回应的 ping 数。
pub(crate) const DEFAULT_MAX_MISSED_PONGS: u32 = 3;
/// 默认 HTTP 请求超时（秒）。
pub(crate) const DEFAULT_REQUEST_TIMEOUT_SEC: u64 = 10;

/// companion 运行时配置。
#[derive(Debug, Clone)]
pub(crate) struct CompanionConfig {
    /// 持久化数据目录。
    pub(crate) data_dir: PathBuf,
    /// 重连退避基数。
    pub(crate) reconnect_base: Duration,
    /// 最大重连次数。
    pub(crate) reconnect_max_attempts: u32,
    /// 心跳间隔。
    pub(crate) ping_interval: Duration,
    /// 连续未回应 ping 达到该值后断开重连。
    pub(crate) max_missed_pongs: u32,
    /// `/connect`、`/verify-handshake`、`/ws-test` 请求超时。
    pub(crate) request_timeout: Duration,
}

impl CompanionConfig {
    /// 从环境变量构建配置。
    pub(crate) fn from_env() -> Self {
        Self {
            data_dir: resolve_data_dir(),
            reconnect_base: Duration::from_millis(u64_from_env(
                "TL_RECONNECT_BASE_MS",
                DEFAULT_RECONNECT_BASE_MS,
            )),
            reconnect_max_attempts: u64_from_env(
                "TL_RECONNECT_MAX_ATTEMPTS",
                u64::from(DEFAULT_RECONNECT_MAX_ATTEMPTS),
            )
            .min(u64::from(u32::MAX)) as u32,
            ping_interval: Duration::from_secs(u64_from_env(
                "TL_PING_INTERVAL_SEC",
                DEFAULT_PING_INTERVAL_SEC,
            )),
            max_missed_pongs: u64_from_env(
                "TL_MAX_MISSED_PONGS",
                u64::from(DEFAULT_MAX_MISSED_PONGS),
            )
            .min(u64::from(u32::MAX)) as u32,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SEC),
        }
    }

    /// 已配对宿主机列表文件。
    pub(crate) fn hosts_path(&self) -> PathBuf {
        self.data_dir.join("hosts.json")
    }
}

/// 数据目录：`TL_COMPANION_DATA_DIR` 优先，否则 `~/.config/termlink/companion`。
fn resolve_data_dir() -> PathBuf {
    if let Some(path) = non_empty_env("TL_COMPANION_DATA_DIR") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("termlink")
        .join("companion")
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// 读取正整数配置，非法值回退到默认值。
fn u64_from_env(key: &str, fallback: u64) -> u64 {
    non_empty_env(key)
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(fallback)
}
