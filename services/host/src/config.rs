//! 配置模块职责：
//! 1. 读取宿主机运行所需的环境变量并提供默认值。
//! 2. 解析宿主机数据目录（证书、指纹、加密 token 的落盘位置）。
//! 3. 提供布尔/时长/数值等通用环境变量解析能力。

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::Context;

/// 默认监听地址。
pub(crate) const DEFAULT_HOST_ADDR: &str = "0.0.0.0:7878";
/// 默认终端输出缓冲上限（chunk 数）。
pub(crate) const DEFAULT_OUTPUT_BUFFER_CHUNKS: usize = 1000;
/// 默认限流/nonce 清扫周期（秒）。
pub(crate) const DEFAULT_SWEEP_INTERVAL_SEC: u64 = 120;

/// 宿主机运行时配置。
#[derive(Debug, Clone)]
pub(crate) struct HostConfig {
    /// HTTP/WS 监听地址。
    pub(crate) listen_addr: SocketAddr,
    /// 持久化数据目录。
    pub(crate) data_dir: PathBuf,
    /// 配对链接中展示的宿主机地址；为空时自动探测局域网 IP。
    pub(crate) public_host: Option<String>,
    /// 宿主机展示名。
    pub(crate) host_name: String,
    /// 新建终端默认 shell。
    pub(crate) terminal_shell: String,
    /// 无订阅者时每个终端保留的输出 chunk 上限。
    pub(crate) output_buffer_chunks: usize,
    /// 限流表与 nonce 表清扫周期。
    pub(crate) sweep_interval: Duration,
}

impl HostConfig {
    /// 从环境变量构建配置。
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let raw_addr = env_or_default("TL_HOST_ADDR", DEFAULT_HOST_ADDR);
        let listen_addr = raw_addr
            .trim()
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid TL_HOST_ADDR: {raw_addr}"))?;

        Ok(Self {
            listen_addr,
            data_dir: resolve_data_dir(),
            public_host: non_empty_env("TL_PUBLIC_HOST"),
            host_name: non_empty_env("TL_HOST_NAME").unwrap_or_else(detect_host_name),
            terminal_shell: non_empty_env("TL_TERMINAL_SHELL")
                .or_else(|| non_empty_env("SHELL"))
                .unwrap_or_else(|| "/bin/sh".to_string()),
            output_buffer_chunks: usize_from_env(
                "TL_OUTPUT_BUFFER_CHUNKS",
                DEFAULT_OUTPUT_BUFFER_CHUNKS,
            ),
            sweep_interval: duration_from_env("TL_SWEEP_INTERVAL_SEC", DEFAULT_SWEEP_INTERVAL_SEC),
        })
    }

    #[cfg(test)]
    /// 测试辅助：指定数据目录，其余取默认值。
    pub(crate) fn for_test(data_dir: PathBuf) -> Self {
        Self {
            listen_addr: "127.0.0.1:0".parse().expect("static addr"),
            data_dir,
            public_host: Some("127.0.0.1".to_string()),
            host_name: "test-host".to_string(),
            terminal_shell: "/bin/sh".to_string(),
            output_buffer_chunks: DEFAULT_OUTPUT_BUFFER_CHUNKS,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SEC),
        }
    }
}

/// 数据目录：`TL_HOST_DATA_DIR` 优先，否则 `~/.config/termlink/host`。
pub(crate) fn resolve_data_dir() -> PathBuf {
    if let Some(path) = non_empty_env("TL_HOST_DATA_DIR") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home)
        .join(".config")
        .join("termlink")
        .join("host")
}

/// 探测宿主机名；失败时回退 `termlink-host`。
pub(crate) fn detect_host_name() -> String {
    sysinfo::System::host_name()
        .map(|name| name.trim().chars().take(64).collect::<String>())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "termlink-host".to_string())
}

/// 读取非空环境变量（去首尾空白）。
pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// 读取环境变量；不存在时返回默认值。
fn env_or_default(key: &str, fallback: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| fallback.to_string())
}

/// 读取秒级时长配置，非法值回退到默认秒数。
fn duration_from_env(key: &str, fallback_sec: u64) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| Duration::from_secs(fallback_sec))
}

/// 读取 usize 配置，非法值回退到默认值。
fn usize_from_env(key: &str, fallback: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse::<usize>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(fallback)
}
