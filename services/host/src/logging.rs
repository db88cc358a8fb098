//! 日志系统模块职责：
//! 1. 初始化 stdout + 文件双通道 tracing 日志。
//! 2. 运行日志按天滚动写入 `<log_dir>/raw`。
//! 3. 定期删除超过保留天数的历史日志。

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use tokio::{task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};

/// 日志原始文件目录名。
const RAW_DIR_NAME: &str = "raw";
/// 默认保留天数。
const DEFAULT_RETENTION_DAYS: u64 = 14;
/// 清理任务轮询周期。
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);
/// 文件日志级别环境变量（独立于 `RUST_LOG`）。
const FILE_LOG_LEVEL_ENV: &str = "TL_FILE_LOG_LEVEL";
/// stdout 默认日志过滤。
const DEFAULT_STDOUT_FILTER: &str = "info";

/// 日志运行时守卫，防止 non-blocking writer 提前析构。
pub(crate) struct LogRuntime {
    _stdout_guard: WorkerGuard,
    _file_guard: WorkerGuard,
    _pruner: JoinHandle<()>,
}

/// 初始化日志系统，并启动过期日志清理任务。
pub(crate) fn init(service_name: &str) -> Result<LogRuntime> {
    let raw_dir = resolve_log_root().join(RAW_DIR_NAME);
    fs::create_dir_all(&raw_dir)
        .with_context(|| format!("create raw log dir: {}", raw_dir.display()))?;
    let retention_days = retention_days();
    let removed = prune_expired_logs(&raw_dir, Local::now().date_naive(), retention_days);

    let file_appender = tracing_appender::rolling::daily(&raw_dir, format!("{service_name}.log"));
    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let stdout_layer = tracing_subscriber::fmt::layer()
        .with_writer(stdout_writer)
        .with_ansi(true)
        .with_target(false)
        .compact()
        .with_filter(resolve_stdout_env_filter());
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(true)
        .with_filter(resolve_file_level_filter());

    tracing_subscriber::registry()
        .with(stdout_layer)
        .with(file_layer)
        .init();
    if removed > 0 {
        info!(removed, "pruned expired log files");
    }

    Ok(LogRuntime {
        _stdout_guard: stdout_guard,
        _file_guard: file_guard,
        _pruner: spawn_prune_task(raw_dir, retention_days),
    })
}

/// 优先 `RUST_LOG`，回退默认级别。
fn resolve_stdout_env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_STDOUT_FILTER))
}

/// 文件日志默认保留 `debug`。
fn resolve_file_level_filter() -> LevelFilter {
    std::env::var(FILE_LOG_LEVEL_ENV)
        .ok()
        .and_then(|raw| raw.trim().parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::DEBUG)
}

fn spawn_prune_task(raw_dir: PathBuf, retention_days: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = prune_expired_logs(&raw_dir, Local::now().date_naive(), retention_days);
            if removed > 0 {
                info!(removed, "pruned expired log files");
            }
        }
    })
}

/// `TL_LOG_DIR`，默认 `<数据目录>/logs`；相对路径按当前目录解析。
fn resolve_log_root() -> PathBuf {
    let Some(raw) = crate::config::non_empty_env("TL_LOG_DIR") else {
        return crate::config::resolve_data_dir().join("logs");
    };
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(dir) => dir.join(path),
        Err(_) => path,
    }
}

fn retention_days() -> u64 {
    std::env::var("TL_LOG_RETENTION_DAYS")
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|days| *days > 0)
        .unwrap_or(DEFAULT_RETENTION_DAYS)
}

/// 删除日期早于 `today - retention_days` 的滚动日志，返回删除数量。
fn prune_expired_logs(raw_dir: &Path, today: NaiveDate, retention_days: u64) -> usize {
    let Some(cutoff) = today.checked_sub_days(chrono::Days::new(retention_days)) else {
        return 0;
    };
    let Ok(entries) = fs::read_dir(raw_dir) else {
        return 0;
    };
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(day) = path
            .file_name()
            .and_then(|value| value.to_str())
            .and_then(extract_day_from_log_name)
        else {
            continue;
        };
        if day >= cutoff {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %path.display(), "remove expired log failed: {err}"),
        }
    }
    removed
}

/// 从滚动日志文件名提取日期（`name.log.YYYY-MM-DD`）。
fn extract_day_from_log_name(file_name: &str) -> Option<NaiveDate> {
    let day = file_name.rsplit('.').next()?;
    NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::{extract_day_from_log_name, prune_expired_logs};
    use crate::store::temp_dir_for_test;

    #[test]
    fn prune_keeps_recent_and_foreign_files() {
        let dir = temp_dir_for_test("logs");
        for name in [
            "host.log.2026-01-01",
            "host.log.2026-01-10",
            "host.log.2026-01-14",
            "notes.txt",
        ] {
            std::fs::write(dir.join(name), "x").unwrap();
        }
        let today = NaiveDate::from_ymd_opt(2026, 1, 15).unwrap();
        assert_eq!(prune_expired_logs(&dir, today, 7), 1);
        assert!(!dir.join("host.log.2026-01-01").exists());
        assert!(dir.join("host.log.2026-01-10").exists());
        assert!(dir.join("notes.txt").exists());
    }

    #[test]
    fn day_extraction() {
        assert_eq!(
            extract_day_from_log_name("tl-host.log.2026-03-02"),
            NaiveDate::from_ymd_opt(2026, 3, 2)
        );
        assert_eq!(extract_day_from_log_name("tl-host.log"), None);
    }
}
