//! 终端后端接口与基于管道的进程实现。

use std::{collections::HashMap, process::Stdio, sync::Arc};

use async_trait::async_trait;
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::{Mutex, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use super::hub::TerminalHub;

const READ_CHUNK_BYTES: usize = 4096;
const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, thiserror::Error)]
pub(crate) enum BackendError {
    #[error("terminal not found: {0}")]
    NotFound(String),
    #[error("terminal already exited: {0}")]
    Exited(String),
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("terminal io failed: {0}")]
    Io(#[from] std::io::Error),
}

/// 新建终端参数。
#[derive(Debug, Clone, Default)]
pub(crate) struct SpawnSpec {
    pub(crate) shell: Option<String>,
    pub(crate) cwd: Option<String>,
    pub(crate) cols: Option<u16>,
    pub(crate) rows: Option<u16>,
}

/// 终端元数据（列表接口返回）。
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TerminalInfo {
    pub(crate) id: String,
    pub(crate) shell: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cwd: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) pid: Option<u32>,
    pub(crate) cols: u16,
    pub(crate) rows: u16,
    pub(crate) created_at: i64,
    pub(crate) exited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) exit_code: Option<i32>,
}

/// 终端生命周期与输入操作；输出统一经 `TerminalHub` 发布。
#[async_trait]
pub(crate) trait TerminalBackend: Send + Sync {
    async fn spawn(&self, spec: SpawnSpec) -> Result<TerminalInfo, BackendError>;
    async fn write(&self, pty_id: &str, data: &str) -> Result<(), BackendError>;
    async fn resize(&self, pty_id: &str, cols: u16, rows: u16) -> Result<(), BackendError>;
    async fn kill(&self, pty_id: &str) -> Result<(), BackendError>;
    async fn list(&self) -> Vec<TerminalInfo>;
}

struct ProcessTerminal {
    info: TerminalInfo,
    stdin: Arc<Mutex<ChildStdin>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// 以管道 stdio 运行 shell 的终端后端。
pub(crate) struct ProcessBackend {
    hub: Arc<TerminalHub>,
    default_shell: String,
    terminals: Arc<Mutex<HashMap<String, ProcessTerminal>>>,
}

impl ProcessBackend {
    pub(crate) fn new(hub: Arc<TerminalHub>, default_shell: impl Into<String>) -> Self {
        Self {
            hub,
            default_shell: default_shell.into(),
            terminals: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl TerminalBackend for ProcessBackend {
    async fn spawn(&self, spec: SpawnSpec) -> Result<TerminalInfo, BackendError> {
        let shell = spec
            .shell
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| self.default_shell.clone());
        let cols = spec.cols.unwrap_or(DEFAULT_COLS).max(1);
        let rows = spec.rows.unwrap_or(DEFAULT_ROWS).max(1);

        let mut command = Command::new(&shell);
        command
            .env("TERM", "xterm-256color")
            .env("COLUMNS", cols.to_string())
            .env("LINES", rows.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = spec.cwd.as_deref().filter(|value| !value.trim().is_empty()) {
            command.current_dir(cwd);
        }
        let mut child = command.spawn().map_err(BackendError::Spawn)?;

        let id = format!("pty_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(BackendError::Spawn(std::io::Error::other(
                "child stdio not captured",
            )));
        };

        let info = TerminalInfo {
            id: id.clone(),
            shell: shell.clone(),
            cwd: spec.cwd,
            pid: child.id(),
            cols,
            rows,
            created_at: tl_shared_protocol::now_millis(),
            exited: false,
            exit_code: None,
        };
        self.hub.register(&id).await;

        let readers = vec![
            spawn_reader(self.hub.clone(), id.clone(), stdout),
            spawn_reader(self.hub.clone(), id.clone(), stderr),
        ];
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        self.terminals.lock().await.insert(
            id.clone(),
            ProcessTerminal {
                info: info.clone(),
                stdin: Arc::new(Mutex::new(stdin)),
                kill_tx: Some(kill_tx),
            },
        );

        let hub = self.hub.clone();
        let terminals = self.terminals.clone();
        let waiter_id = id.clone();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            for reader in readers {
                let _ = reader.await;
            }
            let exit_code = status.ok().and_then(|status| status.code());
            hub.publish_exit(&waiter_id, exit_code).await;
            info!(pty_id = %waiter_id, ?exit_code, "terminal exited");

            let mut terminals = terminals.lock().await;
            match terminals.get_mut(&waiter_id) {
                Some(terminal) => {
                    terminal.info.exited = true;
                    terminal.info.exit_code = exit_code;
                }
                // 已被 kill 移除：退出事件发出后再清理分发通道。
                None => hub.remove(&waiter_id).await,
            }
        });

        info!(pty_id = %id, shell = %shell, "terminal spawned");
        Ok(info)
    }

    async fn write(&self, pty_id: &str, data: &str) -> Result<(), BackendError> {
        let stdin = {
            let terminals = self.terminals.lock().await;
            let terminal = terminals
                .get(pty_id)
                .ok_or_else(|| BackendError::NotFound(pty_id.to_string()))?;
            if terminal.info.exited {
                return Err(BackendError::Exited(pty_id.to_string()));
            }
            terminal.stdin.clone()
        };
        let mut stdin = stdin.lock().await;
        stdin.write_all(data.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// 管道没有窗口尺寸概念，只记录最新尺寸。
    async fn resize(&self, pty_id: &str, cols: u16, rows: u16) -> Result<(), BackendError> {
        let mut terminals = self.terminals.lock().await;
        let terminal = terminals
            .get_mut(pty_id)
            .ok_or_else(|| BackendError::NotFound(pty_id.to_string()))?;
        terminal.info.cols = cols.max(1);
        terminal.info.rows = rows.max(1);
        debug!(pty_id, cols, rows, "terminal resized");
        Ok(())
    }

    async fn kill(&self, pty_id: &str) -> Result<(), BackendError> {
        let removed = self.terminals.lock().await.remove(pty_id);
        let Some(mut terminal) = removed else {
            return Err(BackendError::NotFound(pty_id.to_string()));
        };
        match terminal.kill_tx.take() {
            Some(kill_tx) if !terminal.info.exited => {
                let _ = kill_tx.send(());
            }
            _ => self.hub.remove(pty_id).await,
        }
        Ok(())
    }

    async fn list(&self) -> Vec<TerminalInfo> {
        let mut list: Vec<TerminalInfo> = self
            .terminals
            .lock()
            .await
            .values()
            .map(|terminal| terminal.info.clone())
            .collect();
        list.sort_by_key(|info| info.created_at);
        list
    }
}

fn spawn_reader<R>(hub: Arc<TerminalHub>, pty_id: String, mut source: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0_u8; READ_CHUNK_BYTES];
        let mut pending = Vec::with_capacity(READ_CHUNK_BYTES + 4);
        loop {
            match source.read(&mut buf).await {
                Ok(0) => {
                    if !pending.is_empty() {
                        let tail = String::from_utf8_lossy(&pending).into_owned();
                        hub.publish(&pty_id, tail).await;
                    }
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let chunk = drain_utf8(&mut pending);
                    if !chunk.is_empty() {
                        hub.publish(&pty_id, chunk).await;
                    }
                }
                Err(err) => {
                    warn!(pty_id = %pty_id, "terminal read failed: {err}");
                    break;
                }
            }
        }
    })
}

/// 解码 `pending` 中的完整 UTF-8；末尾不完整的多字节序列留待下次读取，真正非法的字节替换为 U+FFFD。
fn drain_utf8(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(err) => {
                let valid = err.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match err.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{sync::Arc, time::Duration};

    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{
        BackendError, ProcessBackend, READ_CHUNK_BYTES, SpawnSpec, TerminalBackend, drain_utf8,
        spawn_reader,
    };
    use crate::terminal::hub::{HubEvent, TerminalHub};

    async fn collect_until_exit(rx: &mut mpsc::Receiver<HubEvent>) -> (String, Option<i32>) {
        let mut output = String::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(HubEvent::Data { data, .. })) => output.push_str(&data),
                Ok(Some(HubEvent::Exit { exit_code, .. })) => return (output, exit_code),
                _ => panic!("terminal did not exit in time; output so far: {output}"),
            }
        }
    }

    #[tokio::test]
    async fn shell_output_reaches_subscriber_and_exit_is_published() {
        let hub = Arc::new(TerminalHub::new(100));
        let backend = ProcessBackend::new(hub.clone(), "/bin/sh");
        let info = backend.spawn(SpawnSpec::default()).await.unwrap();
        assert_eq!((info.cols, info.rows), (80, 24));

        let (tx, mut rx) = mpsc::channel(64);
        let backlog = hub.subscribe(&info.id, Uuid::new_v4(), tx).await.unwrap();
        assert!(backlog.is_empty());

        backend.write(&info.id, "echo termlink-ok\nexit 3\n").await.unwrap();
        let (output, exit_code) = collect_until_exit(&mut rx).await;
        assert!(output.contains("termlink-ok"));
        assert_eq!(exit_code, Some(3));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let listed = backend.list().await;
        assert!(listed.iter().any(|t| t.id == info.id && t.exited));
        assert!(matches!(
            backend.write(&info.id, "x").await,
            Err(BackendError::Exited(_))
        ));
    }

    #[tokio::test]
    async fn kill_terminates_and_forgets_terminal() {
        let hub = Arc::new(TerminalHub::new(100));
        let backend = ProcessBackend::new(hub.clone(), "/bin/sh");
        let info = backend.spawn(SpawnSpec::default()).await.unwrap();
        let (tx, mut rx) = mpsc::channel(64);
        hub.subscribe(&info.id, Uuid::new_v4(), tx).await.unwrap();

        backend.resize(&info.id, 120, 40).await.unwrap();
        assert_eq!(backend.list().await[0].cols, 120);

        backend.kill(&info.id).await.unwrap();
        let (_, _) = collect_until_exit(&mut rx).await;
        assert!(backend.list().await.is_empty());
        assert!(matches!(
            backend.kill(&info.id).await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[test]
    fn split_multibyte_sequences_are_carried_to_next_read() {
        let bytes = "é中".as_bytes();
        let mut pending = bytes[..1].to_vec();
        assert_eq!(drain_utf8(&mut pending), "");
        assert_eq!(pending.len(), 1);

        pending.extend_from_slice(&bytes[1..3]);
        assert_eq!(drain_utf8(&mut pending), "é");
        pending.extend_from_slice(&bytes[3..]);
        assert_eq!(drain_utf8(&mut pending), "中");
        assert!(pending.is_empty());

        let mut invalid = vec![b'a', 0xff, b'b'];
        assert_eq!(drain_utf8(&mut invalid), "a\u{FFFD}b");
        assert!(invalid.is_empty());
    }

    #[tokio::test]
    async fn reader_keeps_characters_split_across_chunk_boundary() {
        let hub = Arc::new(TerminalHub::new(100));
        hub.register("p1").await;
        let (tx, mut rx) = mpsc::channel(16);
        hub.subscribe("p1", Uuid::new_v4(), tx).await.unwrap();

        let mut data = "a".repeat(READ_CHUNK_BYTES - 1);
        data.push_str("é中文");
        let source: &'static [u8] = Box::leak(data.clone().into_bytes().into_boxed_slice());
        spawn_reader(hub.clone(), "p1".to_string(), source)
            .await
            .unwrap();

        let mut output = String::new();
        while let Ok(HubEvent::Data { data, .. }) = rx.try_recv() {
            output.push_str(&data);
        }
        assert_eq!(output, data);
        assert!(!output.contains(char::REPLACEMENT_CHARACTER));
    }
}
