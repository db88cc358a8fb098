//! WS 会话驱动：单个 `select!` 循环统一处理读帧、上层写入、心跳与退避定时器，
//! `watch` 关闭信号生效后不再有任何定时器触发。

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};
use tl_shared_protocol::WsMessage;

use super::{
    backoff::ReconnectPolicy,
    machine::{Action, ConnectionMachine, Phase, TransportError},
};
use crate::pairing::protocol::SessionEndpoint;

/// 传输层参数。
#[derive(Debug, Clone, Copy)]
pub(crate) struct TransportSettings {
    pub(crate) policy: ReconnectPolicy,
    pub(crate) ping_interval: Duration,
    pub(crate) max_missed_pongs: u32,
}

/// 会话句柄：写入、断开、等待结束。
pub(crate) struct TransportHandle {
    outbound: mpsc::Sender<WsMessage>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<Result<(), TransportError>>,
}

impl TransportHandle {
    /// 投递上行消息；鉴权完成前由状态机排队。
    pub(crate) async fn send(&self, msg: WsMessage) -> bool {
        self.outbound.send(msg).await.is_ok()
    }

    /// 主动断开；之后不会再重连。
    pub(crate) fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }

    /// 等待会话结束。
    pub(crate) async fn join(self) -> Result<(), TransportError> {
        match self.task.await {
            Ok(result) => result,
            Err(err) => {
                warn!("transport task join error: {err}");
                Ok(())
            }
        }
    }
}

/// 单次连接的结束方式。
enum ConnectionEnd {
    Dropped,
    Stopped(Option<TransportError>),
}

/// 启动会话；下行业务消息写入 `inbound`。
pub(crate) fn spawn_session(
    endpoint: SessionEndpoint,
    settings: TransportSettings,
    inbound: mpsc::Sender<WsMessage>,
) -> TransportHandle {
    let (outbound_tx, outbound_rx) = mpsc::channel::<WsMessage>(256);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(run_session(
        endpoint,
        settings,
        outbound_rx,
        inbound,
        shutdown_rx,
    ));
    TransportHandle {
        outbound: outbound_tx,
        shutdown: shutdown_tx,
        task,
    }
}

async fn run_session(
    endpoint: SessionEndpoint,
    settings: TransportSettings,
    mut outbound_rx: mpsc::Receiver<WsMessage>,
    inbound: mpsc::Sender<WsMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), TransportError> {
    let mut machine =
        ConnectionMachine::new(settings.policy, settings.max_missed_pongs, &endpoint.token);

    loop {
        if *shutdown_rx.borrow() {
            return Ok(());
        }
        info!(host_id = %endpoint.host_id, url = %endpoint.ws_url, "connecting");
        let connected = tokio::select! {
            _ = shutdown_rx.changed() => return Ok(()),
            result = connect_async(endpoint.ws_url.as_str()) => result,
        };

        let mut closed = Vec::new();
        match connected {
            Ok((stream, _)) => {
                let end = drive_connection(
                    stream,
                    &mut machine,
                    &settings,
                    &mut outbound_rx,
                    &inbound,
                    &mut shutdown_rx,
                )
                .await;
                if let ConnectionEnd::Stopped(err) = end {
                    return err.map_or(Ok(()), Err);
                }
            }
            Err(WsError::Http(resp)) => {
                let status = resp.status().as_u16();
                let retry_after_sec = resp
                    .headers()
                    .get("retry-after")
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.trim().parse::<u64>().ok());
                warn!(host_id = %endpoint.host_id, status, "ws upgrade rejected");
                closed = machine.on_upgrade_rejected(status, retry_after_sec);
            }
            Err(err) => warn!(host_id = %endpoint.host_id, "connect failed: {err}"),
        }
        if closed.is_empty() {
            closed = machine.on_closed();
        }

        for action in closed {
            match action {
                Action::Reconnect(delay) => {
                    info!(
                        attempt = machine.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "reconnect scheduled"
                    );
                    tokio::select! {
                        _ = shutdown_rx.changed() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    machine.on_reconnect_due();
                }
                Action::Stop(err) => return err.map_or(Ok(()), Err),
                _ => {}
            }
        }
    }
}

async fn drive_connection<S>(
    stream: S,
    machine: &mut ConnectionMachine,
    settings: &TransportSettings,
    outbound_rx: &mut mpsc::Receiver<WsMessage>,
    inbound: &mpsc::Sender<WsMessage>,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ConnectionEnd
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut writer, mut reader) = stream.split();
    let mut ping = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut pending = machine.on_open();
    loop {
        for action in pending.drain(..) {
            match action {
                Action::Send(msg) => {
                    if let Err(err) = writer.send(Message::Text(msg.to_json().into())).await {
                        warn!("ws write failed: {err}");
                        return ConnectionEnd::Dropped;
                    }
                }
                Action::Deliver(msg) => {
                    if inbound.send(msg).await.is_err() {
                        debug!("inbound receiver dropped");
                    }
                }
                Action::Close => {
                    let _ = writer.send(Message::Close(None)).await;
                    if machine.phase() == &Phase::Closed {
                        continue;
                    }
                    return ConnectionEnd::Dropped;
                }
                Action::Stop(err) => return ConnectionEnd::Stopped(err),
                Action::Reconnect(_) => {}
            }
        }
        if machine.phase() == &Phase::Closed {
            return ConnectionEnd::Stopped(None);
        }

        pending = tokio::select! {
            _ = shutdown_rx.changed() => machine.disconnect(),
            maybe = outbound_rx.recv() => match maybe {
                Some(msg) => machine.send(msg),
                None => machine.disconnect(),
            },
            _ = ping.tick() => machine.on_ping_tick(),
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<WsMessage>(text.as_str()) {
                        Ok(msg) => machine.on_message(msg),
                        Err(err) => {
                            debug!("ignore malformed frame: {err}");
                            Vec::new()
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Dropped,
                Some(Ok(_)) => Vec::new(),
                Some(Err(err)) => {
                    warn!("ws read failed: {err}");
                    return ConnectionEnd::Dropped;
                }
            },
        };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{
        Router,
        extract::ws::{Message, WebSocket, WebSocketUpgrade},
        http::{HeaderValue, StatusCode, header::RETRY_AFTER},
        response::{IntoResponse, Response},
        routing::get,
    };
    use tl_shared_protocol::{WsMessage, WsMessageType};
    use tokio::sync::mpsc;

    use super::{TransportSettings, spawn_session};
    use crate::{
        pairing::protocol::SessionEndpoint,
        transport::{backoff::ReconnectPolicy, machine::TransportError},
    };

    /// 最小宿主机：校验 `auth`，之后把 `terminal:write` 回显为 `terminal:data`。
    async fn fake_host(ws: WebSocketUpgrade) -> Response {
        ws.on_upgrade(|mut socket: WebSocket| async move {
            let mut authed = false;
            while let Some(Ok(Message::Text(text))) = socket.recv().await {
                let Ok(msg) = serde_json::from_str::<WsMessage>(text.as_str()) else {
                    continue;
                };
                let reply = match msg.kind {
                    WsMessageType::Auth if msg.auth_token() == Some("good") => {
                        authed = true;
                        WsMessage::control(WsMessageType::AuthSuccess)
                    }
                    WsMessageType::Auth => WsMessage::control(WsMessageType::AuthFailure),
                    WsMessageType::TerminalWrite if authed => WsMessage::terminal_data(
                        msg.pty_id.as_deref().unwrap_or_default(),
                        msg.text_payload().unwrap_or_default(),
                    ),
                    _ => WsMessage::error("unauthorized", "auth first"),
                };
                if socket
                    .send(Message::Text(reply.to_json().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        })
    }

    async fn spawn_fake_host() -> String {
        let app = Router::new().route("/ws", get(fake_host));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("ws://{addr}/ws")
    }

    fn settings() -> TransportSettings {
        TransportSettings {
            policy: ReconnectPolicy::new(Duration::from_millis(20), 2),
            ping_interval: Duration::from_secs(30),
            max_missed_pongs: 3,
        }
    }

    #[tokio::test]
    async fn queued_write_is_delivered_after_auth() {
        let ws_url = spawn_fake_host().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
        let handle = spawn_session(
            SessionEndpoint {
                host_id: "h1".to_string(),
                ws_url,
                token: "good".to_string(),
            },
            settings(),
            inbound_tx,
        );
        assert!(handle.send(WsMessage::terminal_write("p1", "echo hi")).await);

        let echoed = tokio::time::timeout(Duration::from_secs(5), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.kind, WsMessageType::TerminalData);
        assert_eq!(echoed.text_payload(), Some("echo hi"));

        handle.disconnect();
        assert_eq!(handle.join().await, Ok(()));
    }

    #[tokio::test]
    async fn rejected_token_ends_session_without_retry() {
        let ws_url = spawn_fake_host().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let handle = spawn_session(
            SessionEndpoint {
                host_id: "h1".to_string(),
                ws_url,
                token: "bad".to_string(),
            },
            settings(),
            inbound_tx,
        );
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert_eq!(result, Err(TransportError::AuthRejected));
    }

    #[tokio::test]
    async fn unreachable_host_gives_up_after_max_attempts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let handle = spawn_session(
            SessionEndpoint {
                host_id: "h1".to_string(),
                ws_url: format!("ws://{addr}/ws"),
                token: "good".to_string(),
            },
            settings(),
            inbound_tx,
        );
        let result = tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap();
        assert_eq!(result, Err(TransportError::GaveUp { attempts: 2 }));
    }

    /// 在升级前就以固定状态码拒绝的宿主机。
    async fn spawn_rejecting_host(status: StatusCode) -> String {
        let app = Router::new().route(
            "/ws",
            get(move || async move {
                let mut resp = status.into_response();
                if status == StatusCode::TOO_MANY_REQUESTS {
                    resp.headers_mut()
                        .insert(RETRY_AFTER, HeaderValue::from_static("900"));
                }
                resp
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("ws://{addr}/ws")
    }

    async fn join_against(ws_url: String) -> Result<(), TransportError> {
        let (inbound_tx, _inbound_rx) = mpsc::channel(8);
        let handle = spawn_session(
            SessionEndpoint {
                host_id: "h1".to_string(),
                ws_url,
                token: "good".to_string(),
            },
            TransportSettings {
                policy: ReconnectPolicy::new(Duration::from_millis(10), 3),
                ping_interval: Duration::from_secs(30),
                max_missed_pongs: 3,
            },
            inbound_tx,
        );
        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn upgrade_rejected_with_401_or_403_is_auth_failure() {
        let unauthorized = spawn_rejecting_host(StatusCode::UNAUTHORIZED).await;
        assert_eq!(
            join_against(unauthorized).await,
            Err(TransportError::AuthRejected)
        );
        let forbidden = spawn_rejecting_host(StatusCode::FORBIDDEN).await;
        assert_eq!(join_against(forbidden).await, Err(TransportError::AuthRejected));
    }

    #[tokio::test]
    async fn upgrade_rejected_with_429_reports_retry_after() {
        let limited = spawn_rejecting_host(StatusCode::TOO_MANY_REQUESTS).await;
        assert_eq!(
            join_against(limited).await,
            Err(TransportError::RateLimited {
                retry_after_sec: Some(900)
            })
        );
    }
}
