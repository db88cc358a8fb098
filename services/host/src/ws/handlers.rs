//! WebSocket 握手入口与连接循环。

use std::time::Duration;

use axum::{
    Extension,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tl_shared_protocol::{TOKEN_SUBPROTOCOL_PREFIX, WsMessage, WsMessageType};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    envelope::{auth_failure, hub_event_message, summarize, to_frame},
    session::{SessionAction, SessionState, handle_client_message},
};
use crate::{
    auth::middleware::{GuardOutcome, subprotocol_token},
    state::AppState,
    terminal::hub::HubEvent,
};

/// 单连接下行队列容量。
const WS_WRITE_QUEUE_CAPACITY: usize = 512;
/// 单连接终端事件队列容量（满时丢弃新 chunk）。
const HUB_QUEUE_CAPACITY: usize = 256;
/// 关闭前等待下行队列排空的时间。
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// `GET /ws`：多路复用连接。
pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(outcome): Extension<GuardOutcome>,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, state, outcome, &headers, None)
}

/// `GET /api/pty/{id}/stream`：单终端直连，鉴权后自动订阅。
pub(crate) async fn pty_stream_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(outcome): Extension<GuardOutcome>,
    Path(pty_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    upgrade(ws, state, outcome, &headers, Some(pty_id))
}

/// 握手阶段已由守卫校验 token；子协议携带的 token 需原样回显。
fn upgrade(
    ws: WebSocketUpgrade,
    state: AppState,
    outcome: GuardOutcome,
    headers: &HeaderMap,
    pinned: Option<String>,
) -> Response {
    let ws = match subprotocol_token(headers) {
        Some(token) => ws.protocols([format!("{TOKEN_SUBPROTOCOL_PREFIX}{token}")]),
        None => ws,
    };
    ws.on_upgrade(move |socket| handle_socket(state, socket, outcome, pinned))
}

async fn handle_socket(
    state: AppState,
    socket: WebSocket,
    outcome: GuardOutcome,
    pinned: Option<String>,
) {
    let session_id = Uuid::new_v4();
    let ip = outcome.client.ip.to_string();
    let (mut ws_sender, mut ws_reader) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Message>(WS_WRITE_QUEUE_CAPACITY);
    let (hub_tx, mut hub_rx) = mpsc::channel::<HubEvent>(HUB_QUEUE_CAPACITY);
    let mut token_rx = state.token_changes();

    let writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if ws_sender.send(msg).await.is_err() || closing {
                break;
            }
        }
    });

    let mut session = SessionState::new(outcome.authenticated, pinned);
    info!(session = %session_id, ip = %ip, pinned = ?session.pinned, pre_auth = session.authenticated, "ws connected");
    if session.authenticated {
        on_authenticated(&state, &mut session, session_id, &out_tx, &hub_tx).await;
    }

    loop {
        tokio::select! {
            next = ws_reader.next() => {
                let text = match next {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(session = %session_id, "ws read error: {err}");
                        break;
                    }
                };
                let actions = handle_client_message(&session, text.as_str());
                let keep_open = apply_actions(
                    &state, &mut session, session_id, &ip, actions, &out_tx, &hub_tx,
                )
                .await;
                if !keep_open {
                    break;
                }
            }
            Some(event) = hub_rx.recv() => {
                if out_tx.send(to_frame(&hub_event_message(&event))).await.is_err() {
                    break;
                }
            }
            Ok(()) = token_rx.changed() => {
                // 旧 token 换来的会话随轮换失效。
                if session.authenticated {
                    info!(session = %session_id, ip = %ip, "token rotated, closing ws session");
                    send_auth_failure(&out_tx, "TOKEN_ROTATED", "token was regenerated").await;
                    break;
                }
            }
        }
    }

    state.hub.unsubscribe_all(session_id).await;
    drop(out_tx);
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, writer).await.is_err() {
        debug!(session = %session_id, "ws writer drain timed out");
    }
    info!(session = %session_id, ip = %ip, "ws disconnected");
}

/// 执行会话动作；返回 false 表示需要关闭连接。
async fn apply_actions(
    state: &AppState,
    session: &mut SessionState,
    session_id: Uuid,
    ip: &str,
    actions: Vec<SessionAction>,
    out_tx: &mpsc::Sender<Message>,
    hub_tx: &mpsc::Sender<HubEvent>,
) -> bool {
    for action in actions {
        match action {
            SessionAction::Reply(msg) => {
                debug!(session = %session_id, "ws reply {}", summarize(&msg));
                if out_tx.send(to_frame(&msg)).await.is_err() {
                    return false;
                }
            }
            SessionAction::Authenticate(token) => {
                let check = state.auth_limiter.check(ip).await;
                if !check.allowed {
                    send_auth_failure(out_tx, "AUTH_RATE_LIMITED", "too many failed attempts").await;
                    return false;
                }
                if !state.token_matches(&token).await {
                    state.auth_limiter.record_failure(ip).await;
                    warn!(session = %session_id, ip, "ws auth rejected");
                    send_auth_failure(out_tx, "TOKEN_INVALID", "invalid token").await;
                    return false;
                }
                state.auth_limiter.clear(ip).await;
                session.authenticated = true;
                let ok = WsMessage::control(WsMessageType::AuthSuccess);
                if out_tx.send(to_frame(&ok)).await.is_err() {
                    return false;
                }
                on_authenticated(state, session, session_id, out_tx, hub_tx).await;
            }
            SessionAction::Subscribe(pty_id) => {
                subscribe(state, session, session_id, &pty_id, out_tx, hub_tx).await;
            }
            SessionAction::Unsubscribe(pty_id) => {
                state.hub.unsubscribe(&pty_id, session_id).await;
                session.subscriptions.remove(&pty_id);
            }
            SessionAction::Write { pty_id, data } => {
                if let Err(err) = state.backend.write(&pty_id, &data).await {
                    let msg = WsMessage::error("TERMINAL_WRITE_FAILED", &err.to_string());
                    let _ = out_tx.send(to_frame(&msg)).await;
                }
            }
            SessionAction::Resize { pty_id, cols, rows } => {
                if let Err(err) = state.backend.resize(&pty_id, cols, rows).await {
                    let msg = WsMessage::error("TERMINAL_RESIZE_FAILED", &err.to_string());
                    let _ = out_tx.send(to_frame(&msg)).await;
                }
            }
        }
    }
    true
}

/// 单终端连接鉴权后自动订阅。
async fn on_authenticated(
    state: &AppState,
    session: &mut SessionState,
    session_id: Uuid,
    out_tx: &mpsc::Sender<Message>,
    hub_tx: &mpsc::Sender<HubEvent>,
) {
    if let Some(pty_id) = session.pinned.clone() {
        subscribe(state, session, session_id, &pty_id, out_tx, hub_tx).await;
    }
}

/// 订阅并先行下发积压输出，保证顺序在实时输出之前。
async fn subscribe(
    state: &AppState,
    session: &mut SessionState,
    session_id: Uuid,
    pty_id: &str,
    out_tx: &mpsc::Sender<Message>,
    hub_tx: &mpsc::Sender<HubEvent>,
) {
    match state.hub.subscribe(pty_id, session_id, hub_tx.clone()).await {
        Some(backlog) => {
            session.subscriptions.insert(pty_id.to_string());
            debug!(session = %session_id, pty_id, backlog = backlog.len(), "subscribed");
            for event in backlog {
                if out_tx.send(to_frame(&hub_event_message(&event))).await.is_err() {
                    return;
                }
            }
        }
        None => {
            let msg = WsMessage::error("TERMINAL_NOT_FOUND", &format!("terminal not found: {pty_id}"));
            let _ = out_tx.send(to_frame(&msg)).await;
        }
    }
}

async fn send_auth_failure(out_tx: &mpsc::Sender<Message>, code: &str, message: &str) {
    let _ = out_tx.send(to_frame(&auth_failure(code, message))).await;
    let _ = out_tx.send(Message::Close(None)).await;
}
