//! 服务端会话决策：给定会话状态与上行消息，产出待执行动作。
//!
//! 纯函数，不触碰网络与共享状态，便于逐条验证协议行为。

use std::collections::HashSet;

use tl_shared_protocol::{WsMessage, WsMessageType};

use super::envelope::parse_client_message;

/// 单连接会话状态。
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) authenticated: bool,
    pub(crate) subscriptions: HashSet<String>,
    /// `/api/pty/{id}/stream` 绑定的终端；未指定 ptyId 的消息落到该终端。
    pub(crate) pinned: Option<String>,
}

impl SessionState {
    pub(crate) fn new(authenticated: bool, pinned: Option<String>) -> Self {
        Self {
            authenticated,
            subscriptions: HashSet::new(),
            pinned,
        }
    }
}

/// 会话动作。
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SessionAction {
    Reply(WsMessage),
    Authenticate(String),
    Subscribe(String),
    Unsubscribe(String),
    Write { pty_id: String, data: String },
    Resize { pty_id: String, cols: u16, rows: u16 },
}

pub(crate) fn handle_client_message(state: &SessionState, raw: &str) -> Vec<SessionAction> {
    let msg = match parse_client_message(raw) {
        Ok(msg) => msg,
        Err(err) => {
            return vec![reply_error("BAD_MESSAGE", &format!("invalid message: {err}"))];
        }
    };

    if msg.kind == WsMessageType::Ping {
        return vec![SessionAction::Reply(WsMessage::control(WsMessageType::Pong))];
    }

    if !state.authenticated {
        return match msg.kind {
            WsMessageType::Auth => {
                vec![SessionAction::Authenticate(
                    msg.auth_token().unwrap_or_default().to_string(),
                )]
            }
            _ => vec![reply_error("AUTH_REQUIRED", "send auth first")],
        };
    }

    let target = msg.pty_id.clone().or_else(|| state.pinned.clone());
    match msg.kind {
        WsMessageType::Auth => vec![SessionAction::Reply(WsMessage::control(
            WsMessageType::AuthSuccess,
        ))],
        WsMessageType::Subscribe => match target {
            Some(pty_id) if state.subscriptions.contains(&pty_id) => Vec::new(),
            Some(pty_id) => vec![SessionAction::Subscribe(pty_id)],
            None => vec![reply_error("MISSING_PTY_ID", "subscribe requires ptyId")],
        },
        WsMessageType::Unsubscribe => match target {
            Some(pty_id) => vec![SessionAction::Unsubscribe(pty_id)],
            None => vec![reply_error("MISSING_PTY_ID", "unsubscribe requires ptyId")],
        },
        WsMessageType::TerminalWrite => match (target, msg.text_payload()) {
            (Some(pty_id), Some(data)) => vec![SessionAction::Write {
                pty_id,
                data: data.to_string(),
            }],
            _ => vec![reply_error("BAD_MESSAGE", "terminal:write requires ptyId and data")],
        },
        WsMessageType::TerminalResize => match (target, msg.resize_payload()) {
            (Some(pty_id), Some((cols, rows))) => {
                vec![SessionAction::Resize { pty_id, cols, rows }]
            }
            _ => vec![reply_error(
                "BAD_MESSAGE",
                "terminal:resize requires ptyId, cols and rows",
            )],
        },
        // 客户端回应的 pong 无需处理。
        WsMessageType::Pong => Vec::new(),
        _ => vec![reply_error("UNSUPPORTED", "unsupported message type")],
    }
}

fn reply_error(code: &str, message: &str) -> SessionAction {
    SessionAction::Reply(WsMessage::error(code, message))
}

#[cfg(test)]
mod tests {
    use tl_shared_protocol::{WsMessage, WsMessageType};

    use super::{SessionAction, SessionState, handle_client_message};

    fn reply_kind(actions: &[SessionAction]) -> Option<WsMessageType> {
        match actions {
            [SessionAction::Reply(msg)] => Some(msg.kind),
            _ => None,
        }
    }

    #[test]
    fn unauthenticated_session_only_accepts_auth_and_ping() {
        let state = SessionState::default();
        let actions = handle_client_message(&state, &WsMessage::auth("tok").to_json());
        assert_eq!(actions, vec![SessionAction::Authenticate("tok".to_string())]);

        let ping = WsMessage::control(WsMessageType::Ping).to_json();
        assert_eq!(reply_kind(&handle_client_message(&state, &ping)), Some(WsMessageType::Pong));

        let write = WsMessage::terminal_write("p1", "ls\n").to_json();
        assert_eq!(reply_kind(&handle_client_message(&state, &write)), Some(WsMessageType::Error));
    }

    #[test]
    fn authenticated_session_routes_terminal_operations() {
        let mut state = SessionState::new(true, None);
        let sub = r#"{"type":"subscribe","ptyId":"p1","timestamp":0}"#;
        assert_eq!(
            handle_client_message(&state, sub),
            vec![SessionAction::Subscribe("p1".to_string())]
        );
        state.subscriptions.insert("p1".to_string());
        assert!(handle_client_message(&state, sub).is_empty());

        assert_eq!(
            handle_client_message(&state, &WsMessage::terminal_write("p1", "ls\n").to_json()),
            vec![SessionAction::Write {
                pty_id: "p1".to_string(),
                data: "ls\n".to_string()
            }]
        );
        assert_eq!(
            handle_client_message(&state, &WsMessage::terminal_resize("p1", 100, 30).to_json()),
            vec![SessionAction::Resize {
                pty_id: "p1".to_string(),
                cols: 100,
                rows: 30
            }]
        );
        assert_eq!(
            reply_kind(&handle_client_message(&state, &WsMessage::auth("x").to_json())),
            Some(WsMessageType::AuthSuccess)
        );
    }

    #[test]
    fn pinned_stream_defaults_pty_id() {
        let state = SessionState::new(true, Some("p9".to_string()));
        let raw = r#"{"type":"terminal:write","payload":"pwd\n","timestamp":0}"#;
        assert_eq!(
            handle_client_message(&state, raw),
            vec![SessionAction::Write {
                pty_id: "p9".to_string(),
                data: "pwd\n".to_string()
            }]
        );
    }

    #[test]
    fn malformed_and_incomplete_messages_yield_errors() {
        let state = SessionState::new(true, None);
        assert_eq!(reply_kind(&handle_client_message(&state, "nope")), Some(WsMessageType::Error));
        let sub = r#"{"type":"subscribe","timestamp":0}"#;
        assert_eq!(reply_kind(&handle_client_message(&state, sub)), Some(WsMessageType::Error));
        let server_only = WsMessage::terminal_data("p1", "x").to_json();
        assert_eq!(
            reply_kind(&handle_client_message(&state, &server_only)),
            Some(WsMessageType::Error)
        );
    }
}
