//! WS 消息编解码与日志摘要。

use axum::extract::ws::Message;
use tl_shared_protocol::{WsMessage, WsMessageType};

use crate::terminal::hub::HubEvent;

/// 解析上行文本帧。
pub(crate) fn parse_client_message(raw: &str) -> Result<WsMessage, String> {
    serde_json::from_str::<WsMessage>(raw).map_err(|err| err.to_string())
}

/// 终端事件转下行消息。
pub(crate) fn hub_event_message(event: &HubEvent) -> WsMessage {
    match event {
        HubEvent::Data { pty_id, data } => WsMessage::terminal_data(pty_id, data),
        HubEvent::Exit { pty_id, exit_code } => WsMessage::terminal_exit(pty_id, *exit_code),
    }
}

pub(crate) fn to_frame(msg: &WsMessage) -> Message {
    Message::Text(msg.to_json().into())
}

/// `auth:failure` 下行消息。
pub(crate) fn auth_failure(code: &str, message: &str) -> WsMessage {
    WsMessage::new(
        WsMessageType::AuthFailure,
        None,
        Some(serde_json::json!({ "code": code, "message": message })),
    )
}

/// 日志摘要：不打印终端内容。
pub(crate) fn summarize(msg: &WsMessage) -> String {
    let kind = serde_json::to_value(msg.kind)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_default();
    match msg.pty_id.as_deref() {
        Some(pty_id) => format!("{kind} pty={pty_id}"),
        None => kind,
    }
}
