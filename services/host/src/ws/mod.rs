//! WebSocket 传输：消息编解码、会话决策与连接循环。

pub(crate) mod envelope;
pub(crate) mod handlers;
pub(crate) mod session;
