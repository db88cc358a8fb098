//! 客户端传输：重连退避、连接状态机与基于 tokio-tungstenite 的会话驱动。

pub(crate) mod backoff;
pub(crate) mod machine;
pub(crate) mod session;
