//! 配对：宿主机接口客户端与连接状态机。

pub(crate) mod api;
pub(crate) mod protocol;
