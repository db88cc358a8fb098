//! 终端：输出分发中心、后端接口与 HTTP 处理器。

pub(crate) mod backend;
pub(crate) mod handlers;
pub(crate) mod hub;
