//! 鉴权与访问控制：令牌保管、限流、来源分级与请求守卫。

pub(crate) mod access;
pub(crate) mod auth_limiter;
pub(crate) mod endpoint_limiter;
pub(crate) mod handlers;
pub(crate) mod ip;
pub(crate) mod middleware;
pub(crate) mod token_vault;
