//! 配对：一次性 nonce、未鉴权的发现/握手接口与配对信息输出。

pub(crate) mod banner;
pub(crate) mod handlers;
pub(crate) mod nonce;
