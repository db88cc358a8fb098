//! 宿主机身份：自签 TLS 证书与 TOFU 指纹。

pub(crate) mod certificate;
pub(crate) mod fingerprint;

pub(crate) use certificate::{IdentityError, IdentityStore};
