//! 访问分级：按方法与路径确定所需级别，按来源网络判定是否放行。

use super::ip::IpClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl AccessLevel {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Admin => "admin",
        }
    }
}

const ADMIN_ROUTES: &[&str] = &[
    "/api/auth/regenerate-token",
    "/api/identity/regenerate",
    "/api/pairing/qr",
];

pub(crate) fn required_level(method: &str, path: &str) -> AccessLevel {
    let method = method.to_ascii_uppercase();
    let is_read_method = matches!(method.as_str(), "GET" | "HEAD" | "OPTIONS");

    if !is_read_method {
        if method == "POST" && ADMIN_ROUTES.contains(&path) {
            return AccessLevel::Admin;
        }
        // 未知的变更类方法一律按 write 处理。
        return AccessLevel::Write;
    }

    if path == "/ws" || is_pty_stream(path) {
        return AccessLevel::Write;
    }
    AccessLevel::Read
}

pub(crate) fn is_allowed(class: IpClass, level: AccessLevel) -> bool {
    match level {
        AccessLevel::Read => true,
        AccessLevel::Write => matches!(class, IpClass::Localhost | IpClass::LocalNetwork),
        AccessLevel::Admin => class == IpClass::Localhost,
    }
}

/// `/api/pty/{id}/stream`。
fn is_pty_stream(path: &str) -> bool {
    path.strip_prefix("/api/pty/")
        .and_then(|rest| rest.strip_suffix("/stream"))
        .is_some_and(|id| !id.is_empty() && !id.contains('/'))
}
