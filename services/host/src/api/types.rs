//! API 请求/响应类型与内部常量。

use serde::{Deserialize, Serialize};

/// token 查询参数（`/ws-test`、WS 升级 query 回退）。
#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenQuery {
    #[serde(default)]
    pub(crate) token: Option<String>,
}

/// 新建终端请求。
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TerminalCreateRequest {
    /// 覆盖默认 shell。
    #[serde(default)]
    pub(crate) shell: Option<String>,
    /// 工作目录。
    #[serde(default)]
    pub(crate) cwd: Option<String>,
    #[serde(default)]
    pub(crate) cols: Option<u16>,
    #[serde(default)]
    pub(crate) rows: Option<u16>,
}

/// 终端写入请求。
#[derive(Debug, Deserialize)]
pub(crate) struct TerminalWriteRequest {
    pub(crate) data: String,
}

/// 终端尺寸调整请求。
#[derive(Debug, Deserialize)]
pub(crate) struct TerminalResizeRequest {
    pub(crate) cols: u16,
    pub(crate) rows: u16,
}

/// 终端列表返回。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TerminalListData {
    pub(crate) terminals: Vec<crate::terminal::backend::TerminalInfo>,
}

/// 令牌探活返回。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AuthCheckData {
    pub(crate) client_ip: String,
    pub(crate) ip_class: String,
}

/// token 重新生成返回。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TokenRegenerateData {
    pub(crate) token: String,
    pub(crate) warning: String,
}

/// 身份重新生成返回。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct IdentityRegenerateData {
    pub(crate) fingerprint: String,
    pub(crate) cert_fingerprint: String,
    pub(crate) warning: String,
}

/// 配对二维码返回。
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairingQrData {
    pub(crate) link: String,
    pub(crate) payload: tl_shared_protocol::PairingPayload,
}

/// 终端高亮样式：重置。
pub(crate) const ANSI_RESET: &str = "\x1b[0m";
/// 终端高亮样式：粗体。
pub(crate) const ANSI_BOLD: &str = "\x1b[1m";
/// 终端高亮样式：青色。
pub(crate) const ANSI_CYAN: &str = "\x1b[36m";
/// 终端高亮样式：亮白。
pub(crate) const ANSI_WHITE: &str = "\x1b[97m";
/// 终端高亮样式：黄色（安全警告）。
pub(crate) const ANSI_YELLOW: &str = "\x1b[33m";
