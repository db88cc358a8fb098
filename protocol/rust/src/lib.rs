// 文件职责：
// 1) 定义 host/companion 共用的 WS 消息信封与 HTTP 载荷结构。
// 2) 定义配对二维码载荷与 `termlink://pair` 链接的编解码。
// 3) 提供毫秒时间戳等跨端一致的基础函数。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

/// WS 握手子协议前缀：`Sec-WebSocket-Protocol: token-<value>`。
pub const TOKEN_SUBPROTOCOL_PREFIX: &str = "token-";
/// 配对链接 scheme。
pub const PAIRING_LINK_SCHEME: &str = "termlink";
/// 握手 nonce 有效期（秒）。
pub const HANDSHAKE_NONCE_TTL_SEC: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WsMessageType {
    #[serde(rename = "auth")]
    Auth,
    #[serde(rename = "auth:success")]
    AuthSuccess,
    #[serde(rename = "auth:failure")]
    AuthFailure,
    #[serde(rename = "subscribe")]
    Subscribe,
    #[serde(rename = "unsubscribe")]
    Unsubscribe,
    #[serde(rename = "terminal:data")]
    TerminalData,
    #[serde(rename = "terminal:exit")]
    TerminalExit,
    #[serde(rename = "terminal:write")]
    TerminalWrite,
    #[serde(rename = "terminal:resize")]
    TerminalResize,
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    // 消息类型。
    pub kind: WsMessageType,
    #[serde(rename = "ptyId", default, skip_serializing_if = "Option::is_none")]
    // 目标终端 ID（控制类消息可为空）。
    pub pty_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 消息负载。
    pub payload: Option<Value>,
    #[serde(default)]
    // 发送时间（unix 毫秒）。
    pub timestamp: i64,
}

impl WsMessage {
    /// 构造消息并自动填充时间戳。
    pub fn new(kind: WsMessageType, pty_id: Option<String>, payload: Option<Value>) -> Self {
        Self {
            kind,
            pty_id,
            payload,
            timestamp: now_millis(),
        }
    }

    /// 无终端、无负载的控制消息（ping/pong/auth:success）。
    pub fn control(kind: WsMessageType) -> Self {
        Self::new(kind, None, None)
    }

    /// `auth` 消息：携带 bearer token。
    pub fn auth(token: &str) -> Self {
        Self::new(
            WsMessageType::Auth,
            None,
            Some(serde_json::json!({ "token": token })),
        )
    }

    /// `terminal:data` 输出消息。
    pub fn terminal_data(pty_id: &str, data: &str) -> Self {
        Self::new(
            WsMessageType::TerminalData,
            Some(pty_id.to_string()),
            Some(Value::String(data.to_string())),
        )
    }

    /// `terminal:exit` 退出消息。
    pub fn terminal_exit(pty_id: &str, exit_code: Option<i32>) -> Self {
        Self::new(
            WsMessageType::TerminalExit,
            Some(pty_id.to_string()),
            Some(serde_json::json!({ "exitCode": exit_code })),
        )
    }

    /// `terminal:write` 输入消息。
    pub fn terminal_write(pty_id: &str, data: &str) -> Self {
        Self::new(
            WsMessageType::TerminalWrite,
            Some(pty_id.to_string()),
            Some(Value::String(data.to_string())),
        )
    }

    /// `terminal:resize` 消息。
    pub fn terminal_resize(pty_id: &str, cols: u16, rows: u16) -> Self {
        Self::new(
            WsMessageType::TerminalResize,
            Some(pty_id.to_string()),
            Some(serde_json::json!({ "cols": cols, "rows": rows })),
        )
    }

    /// `error` 消息。
    pub fn error(code: &str, message: &str) -> Self {
        Self::new(
            WsMessageType::Error,
            None,
            Some(serde_json::json!({ "code": code, "message": message })),
        )
    }

    /// 读取 `auth` 负载中的 token。
    pub fn auth_token(&self) -> Option<&str> {
        self.payload
            .as_ref()
            .and_then(|payload| payload.get("token"))
            .and_then(Value::as_str)
    }

    /// 读取文本负载（`terminal:data` / `terminal:write`），兼容 `{data}` 包裹。
    pub fn text_payload(&self) -> Option<&str> {
        match self.payload.as_ref()? {
            Value::String(text) => Some(text.as_str()),
            Value::Object(obj) => obj.get("data").and_then(Value::as_str),
            _ => None,
        }
    }

    /// 读取 resize 负载。
    pub fn resize_payload(&self) -> Option<(u16, u16)> {
        let payload = self.payload.as_ref()?;
        let cols = payload.get("cols").and_then(Value::as_u64)?;
        let rows = payload.get("rows").and_then(Value::as_u64)?;
        Some((
            u16::try_from(cols).ok()?.max(1),
            u16::try_from(rows).ok()?.max(1),
        ))
    }

    /// 序列化为 JSON 文本。
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    // 宿主机监听端口。
    pub port: u16,
    // 宿主机可达 IP 列表（局域网 / Tailscale）。
    pub ips: Vec<String>,
    // TOFU 身份指纹（32 位十六进制）。
    pub fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // TLS 证书指纹（sha256(DER) 十六进制，可选）。
    pub cert_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyHandshakeRequest {
    // 二维码中携带的一次性 nonce。
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifyHandshakeResponse {
    // nonce 是否有效（仅首次校验为 true）。
    pub valid: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 宿主机 TOFU 指纹（仅 valid 时返回）。
    pub fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WsTestResponse {
    // token 是否可用于 WS 升级。
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    // 宿主机地址（IP 或主机名）。
    pub host: String,
    // 宿主机端口。
    pub port: u16,
    // bearer token。
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 一次性握手 nonce。
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // nonce 过期时间（unix 毫秒）。
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 二维码内嵌的宿主机指纹，用于首配交叉校验。
    pub fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    // 宿主机展示名。
    pub name: Option<String>,
}

impl PairingPayload {
    /// 编码为 `termlink://pair?...` 链接（二维码内容）。
    pub fn to_link(&self) -> String {
        let mut link = match Url::parse(&format!("{PAIRING_LINK_SCHEME}://pair")) {
            Ok(url) => url,
            Err(_) => return String::new(),
        };
        {
            let mut pairs = link.query_pairs_mut();
            pairs.append_pair("host", &self.host);
            pairs.append_pair("port", &self.port.to_string());
            pairs.append_pair("token", &self.token);
            if let Some(nonce) = self.nonce.as_deref() {
                pairs.append_pair("nonce", nonce);
            }
            if let Some(expires_at) = self.expires_at {
                pairs.append_pair("expires", &expires_at.to_string());
            }
            if let Some(fp) = self.fingerprint.as_deref() {
                pairs.append_pair("fp", fp);
            }
            if let Some(name) = self.name.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                pairs.append_pair("name", name);
            }
        }
        link.to_string()
    }

    /// 解析配对链接或 JSON 载荷；字段缺失或格式错误时返回描述性错误。
    pub fn parse(raw: &str) -> Result<Self, String> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err("pairing payload is empty".to_string());
        }
        if trimmed.starts_with('{') {
            let parsed: PairingPayload =
                serde_json::from_str(trimmed).map_err(|err| format!("invalid json: {err}"))?;
            return parsed.validated();
        }

        let url = Url::parse(trimmed).map_err(|err| format!("invalid link: {err}"))?;
        if url.scheme() != PAIRING_LINK_SCHEME || url.host_str() != Some("pair") {
            return Err(format!("unsupported link: {}://{}", url.scheme(), url.host_str().unwrap_or_default()));
        }

        let mut payload = PairingPayload {
            host: String::new(),
            port: 0,
            token: String::new(),
            nonce: None,
            expires_at: None,
            fingerprint: None,
            name: None,
        };
        for (key, value) in url.query_pairs() {
            let value = value.trim().to_string();
            match key.as_ref() {
                "host" => payload.host = value,
                "port" => {
                    payload.port = value
                        .parse::<u16>()
                        .map_err(|_| format!("invalid port: {value}"))?
                }
                "token" => payload.token = value,
                "nonce" => payload.nonce = Some(value).filter(|v| !v.is_empty()),
                "expires" => payload.expires_at = value.parse::<i64>().ok(),
                "fp" => payload.fingerprint = Some(value).filter(|v| !v.is_empty()),
                "name" => payload.name = Some(value).filter(|v| !v.is_empty()),
                _ => {}
            }
        }
        payload.validated()
    }

    fn validated(self) -> Result<Self, String> {
        if self.host.trim().is_empty() {
            return Err("missing host".to_string());
        }
        if self.port == 0 {
            return Err("missing port".to_string());
        }
        if self.token.trim().is_empty() {
            return Err("missing token".to_string());
        }
        Ok(self)
    }
}

/// 当前 unix 毫秒。
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
