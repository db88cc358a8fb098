//! 请求守卫：来源解析 → 鉴权限流 → token → 访问分级 → 接口限流。

use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{
        HeaderMap, HeaderValue, StatusCode, Uri,
        header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tl_shared_protocol::TOKEN_SUBPROTOCOL_PREFIX;
use tracing::{debug, warn};

use super::{
    access::{is_allowed, required_level},
    ip::{IpClass, classify, resolve_client_ip},
};
use crate::{api::error::ApiError, state::AppState};

/// 解析后的客户端来源。
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientAddr {
    pub(crate) ip: IpAddr,
    pub(crate) class: IpClass,
}

impl<S> FromRequestParts<S> for ClientAddr
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(client_addr(&parts.extensions, &parts.headers))
    }
}

/// 缺少连接信息时按未指定地址处理（归为 public）。
fn client_addr(extensions: &axum::http::Extensions, headers: &HeaderMap) -> ClientAddr {
    let peer = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok());
    let ip = resolve_client_ip(peer, forwarded);
    ClientAddr {
        ip,
        class: classify(ip),
    }
}

/// 守卫写入请求扩展，供后续处理器读取。
#[derive(Debug, Clone, Copy)]
pub(crate) struct GuardOutcome {
    pub(crate) client: ClientAddr,
    /// WS 升级时是否已在握手阶段完成鉴权。
    pub(crate) authenticated: bool,
}

/// token 来源。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PresentedToken {
    Bearer(String),
    Subprotocol(String),
    Query(String),
}

impl PresentedToken {
    pub(crate) fn value(&self) -> &str {
        match self {
            Self::Bearer(value) | Self::Subprotocol(value) | Self::Query(value) => value,
        }
    }
}

/// 依次尝试 `Authorization: Bearer`、`Sec-WebSocket-Protocol: token-*`、`?token=`。
pub(crate) fn presented_token(headers: &HeaderMap, uri: &Uri) -> Option<PresentedToken> {
    if let Some(value) = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.trim().strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return Some(PresentedToken::Bearer(value.to_string()));
    }
    if let Some(value) = subprotocol_token(headers) {
        return Some(PresentedToken::Subprotocol(value));
    }
    query_token(uri).map(PresentedToken::Query)
}

pub(crate) fn subprotocol_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|raw| raw.split(','))
        .map(str::trim)
        .find_map(|item| item.strip_prefix(TOKEN_SUBPROTOCOL_PREFIX))
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn query_token(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "token")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// WS 升级路径：允许无 token 升级，由首条 `auth` 消息完成鉴权。
pub(crate) fn is_ws_upgrade_path(path: &str) -> bool {
    path == "/ws" || (path.starts_with("/api/pty/") && path.ends_with("/stream"))
}

/// 受保护路由的统一守卫。
pub(crate) async fn guard(
    State(state): State<AppState>,
    client: ClientAddr,
    mut request: Request,
    next: Next,
) -> Response {
    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let ip = client.ip.to_string();

    let check = state.auth_limiter.check(&ip).await;
    if !check.allowed {
        debug!(ip = %ip, path = %path, "request rejected by auth limiter");
        return ApiError::auth_blocked(check.retry_after_sec.unwrap_or(1)).into_response();
    }

    let ws_path = is_ws_upgrade_path(&path);
    let authenticated = match presented_token(request.headers(), request.uri()) {
        Some(token) if state.token_matches(token.value()).await => {
            state.auth_limiter.clear(&ip).await;
            true
        }
        Some(_) => {
            state.auth_limiter.record_failure(&ip).await;
            warn!(ip = %ip, path = %path, "invalid token presented");
            // WS 握手阶段 token 不匹配按 401 拒绝升级。
            return if ws_path {
                ApiError::new(
                    StatusCode::UNAUTHORIZED,
                    "TOKEN_INVALID",
                    "访问令牌无效",
                    "请重新扫码配对",
                )
                .into_response()
            } else {
                ApiError::invalid_token().into_response()
            };
        }
        None if ws_path => false,
        None => return ApiError::missing_token().into_response(),
    };

    let level = required_level(&method, &path);
    if !is_allowed(client.class, level) {
        warn!(ip = %ip, path = %path, level = level.as_str(), "access denied for network class");
        return ApiError::access_denied(level.as_str(), client.class.as_str()).into_response();
    }

    let decision = state
        .endpoint_limiter
        .check_and_consume(&ip, &method, &path)
        .await;
    if !decision.allowed {
        debug!(ip = %ip, path = %path, limit = decision.limit, "endpoint rate limited");
        return ApiError::endpoint_limited(decision.retry_after_sec()).into_response();
    }

    request.extensions_mut().insert(GuardOutcome {
        client,
        authenticated,
    });
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(decision.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(decision.remaining));
    response
}
