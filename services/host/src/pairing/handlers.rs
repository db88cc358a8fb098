//! 配对与探活接口：`/health`、`/connect`、`/verify-handshake`、`/ws-test`、`/api/pairing/qr`。

use axum::{
    Json,
    extract::{Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tl_shared_protocol::{
    ConnectInfo, VerifyHandshakeRequest, VerifyHandshakeResponse, WsTestResponse,
};
use tracing::{info, warn};

use crate::{
    api::{
        error::ApiError,
        response::{ApiEnvelope, ok_response},
        types::{PairingQrData, TokenQuery},
    },
    auth::middleware::ClientAddr,
    state::AppState,
};

/// 存活探针。
pub(crate) async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true,
        "service": "tl-host",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// 发现接口：端口、可达地址与 TOFU 指纹。
pub(crate) async fn connect_handler(State(state): State<AppState>) -> Json<ConnectInfo> {
    let cert_fingerprint = match state.cert_fingerprint().await {
        Ok(fp) => Some(fp),
        Err(err) => {
            warn!("certificate fingerprint unavailable: {err}");
            None
        }
    };
    Json(ConnectInfo {
        port: state.config.listen_addr.port(),
        ips: state.advertised_ips(),
        fingerprint: state.server_fingerprint(),
        cert_fingerprint,
    })
}

/// 校验二维码 nonce；失败计入鉴权限流。
pub(crate) async fn verify_handshake_handler(
    State(state): State<AppState>,
    client: ClientAddr,
    body: Result<Json<VerifyHandshakeRequest>, JsonRejection>,
) -> Response {
    let ip = client.ip.to_string();
    let check = state.auth_limiter.check(&ip).await;
    if !check.allowed {
        return ApiError::auth_blocked(check.retry_after_sec.unwrap_or(1)).into_response();
    }
    // 畸形请求体按无效 nonce 处理，同样计入失败次数。
    let nonce = match body {
        Ok(Json(req)) => Some(req.nonce),
        Err(rejection) => {
            warn!(ip = %ip, "handshake body rejected: {rejection}");
            None
        }
    };
    let verified = match nonce {
        Some(nonce) => state.nonces.verify(nonce.trim()).await,
        None => false,
    };
    if verified {
        info!(ip = %ip, "handshake nonce verified");
        return Json(VerifyHandshakeResponse {
            valid: true,
            fingerprint: Some(state.server_fingerprint()),
        })
        .into_response();
    }
    state.auth_limiter.record_failure(&ip).await;
    warn!(ip = %ip, "handshake nonce rejected");
    (
        StatusCode::FORBIDDEN,
        Json(VerifyHandshakeResponse {
            valid: false,
            fingerprint: None,
        }),
    )
        .into_response()
}

/// WS 升级前的 token 预检。
pub(crate) async fn ws_test_handler(
    State(state): State<AppState>,
    client: ClientAddr,
    Query(query): Query<TokenQuery>,
) -> Response {
    let ip = client.ip.to_string();
    let check = state.auth_limiter.check(&ip).await;
    if !check.allowed {
        return ApiError::auth_blocked(check.retry_after_sec.unwrap_or(1)).into_response();
    }
    let token = query.token.unwrap_or_default();
    if !token.trim().is_empty() && state.token_matches(&token).await {
        state.auth_limiter.clear(&ip).await;
        return Json(WsTestResponse { valid: true }).into_response();
    }
    state.auth_limiter.record_failure(&ip).await;
    (StatusCode::UNAUTHORIZED, Json(WsTestResponse { valid: false })).into_response()
}

/// 签发新 nonce 并返回配对链接（仅本机）。
pub(crate) async fn pairing_qr_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<ApiEnvelope<PairingQrData>>) {
    let payload = state.pairing_payload().await;
    ok_response(
        "配对链接已生成",
        PairingQrData {
            link: payload.to_link(),
            payload,
        },
    )
}
