//! 鉴权相关接口：令牌探活、令牌轮换、身份轮换。

use axum::{
    Extension, Json,
    extract::State,
    http::StatusCode,
};
use tracing::warn;

use super::middleware::GuardOutcome;
use crate::{
    api::{
        error::ApiError,
        response::{ApiEnvelope, ok_response},
        types::{AuthCheckData, IdentityRegenerateData, TokenRegenerateData},
    },
    pairing::banner::print_rotation_warning,
    state::AppState,
};

type ApiResult<T> = Result<(StatusCode, Json<ApiEnvelope<T>>), ApiError>;

/// 已通过守卫即代表 token 有效。
pub(crate) async fn auth_check_handler(
    Extension(outcome): Extension<GuardOutcome>,
) -> (StatusCode, Json<ApiEnvelope<AuthCheckData>>) {
    ok_response(
        "令牌有效",
        AuthCheckData {
            client_ip: outcome.client.ip.to_string(),
            ip_class: outcome.client.class.as_str().to_string(),
        },
    )
}

pub(crate) async fn regenerate_token_handler(
    State(state): State<AppState>,
) -> ApiResult<TokenRegenerateData> {
    let token = state
        .regenerate_token()
        .await
        .map_err(|err| ApiError::internal(format!("重新生成令牌失败: {err}")))?;
    print_rotation_warning("访问令牌");
    Ok(ok_response(
        "令牌已重新生成",
        TokenRegenerateData {
            token,
            warning: "所有已配对设备需要重新扫码配对".to_string(),
        },
    ))
}

pub(crate) async fn regenerate_identity_handler(
    State(state): State<AppState>,
) -> ApiResult<IdentityRegenerateData> {
    let (cert_fingerprint, fingerprint) = state.regenerate_identity().await.map_err(|err| {
        warn!("identity regeneration failed: {err}");
        ApiError::internal(format!("重新生成身份失败: {err}"))
    })?;
    print_rotation_warning("宿主机身份");
    Ok(ok_response(
        "身份已重新生成",
        IdentityRegenerateData {
            fingerprint,
            cert_fingerprint,
            warning: "已钉扎旧指纹的设备会收到身份不一致警告，需要重新确认".to_string(),
        },
    ))
}
