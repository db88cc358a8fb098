//! API 错误定义与响应转换。

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header::RETRY_AFTER},
    response::{IntoResponse, Response},
};
use serde_json::Value;

use super::response::ApiEnvelope;

/// 认证与接口错误。
#[derive(Debug)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    pub(crate) code: &'static str,
    pub(crate) message: String,
    pub(crate) suggestion: &'static str,
    /// 限流类错误的重试秒数，写入 `Retry-After`。
    pub(crate) retry_after_sec: Option<u64>,
}

impl ApiError {
    /// 构造统一 API 错误。
    pub(crate) fn new(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        suggestion: &'static str,
    ) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            suggestion,
            retry_after_sec: None,
        }
    }

    /// 缺少凭证（401）。
    pub(crate) fn missing_token() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            "MISSING_CREDENTIALS",
            "缺少访问令牌",
            "请重新扫码配对",
        )
    }

    /// 凭证无效（403）。
    pub(crate) fn invalid_token() -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "TOKEN_INVALID",
            "访问令牌无效",
            "请重新扫码配对",
        )
    }

    /// 鉴权失败次数过多被封禁（429）。
    pub(crate) fn auth_blocked(retry_after_sec: u64) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "AUTH_RATE_LIMITED",
            "鉴权失败次数过多，已临时封禁",
            "请稍后再试",
        )
        .with_retry_after(retry_after_sec)
    }

    /// 接口请求过于频繁（429）。
    pub(crate) fn endpoint_limited(retry_after_sec: u64) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "RATE_LIMITED",
            "请求过于频繁",
            "请稍后再试",
        )
        .with_retry_after(retry_after_sec)
    }

    /// 来源网络无权访问该接口（403）。
    pub(crate) fn access_denied(level: &str, ip_class: &str) -> Self {
        Self::new(
            StatusCode::FORBIDDEN,
            "ACCESS_DENIED",
            format!("{ip_class} 来源无权执行 {level} 级操作"),
            "请在宿主机本机或局域网内操作",
        )
    }

    /// 内部错误（500）。
    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_ERROR",
            message,
            "请稍后重试",
        )
    }

    /// 附带重试秒数。
    pub(crate) fn with_retry_after(mut self, retry_after_sec: u64) -> Self {
        self.retry_after_sec = Some(retry_after_sec.max(1));
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let retry_after = self.retry_after_sec;
        let body = Json(ApiEnvelope::<Value> {
            ok: false,
            code: self.code.to_string(),
            message: self.message,
            suggestion: self.suggestion.to_string(),
            data: None,
        });
        let mut response = (self.status, body).into_response();
        if let Some(sec) = retry_after
            && let Ok(value) = HeaderValue::from_str(&sec.to_string())
        {
            response.headers_mut().insert(RETRY_AFTER, value);
        }
        response
    }
}
