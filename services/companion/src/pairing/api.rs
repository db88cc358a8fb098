//! 宿主机 HTTP 接口客户端：`/connect`、`/verify-handshake`、`/ws-test`。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url, header::RETRY_AFTER};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tl_shared_protocol::{ConnectInfo, VerifyHandshakeRequest, VerifyHandshakeResponse};

use crate::hosts::PairedHost;

/// 接口调用错误；连接失败、鉴权拒绝、限流彼此区分。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum ApiCallError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("token rejected")]
    Unauthorized,
    #[error("rate limited")]
    RateLimited { retry_after_sec: Option<u64> },
    #[error("unexpected response: {0}")]
    Unexpected(String),
}

/// 配对流程依赖的宿主机接口。
#[async_trait]
pub(crate) trait HostApi: Send + Sync {
    /// 读取宿主机端口、地址与 TOFU 指纹。
    async fn connect_info(&self, host: &PairedHost) -> Result<ConnectInfo, ApiCallError>;

    /// 校验一次性 nonce；无效 nonce 返回 `valid: false` 而非错误。
    async fn verify_handshake(
        &self,
        host: &PairedHost,
        nonce: &str,
    ) -> Result<VerifyHandshakeResponse, ApiCallError>;

    /// WS 升级前的 token 预检。
    async fn ws_test(&self, host: &PairedHost) -> Result<(), ApiCallError>;
}

/// 基于 reqwest 的实现。
#[derive(Debug, Clone)]
pub(crate) struct ReqwestHostApi {
    client: reqwest::Client,
}

impl ReqwestHostApi {
    pub(crate) fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HostApi for ReqwestHostApi {
    async fn connect_info(&self, host: &PairedHost) -> Result<ConnectInfo, ApiCallError> {
        let url = endpoint(host, "connect")?;
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ApiCallError::Unreachable(err.to_string()))?;
        match resp.status() {
            status if status.is_success() => decode(resp).await,
            StatusCode::TOO_MANY_REQUESTS => Err(rate_limited(&resp)),
            status => Err(ApiCallError::Unexpected(format!("/connect returned {status}"))),
        }
    }

    async fn verify_handshake(
        &self,
        host: &PairedHost,
        nonce: &str,
    ) -> Result<VerifyHandshakeResponse, ApiCallError> {
        let url = endpoint(host, "verify-handshake")?;
        let resp = self
            .client
            .post(url)
            .json(&VerifyHandshakeRequest {
                nonce: nonce.to_string(),
            })
            .send()
            .await
            .map_err(|err| ApiCallError::Unreachable(err.to_string()))?;
        match resp.status() {
            StatusCode::OK | StatusCode::FORBIDDEN => decode(resp).await,
            StatusCode::TOO_MANY_REQUESTS => Err(rate_limited(&resp)),
            status => Err(ApiCallError::Unexpected(format!(
                "/verify-handshake returned {status}"
            ))),
        }
    }

    async fn ws_test(&self, host: &PairedHost) -> Result<(), ApiCallError> {
        let mut url = endpoint(host, "ws-test")?;
        url.query_pairs_mut().append_pair("token", &host.token);
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| ApiCallError::Unreachable(err.to_string()))?;
        match resp.status() {
            status if status.is_success() => Ok(()),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ApiCallError::Unauthorized),
            StatusCode::TOO_MANY_REQUESTS => Err(rate_limited(&resp)),
            status => Err(ApiCallError::Unexpected(format!("/ws-test returned {status}"))),
        }
    }
}

fn endpoint(host: &PairedHost, path: &str) -> Result<Url, ApiCallError> {
    Url::parse(&format!("{}/{path}", host.http_base()))
        .map_err(|err| ApiCallError::Unexpected(format!("invalid host address: {err}")))
}

fn rate_limited(resp: &reqwest::Response) -> ApiCallError {
    let retry_after_sec = resp
        .headers()
        .get(RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    ApiCallError::RateLimited { retry_after_sec }
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ApiCallError> {
    resp.json::<T>()
        .await
        .map_err(|err| ApiCallError::Unexpected(format!("decode body failed: {err}")))
}
