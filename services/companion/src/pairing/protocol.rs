//! 配对协议状态机：
//! 1. 消费二维码 nonce（失败只记日志，不阻断连接）。
//! 2. 每次连接都比对宿主机指纹：首次固定（TOFU），不一致即硬停止。
//! 3. 升级 WS 前做 token 预检，区分不可达、鉴权拒绝与限流。

use std::sync::Arc;

use thiserror::Error;
use tl_shared_protocol::{PairingPayload, now_millis};
use tracing::{debug, info, warn};

use super::api::{ApiCallError, HostApi};
use crate::hosts::{PairedHost, PairedHostStore};

/// 连接状态。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PairingState {
    Disconnected,
    Connecting,
    Verifying,
    Connected,
    Error(PairingError),
}

/// 面向用户的连接错误。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum PairingError {
    #[error("host unreachable: {0}")]
    Unreachable(String),
    #[error("access token rejected by host; pair again")]
    AuthRejected,
    #[error("host identity changed (pinned {expected}, presented {actual}); run accept-fingerprint to trust it")]
    FingerprintMismatch { expected: String, actual: String },
    #[error("rate limited by host{}", retry_hint(*retry_after_sec))]
    RateLimited { retry_after_sec: Option<u64> },
    #[error("unknown host id: {0}")]
    UnknownHost(String),
    #[error("invalid pairing link: {0}")]
    InvalidLink(String),
    #[error("{0}")]
    Other(String),
}

fn retry_hint(retry_after_sec: Option<u64>) -> String {
    retry_after_sec
        .map(|sec| format!(", retry in {sec}s"))
        .unwrap_or_default()
}

impl From<ApiCallError> for PairingError {
    fn from(err: ApiCallError) -> Self {
        match err {
            ApiCallError::Unreachable(reason) => PairingError::Unreachable(reason),
            ApiCallError::Unauthorized => PairingError::AuthRejected,
            ApiCallError::RateLimited { retry_after_sec } => {
                PairingError::RateLimited { retry_after_sec }
            }
            ApiCallError::Unexpected(reason) => PairingError::Other(reason),
        }
    }
}

/// 连接成功后交给传输层的端点。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionEndpoint {
    pub(crate) host_id: String,
    pub(crate) ws_url: String,
    pub(crate) token: String,
}

/// 配对协议：持有宿主机列表与接口客户端。
pub(crate) struct PairingProtocol {
    api: Arc<dyn HostApi>,
    store: PairedHostStore,
    state: PairingState,
}

impl PairingProtocol {
    pub(crate) fn new(api: Arc<dyn HostApi>, store: PairedHostStore) -> Self {
        Self {
            api,
            store,
            state: PairingState::Disconnected,
        }
    }

    pub(crate) fn state(&self) -> &PairingState {
        &self.state
    }

    pub(crate) fn hosts(&self) -> &[PairedHost] {
        self.store.list()
    }

    /// 解析配对链接 / JSON 载荷并保存为已配对宿主机。
    pub(crate) fn add_from_link(&mut self, link: &str) -> Result<PairedHost, PairingError> {
        let payload = PairingPayload::parse(link).map_err(PairingError::InvalidLink)?;
        let host = self.store.upsert(PairedHost::from_payload(payload));
        self.persist()?;
        info!(host_id = %host.id, addr = %host.authority(), "paired host saved");
        Ok(host)
    }

    /// 删除已配对宿主机。
    pub(crate) fn forget(&mut self, host_id: &str) -> Result<(), PairingError> {
        if !self.store.remove(host_id) {
            return Err(PairingError::UnknownHost(host_id.to_string()));
        }
        self.persist()
    }

    /// 信任宿主机最近出示的新指纹，解除指纹不一致的阻断。
    pub(crate) fn accept_fingerprint(&mut self, host_id: &str) -> Result<String, PairingError> {
        let mut host = self.lookup(host_id)?;
        let Some(presented) = host.presented_fingerprint.take() else {
            return Err(PairingError::Other(
                "no pending fingerprint change for this host".to_string(),
            ));
        };
        info!(host_id = %host.id, fingerprint = %presented, "host fingerprint accepted");
        host.fingerprint = Some(presented.clone());
        self.store.upsert(host);
        self.persist()?;
        if matches!(
            self.state,
            PairingState::Error(PairingError::FingerprintMismatch { .. })
        ) {
            self.state = PairingState::Disconnected;
        }
        Ok(presented)
    }

    /// 执行连接流程，成功时返回 WS 端点。
    pub(crate) async fn connect(&mut self, host_id: &str) -> Result<SessionEndpoint, PairingError> {
        match self.run_connect(host_id).await {
            Ok(endpoint) => {
                self.state = PairingState::Connected;
                Ok(endpoint)
            }
            Err(err) => {
                warn!(host_id, "connect failed: {err}");
                self.state = PairingState::Error(err.clone());
                Err(err)
            }
        }
    }

    async fn run_connect(&mut self, host_id: &str) -> Result<SessionEndpoint, PairingError> {
        self.state = PairingState::Connecting;
        let mut host = self.lookup(host_id)?;

        // 未确认的指纹变更：在用户 accept 之前不自动连接。
        if let (Some(pinned), Some(presented)) =
            (host.fingerprint.as_ref(), host.presented_fingerprint.as_ref())
        {
            return Err(PairingError::FingerprintMismatch {
                expected: pinned.clone(),
                actual: presented.clone(),
            });
        }

        let mut presented = None;
        if let Some(nonce) = host.pending_nonce.take() {
            let expires = host.nonce_expires.take();
            self.state = PairingState::Verifying;
            if expires.is_some_and(|at| at <= now_millis()) {
                debug!(host_id, "pairing nonce expired; skipping handshake");
            } else {
                match self.api.verify_handshake(&host, &nonce).await {
                    Ok(resp) if resp.valid => presented = resp.fingerprint,
                    Ok(_) => warn!(host_id, "pairing nonce rejected by host; continuing"),
                    Err(err) => warn!(host_id, "pairing nonce check failed: {err}; continuing"),
                }
            }
            // nonce 无论结果如何都只用一次。
            self.store.upsert(host.clone());
            self.persist()?;
        }

        self.state = PairingState::Verifying;
        let presented = match presented {
            Some(fp) => fp,
            None => self.api.connect_info(&host).await?.fingerprint,
        };
        self.check_fingerprint(&mut host, presented)?;
        // 先落盘固定的指纹，token 预检失败也不丢失 nonce 换来的身份。
        self.store.upsert(host.clone());
        self.persist()?;

        self.api.ws_test(&host).await?;

        host.last_connected = Some(now_millis());
        let host = self.store.upsert(host);
        self.persist()?;
        info!(host_id = %host.id, addr = %host.authority(), "host verified");
        Ok(SessionEndpoint {
            host_id: host.id.clone(),
            ws_url: host.ws_url(),
            token: host.token.clone(),
        })
    }

    /// 指纹比对：一致放行；未固定时先与二维码指纹交叉校验再固定；不一致记录待确认值并报错。
    fn check_fingerprint(
        &mut self,
        host: &mut PairedHost,
        presented: String,
    ) -> Result<(), PairingError> {
        let presented = presented.trim().to_ascii_lowercase();
        let expected = host
            .fingerprint
            .clone()
            .or_else(|| host.expected_fingerprint.clone());
        match expected {
            Some(expected) if expected.eq_ignore_ascii_case(&presented) => {
                if host.fingerprint.is_none() {
                    info!(host_id = %host.id, "pinning host fingerprint");
                    host.fingerprint = Some(presented);
                }
                Ok(())
            }
            Some(expected) => {
                host.presented_fingerprint = Some(presented.clone());
                self.store.upsert(host.clone());
                self.persist()?;
                Err(PairingError::FingerprintMismatch {
                    expected,
                    actual: presented,
                })
            }
            None => {
                info!(host_id = %host.id, "pinning host fingerprint on first use");
                host.fingerprint = Some(presented);
                Ok(())
            }
        }
    }

    fn lookup(&self, host_id: &str) -> Result<PairedHost, PairingError> {
        self.store
            .get(host_id)
            .cloned()
            .ok_or_else(|| PairingError::UnknownHost(host_id.to_string()))
    }

    fn persist(&self) -> Result<(), PairingError> {
        self.store
            .save()
            .map_err(|err| PairingError::Other(format!("save paired hosts failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;
    use tl_shared_protocol::{ConnectInfo, PairingPayload, VerifyHandshakeResponse};

    use super::{PairingError, PairingProtocol, PairingState};
    use crate::{
        hosts::{PairedHost, PairedHostStore},
        pairing::api::{ApiCallError, HostApi},
    };

    struct FakeHost {
        fingerprint: Mutex<String>,
        nonce_valid: bool,
        ws_test: Mutex<Result<(), ApiCallError>>,
        verify_calls: AtomicUsize,
    }

    impl FakeHost {
        fn new(fingerprint: &str) -> Arc<Self> {
            Arc::new(Self {
                fingerprint: Mutex::new(fingerprint.to_string()),
                nonce_valid: true,
                ws_test: Mutex::new(Ok(())),
                verify_calls: AtomicUsize::new(0),
            })
        }

        fn regenerate_identity(&self, fingerprint: &str) {
            *self.fingerprint.lock().unwrap() = fingerprint.to_string();
        }
    }

    #[async_trait]
    impl HostApi for FakeHost {
        async fn connect_info(&self, _host: &PairedHost) -> Result<ConnectInfo, ApiCallError> {
            Ok(ConnectInfo {
                port: 7878,
                ips: vec![],
                fingerprint: self.fingerprint.lock().unwrap().clone(),
                cert_fingerprint: None,
            })
        }

        async fn verify_handshake(
            &self,
            _host: &PairedHost,
            _nonce: &str,
        ) -> Result<VerifyHandshakeResponse, ApiCallError> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            Ok(VerifyHandshakeResponse {
                valid: self.nonce_valid,
                fingerprint: self
                    .nonce_valid
                    .then(|| self.fingerprint.lock().unwrap().clone()),
            })
        }

        async fn ws_test(&self, _host: &PairedHost) -> Result<(), ApiCallError> {
            self.ws_test.lock().unwrap().clone()
        }
    }

    fn link(nonce: Option<&str>, fp: Option<&str>) -> String {
        PairingPayload {
            host: "10.0.0.2".to_string(),
            port: 7878,
            token: "a".repeat(64),
            nonce: nonce.map(str::to_string),
            expires_at: Some(tl_shared_protocol::now_millis() + 300_000),
            fingerprint: fp.map(str::to_string),
            name: Some("desk".to_string()),
        }
        .to_link()
    }

    #[tokio::test]
    async fn first_connect_pins_and_clears_nonce() {
        let fake = FakeHost::new(&"1".repeat(32));
        let mut pairing = PairingProtocol::new(fake.clone(), PairedHostStore::in_memory());
        let host = pairing.add_from_link(&link(Some("n1"), None)).unwrap();

        let endpoint = pairing.connect(&host.id).await.unwrap();
        assert_eq!(endpoint.ws_url, "ws://10.0.0.2:7878/ws");
        assert_eq!(pairing.state(), &PairingState::Connected);

        let stored = &pairing.hosts()[0];
        assert_eq!(stored.fingerprint.as_deref(), Some("1".repeat(32).as_str()));
        assert!(stored.pending_nonce.is_none());
        assert!(stored.last_connected.is_some());

        pairing.connect(&host.id).await.unwrap();
        assert_eq!(fake.verify_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn regenerated_identity_is_a_hard_stop_until_accepted() {
        let fake = FakeHost::new(&"1".repeat(32));
        let mut pairing = PairingProtocol::new(fake.clone(), PairedHostStore::in_memory());
        let host = pairing.add_from_link(&link(None, None)).unwrap();
        pairing.connect(&host.id).await.unwrap();

        fake.regenerate_identity(&"2".repeat(32));
        let err = pairing.connect(&host.id).await.unwrap_err();
        assert_eq!(
            err,
            PairingError::FingerprintMismatch {
                expected: "1".repeat(32),
                actual: "2".repeat(32),
            }
        );
        assert!(matches!(pairing.state(), PairingState::Error(_)));

        // 指纹即使恢复，也要先显式确认。
        fake.regenerate_identity(&"1".repeat(32));
        assert!(matches!(
            pairing.connect(&host.id).await,
            Err(PairingError::FingerprintMismatch { .. })
        ));

        fake.regenerate_identity(&"2".repeat(32));
        assert_eq!(pairing.accept_fingerprint(&host.id).unwrap(), "2".repeat(32));
        assert_eq!(pairing.state(), &PairingState::Disconnected);
        pairing.connect(&host.id).await.unwrap();
        assert_eq!(pairing.state(), &PairingState::Connected);
    }

    #[tokio::test]
    async fn rejected_nonce_is_not_fatal_but_mismatch_is() {
        // 两种失败处理不对称是有意为之：nonce 只是一次性提示，指纹才是身份。
        let fake = Arc::new(FakeHost {
            fingerprint: Mutex::new("1".repeat(32)),
            nonce_valid: false,
            ws_test: Mutex::new(Ok(())),
            verify_calls: AtomicUsize::new(0),
        });
        let mut pairing = PairingProtocol::new(fake.clone(), PairedHostStore::in_memory());
        let host = pairing.add_from_link(&link(Some("stale"), None)).unwrap();
        pairing.connect(&host.id).await.unwrap();
        assert_eq!(fake.verify_calls.load(Ordering::SeqCst), 1);
        assert!(pairing.hosts()[0].pending_nonce.is_none());

        fake.regenerate_identity(&"2".repeat(32));
        assert!(matches!(
            pairing.connect(&host.id).await,
            Err(PairingError::FingerprintMismatch { .. })
        ));
        assert_eq!(
            pairing.hosts()[0].fingerprint.as_deref(),
            Some("1".repeat(32).as_str())
        );
    }

    #[tokio::test]
    async fn qr_fingerprint_cross_check_blocks_first_pin() {
        let fake = FakeHost::new(&"1".repeat(32));
        let mut pairing = PairingProtocol::new(fake, PairedHostStore::in_memory());
        let host = pairing
            .add_from_link(&link(None, Some(&"3".repeat(32))))
            .unwrap();
        let err = pairing.connect(&host.id).await.unwrap_err();
        assert_eq!(
            err,
            PairingError::FingerprintMismatch {
                expected: "3".repeat(32),
                actual: "1".repeat(32),
            }
        );
        assert!(pairing.hosts()[0].fingerprint.is_none());
    }

    #[tokio::test]
    async fn token_preflight_errors_stay_distinct() {
        let fake = FakeHost::new(&"1".repeat(32));
        let mut pairing = PairingProtocol::new(fake.clone(), PairedHostStore::in_memory());
        let host = pairing.add_from_link(&link(None, None)).unwrap();

        *fake.ws_test.lock().unwrap() = Err(ApiCallError::Unauthorized);
        assert_eq!(
            pairing.connect(&host.id).await,
            Err(PairingError::AuthRejected)
        );

        *fake.ws_test.lock().unwrap() = Err(ApiCallError::RateLimited {
            retry_after_sec: Some(900),
        });
        assert_eq!(
            pairing.connect(&host.id).await,
            Err(PairingError::RateLimited {
                retry_after_sec: Some(900)
            })
        );

        *fake.ws_test.lock().unwrap() = Err(ApiCallError::Unreachable("refused".to_string()));
        assert!(matches!(
            pairing.connect(&host.id).await,
            Err(PairingError::Unreachable(_))
        ));

        assert!(matches!(
            pairing.connect("missing").await,
            Err(PairingError::UnknownHost(_))
        ));
    }

    #[tokio::test]
    async fn pin_from_nonce_survives_failed_token_preflight() {
        let fake = FakeHost::new(&"a".repeat(32));
        *fake.ws_test.lock().unwrap() = Err(ApiCallError::Unreachable("timeout".to_string()));
        let mut pairing = PairingProtocol::new(fake.clone(), PairedHostStore::in_memory());
        let host = pairing.add_from_link(&link(Some("n1"), None)).unwrap();

        assert!(matches!(
            pairing.connect(&host.id).await,
            Err(PairingError::Unreachable(_))
        ));
        let stored = &pairing.hosts()[0];
        assert_eq!(stored.fingerprint.as_deref(), Some("a".repeat(32).as_str()));
        assert!(stored.pending_nonce.is_none());
        assert!(stored.last_connected.is_none());

        // 之后 `/connect` 出示不同指纹时按不一致处理，而不是重新固定。
        fake.regenerate_identity(&"b".repeat(32));
        *fake.ws_test.lock().unwrap() = Ok(());
        assert!(matches!(
            pairing.connect(&host.id).await,
            Err(PairingError::FingerprintMismatch { .. })
        ));
    }
}
