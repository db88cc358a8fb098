//! 宿主机共享状态：身份、令牌、限流表、nonce 表与终端句柄。

use std::{net::IpAddr, sync::Arc};

use sysinfo::Networks;
use tl_shared_protocol::PairingPayload;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info};

use crate::{
    auth::{
        auth_limiter::AuthRateLimiter,
        endpoint_limiter::EndpointRateLimiter,
        ip::{IpClass, classify},
        token_vault::{TokenVault, tokens_match},
    },
    config::HostConfig,
    identity::{IdentityError, IdentityStore},
    pairing::nonce::NonceBroker,
    terminal::{
        backend::{ProcessBackend, TerminalBackend},
        hub::TerminalHub,
    },
};

/// 宿主机共享状态；各字段自带同步，克隆开销为若干 `Arc`。
#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) config: Arc<HostConfig>,
    pub(crate) identity: Arc<IdentityStore>,
    pub(crate) vault: Arc<TokenVault>,
    /// 当前唯一生效的 bearer token（明文只存在于内存）。
    token: Arc<RwLock<String>>,
    /// token 代数；每次轮换加一，存量 WS 会话据此下线。
    token_epoch: Arc<watch::Sender<u64>>,
    pub(crate) auth_limiter: Arc<AuthRateLimiter>,
    pub(crate) endpoint_limiter: Arc<EndpointRateLimiter>,
    pub(crate) nonces: Arc<NonceBroker>,
    pub(crate) hub: Arc<TerminalHub>,
    pub(crate) backend: Arc<dyn TerminalBackend>,
}

impl AppState {
    /// 加载/生成 token 并装配进程终端后端。
    pub(crate) fn new(config: HostConfig) -> Self {
        let vault = TokenVault::new(&config.data_dir);
        Self::with_vault(config, vault)
    }

    pub(crate) fn with_vault(config: HostConfig, vault: TokenVault) -> Self {
        let token = vault.load_or_create();
        let hub = Arc::new(TerminalHub::new(config.output_buffer_chunks));
        let backend: Arc<dyn TerminalBackend> = Arc::new(ProcessBackend::new(
            hub.clone(),
            config.terminal_shell.clone(),
        ));
        let identity = Arc::new(IdentityStore::new(&config.data_dir));
        // 启动时（阻塞线程中）加载 TOFU 指纹，之后的请求只读内存。
        identity.server_fingerprint();
        Self {
            identity,
            vault: Arc::new(vault),
            token: Arc::new(RwLock::new(token)),
            token_epoch: Arc::new(watch::channel(0).0),
            auth_limiter: Arc::new(AuthRateLimiter::default()),
            endpoint_limiter: Arc::new(EndpointRateLimiter::default()),
            nonces: Arc::new(NonceBroker::default()),
            hub,
            backend,
            config: Arc::new(config),
        }
    }

    pub(crate) async fn current_token(&self) -> String {
        self.token.read().await.clone()
    }

    pub(crate) async fn token_matches(&self, presented: &str) -> bool {
        tokens_match(self.token.read().await.as_str(), presented.trim())
    }

    pub(crate) fn token_changes(&self) -> watch::Receiver<u64> {
        self.token_epoch.subscribe()
    }

    /// 轮换 token；scrypt 派生放到阻塞线程池。
    pub(crate) async fn regenerate_token(&self) -> anyhow::Result<String> {
        let vault = self.vault.clone();
        let token = tokio::task::spawn_blocking(move || vault.regenerate()).await?;
        *self.token.write().await = token.clone();
        self.token_epoch.send_modify(|epoch| *epoch += 1);
        info!("bearer token regenerated, existing sessions must re-pair");
        Ok(token)
    }

    /// 证书指纹；首次访问可能触发 RSA 生成。
    pub(crate) async fn cert_fingerprint(&self) -> Result<String, IdentityError> {
        let identity = self.identity.clone();
        tokio::task::spawn_blocking(move || identity.fingerprint())
            .await
            .map_err(|err| IdentityError::KeyGeneration(err.to_string()))?
    }

    pub(crate) fn server_fingerprint(&self) -> String {
        self.identity.server_fingerprint()
    }

    /// 轮换证书与 TOFU 指纹，返回 `(证书指纹, TOFU 指纹)`。
    pub(crate) async fn regenerate_identity(&self) -> Result<(String, String), IdentityError> {
        let identity = self.identity.clone();
        let (cert, server_fp) = tokio::task::spawn_blocking(move || identity.regenerate())
            .await
            .map_err(|err| IdentityError::KeyGeneration(err.to_string()))??;
        Ok((cert.fingerprint, server_fp))
    }

    /// 配对二维码展示用的可达地址：配置的公开地址优先，其次局域网/Tailscale IPv4。
    pub(crate) fn advertised_ips(&self) -> Vec<String> {
        let mut ips = Vec::new();
        if let Some(public_host) = self.config.public_host.as_ref() {
            ips.push(public_host.clone());
        }
        let networks = Networks::new_with_refreshed_list();
        for (name, data) in &networks {
            for network in data.ip_networks() {
                let IpAddr::V4(v4) = network.addr else {
                    continue;
                };
                if classify(IpAddr::V4(v4)) != IpClass::LocalNetwork {
                    continue;
                }
                let value = v4.to_string();
                if !ips.contains(&value) {
                    debug!(interface = %name, ip = %value, "advertised address");
                    ips.push(value);
                }
            }
        }
        ips
    }

    /// 签发 nonce 并生成配对载荷。
    pub(crate) async fn pairing_payload(&self) -> PairingPayload {
        let issued = self.nonces.issue().await;
        let host = self
            .advertised_ips()
            .into_iter()
            .next()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        PairingPayload {
            host,
            port: self.config.listen_addr.port(),
            token: self.current_token().await,
            nonce: Some(issued.nonce),
            expires_at: i64::try_from(issued.expires_at_ms).ok(),
            fingerprint: Some(self.server_fingerprint()),
            name: Some(self.config.host_name.clone()),
        }
    }

    /// 周期清扫：限流表与 nonce 表。
    pub(crate) async fn sweep(&self) {
        let auth = self.auth_limiter.sweep().await;
        let endpoint = self.endpoint_limiter.sweep().await;
        let nonces = self.nonces.sweep().await;
        if auth + endpoint + nonces > 0 {
            debug!(auth, endpoint, nonces, "swept transient entries");
        }
    }

    #[cfg(test)]
    pub(crate) fn for_test() -> Self {
        let dir = crate::store::temp_dir_for_test("state");
        let vault = TokenVault::with_machine_id(&dir, "test-machine");
        Self::with_vault(HostConfig::for_test(dir), vault)
    }
}

#[cfg(test)]
mod tests {
    use super::AppState;
    use crate::identity::fingerprint::SERVER_FINGERPRINT_FILE;

    #[test]
    fn server_fingerprint_is_loaded_at_construction() {
        let state = AppState::for_test();
        let path = state.config.data_dir.join(SERVER_FINGERPRINT_FILE);
        let on_disk = std::fs::read_to_string(&path).unwrap();
        assert_eq!(on_disk.trim(), state.server_fingerprint());

        // 之后的读取只走内存。
        std::fs::remove_file(&path).unwrap();
        assert_eq!(state.server_fingerprint(), on_disk.trim());
    }

    #[tokio::test]
    async fn regenerate_token_notifies_live_sessions() {
        let state = AppState::for_test();
        let mut changes = state.token_changes();
        let before = state.current_token().await;
        let after = state.regenerate_token().await.unwrap();
        assert_ne!(before, after);
        assert!(changes.has_changed().unwrap());
        changes.changed().await.unwrap();
        assert_eq!(*changes.borrow(), 1);
        assert!(state.token_matches(&after).await);
    }
}
