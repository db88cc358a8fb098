//! 一次性握手 nonce：5 分钟有效，校验即消费。

use std::collections::HashMap;

use rand::RngCore;
use tl_shared_protocol::HANDSHAKE_NONCE_TTL_SEC;
use tokio::sync::Mutex;

use crate::store::unix_now_ms;

const NONCE_BYTES: usize = 32;

#[derive(Debug, Clone, Copy)]
struct NonceEntry {
    expires_at_ms: u64,
    consumed: bool,
}

/// 新签发的 nonce。
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IssuedNonce {
    pub(crate) nonce: String,
    pub(crate) expires_at_ms: u64,
}

#[derive(Default)]
pub(crate) struct NonceBroker {
    entries: Mutex<HashMap<String, NonceEntry>>,
}

impl NonceBroker {
    pub(crate) async fn issue(&self) -> IssuedNonce {
        self.issue_at(unix_now_ms()).await
    }

    pub(crate) async fn issue_at(&self, now_ms: u64) -> IssuedNonce {
        let mut bytes = [0_u8; NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        let nonce = hex::encode(bytes);
        let expires_at_ms = now_ms + HANDSHAKE_NONCE_TTL_SEC * 1000;
        self.entries.lock().await.insert(
            nonce.clone(),
            NonceEntry {
                expires_at_ms,
                consumed: false,
            },
        );
        IssuedNonce {
            nonce,
            expires_at_ms,
        }
    }

    pub(crate) async fn verify(&self, nonce: &str) -> bool {
        self.verify_at(nonce, unix_now_ms()).await
    }

    /// 查找与消费在同一把锁内完成，并发校验同一 nonce 只有一个成功。
    pub(crate) async fn verify_at(&self, nonce: &str, now_ms: u64) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get_mut(nonce) else {
            return false;
        };
        if entry.consumed || entry.expires_at_ms <= now_ms {
            return false;
        }
        entry.consumed = true;
        true
    }

    pub(crate) async fn sweep(&self) -> usize {
        self.sweep_at(unix_now_ms()).await
    }

    pub(crate) async fn sweep_at(&self, now_ms: u64) -> usize {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.consumed && entry.expires_at_ms > now_ms);
        before - entries.len()
    }
}
