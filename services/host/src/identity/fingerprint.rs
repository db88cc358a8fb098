//! ServerFingerprint：32 位小写十六进制随机值，持久化后作为 TOFU 钉扎对象。

use std::{
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
};

use rand::RngCore;
use tracing::{info, warn};

use crate::store::{MODE_PRIVATE_FILE, read_trimmed_file, write_file_with_mode};

/// 指纹文件名。
pub(crate) const SERVER_FINGERPRINT_FILE: &str = "server-fingerprint.txt";
/// 指纹十六进制长度。
pub(crate) const SERVER_FINGERPRINT_LEN: usize = 32;

/// 指纹存储：首次读取时加载或生成，之后走内存缓存。
///
/// 缓存锁只保护内存中的值，磁盘读写由 `io` 串行化，读路径不会等待文件 I/O。
pub(crate) struct ServerFingerprintStore {
    path: PathBuf,
    cached: RwLock<Option<String>>,
    io: Mutex<()>,
}

impl ServerFingerprintStore {
    pub(crate) fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(SERVER_FINGERPRINT_FILE),
            cached: RwLock::new(None),
            io: Mutex::new(()),
        }
    }

    /// 读取当前指纹；缓存 → 磁盘 → 新生成。
    pub(crate) fn get_or_create(&self) -> String {
        if let Some(value) = self.cached_value() {
            return value;
        }
        let _io = self.io.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(value) = self.cached_value() {
            return value;
        }
        let value = match read_trimmed_file(&self.path) {
            Some(raw) if is_valid_fingerprint(&raw) => raw.to_ascii_lowercase(),
            Some(_) => {
                warn!(path = %self.path.display(), "server fingerprint file malformed, regenerating");
                self.generate_and_persist()
            }
            None => self.generate_and_persist(),
        };
        self.store_value(&value);
        value
    }

    /// 轮换指纹：已钉扎的客户端会在下次连接时报告不一致。
    pub(crate) fn regenerate(&self) -> String {
        let _io = self.io.lock().unwrap_or_else(|p| p.into_inner());
        let value = self.generate_and_persist();
        self.store_value(&value);
        value
    }

    fn cached_value(&self) -> Option<String> {
        self.cached.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn store_value(&self, value: &str) {
        *self.cached.write().unwrap_or_else(|p| p.into_inner()) = Some(value.to_string());
    }

    fn generate_and_persist(&self) -> String {
        let value = generate_fingerprint();
        if let Err(err) = write_file_with_mode(&self.path, value.as_bytes(), MODE_PRIVATE_FILE) {
            warn!(path = %self.path.display(), "persist server fingerprint failed, keeping in memory: {err}");
        } else {
            info!("server fingerprint generated");
        }
        value
    }
}

/// 生成 16 字节随机数的十六进制表示。
pub(crate) fn generate_fingerprint() -> String {
    let mut bytes = [0_u8; SERVER_FINGERPRINT_LEN / 2];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn is_valid_fingerprint(raw: &str) -> bool {
    raw.len() == SERVER_FINGERPRINT_LEN && raw.chars().all(|c| c.is_ascii_hexdigit())
}
