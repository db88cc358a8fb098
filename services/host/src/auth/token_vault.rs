//! TokenVault：bearer token 的静态加密存储。
//!
//! 密钥由 `scrypt(machineId, 固定盐)` 派生，从不落盘；`machineId` 由
//! 主机名、系统用户、家目录、平台与架构拼接而成，因此密文文件换机或换用户后
//! 无法解密，调用方把解密失败当作"需要重新生成"。
//!
//! 密文格式：`hex(iv):hex(authTag):hex(ciphertext)`，AES-256-GCM，16 字节 IV。

use std::path::{Path, PathBuf};

use aes_gcm::{
    AesGcm,
    aead::{
        AeadInPlace, KeyInit,
        generic_array::{GenericArray, typenum::U16},
    },
    aes::Aes256,
};
use rand::RngCore;
use tracing::{info, warn};

use crate::store::{MODE_PRIVATE_FILE, read_trimmed_file, write_file_with_mode};

/// 加密 token 文件名。
pub(crate) const TOKEN_FILE: &str = "token.enc";
/// token 随机字节数（256 bit，64 位十六进制）。
pub(crate) const TOKEN_BYTES: usize = 32;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_SALT: &[u8] = b"termlink-token-vault-v1";
const SCRYPT_LOG_N: u8 = 14;
const SCRYPT_R: u32 = 8;
const SCRYPT_P: u32 = 1;

type Aes256Gcm16 = AesGcm<Aes256, U16>;

/// 解密失败原因；全部属于正常控制流。
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub(crate) enum DecryptError {
    #[error("blob is not iv:tag:ciphertext hex")]
    Malformed,
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("authentication failed (different machine key or tampered blob)")]
    Authentication,
    #[error("plaintext is not utf-8")]
    NotUtf8,
}

/// 加密失败原因。
#[derive(Debug, thiserror::Error)]
pub(crate) enum EncryptError {
    #[error("key derivation failed")]
    KeyDerivation,
    #[error("aead encryption failed")]
    Aead,
}

pub(crate) struct TokenVault {
    path: PathBuf,
    machine_id: String,
}

impl TokenVault {
    pub(crate) fn new(data_dir: &Path) -> Self {
        Self::with_machine_id(data_dir, machine_id())
    }

    pub(crate) fn with_machine_id(data_dir: &Path, machine_id: impl Into<String>) -> Self {
        Self {
            path: data_dir.join(TOKEN_FILE),
            machine_id: machine_id.into(),
        }
    }

    /// 每次调用重新派生。
    pub(crate) fn derive_key(&self) -> Option<[u8; 32]> {
        let params = scrypt::Params::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, 32).ok()?;
        let mut key = [0_u8; 32];
        scrypt::scrypt(self.machine_id.as_bytes(), KEY_SALT, &params, &mut key).ok()?;
        Some(key)
    }

    pub(crate) fn encrypt(&self, plaintext: &str) -> Result<String, EncryptError> {
        let key = self.derive_key().ok_or(EncryptError::KeyDerivation)?;
        let cipher = Aes256Gcm16::new(GenericArray::from_slice(&key));
        let mut iv = [0_u8; IV_LEN];
        rand::rngs::OsRng.fill_bytes(&mut iv);
        let mut buffer = plaintext.as_bytes().to_vec();
        let tag = cipher
            .encrypt_in_place_detached(GenericArray::from_slice(&iv), b"", &mut buffer)
            .map_err(|_| EncryptError::Aead)?;
        Ok(format!(
            "{}:{}:{}",
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(buffer)
        ))
    }

    pub(crate) fn decrypt(&self, blob: &str) -> Result<String, DecryptError> {
        let mut parts = blob.trim().split(':');
        let (Some(iv_hex), Some(tag_hex), Some(ct_hex), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(DecryptError::Malformed);
        };
        let iv = hex::decode(iv_hex).map_err(|_| DecryptError::Malformed)?;
        let tag = hex::decode(tag_hex).map_err(|_| DecryptError::Malformed)?;
        let mut buffer = hex::decode(ct_hex).map_err(|_| DecryptError::Malformed)?;
        if iv.len() != IV_LEN || tag.len() != TAG_LEN {
            return Err(DecryptError::Malformed);
        }

        let key = self.derive_key().ok_or(DecryptError::KeyDerivation)?;
        let cipher = Aes256Gcm16::new(GenericArray::from_slice(&key));
        cipher
            .decrypt_in_place_detached(
                GenericArray::from_slice(&iv),
                b"",
                &mut buffer,
                GenericArray::from_slice(&tag),
            )
            .map_err(|_| DecryptError::Authentication)?;
        String::from_utf8(buffer).map_err(|_| DecryptError::NotUtf8)
    }

    /// 解密已有 token → 迁移旧版明文 token → 生成新 token。
    pub(crate) fn load_or_create(&self) -> String {
        if let Some(stored) = read_trimmed_file(&self.path) {
            match self.decrypt(&stored) {
                Ok(token) if is_valid_token(&token) => return token,
                Ok(_) => warn!("stored token has unexpected shape, regenerating"),
                Err(err) if is_valid_token(&stored) => {
                    info!("migrating legacy plaintext token ({err})");
                    self.persist(&stored);
                    return stored;
                }
                Err(err) => warn!("stored token not decryptable, regenerating: {err}"),
            }
        }
        self.regenerate()
    }

    /// 生成并持久化新 token；旧 token 随即失效。
    pub(crate) fn regenerate(&self) -> String {
        let token = generate_token();
        self.persist(&token);
        token
    }

    fn persist(&self, token: &str) {
        let blob = match self.encrypt(token) {
            Ok(blob) => blob,
            Err(err) => {
                warn!("encrypt token failed, token kept in memory only: {err}");
                return;
            }
        };
        if let Err(err) = write_file_with_mode(&self.path, blob.as_bytes(), MODE_PRIVATE_FILE) {
            warn!(path = %self.path.display(), "persist token failed, token kept in memory only: {err}");
        }
    }
}

/// `hostname:user:home:platform:arch`。
pub(crate) fn machine_id() -> String {
    let host = sysinfo::System::host_name().unwrap_or_default();
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default();
    let home = std::env::var("HOME").unwrap_or_default();
    format!(
        "{host}:{user}:{home}:{}:{}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub(crate) fn generate_token() -> String {
    let mut bytes = [0_u8; TOKEN_BYTES];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

pub(crate) fn is_valid_token(raw: &str) -> bool {
    raw.len() == TOKEN_BYTES * 2 && raw.chars().all(|c| c.is_ascii_hexdigit())
}

/// 定长比较，避免按前缀提前返回。
pub(crate) fn tokens_match(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0_u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
