//! 证书身份模块职责：
//! 1. 生成 RSA-2048 自签证书（10 年有效，SAN localhost/127.0.0.1/0.0.0.0，仅 serverAuth）。
//! 2. 以 owner-only 权限持久化私钥、证书与元数据，并在内存缓存。
//! 3. 计算证书指纹 `hex(sha256(DER))`，轮换时同步轮换 ServerFingerprint。

use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, Datelike, Utc};
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_RSA_SHA256, date_time_ymd,
};
use rsa::{
    RsaPrivateKey,
    pkcs8::{EncodePrivateKey, LineEnding},
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::fingerprint::ServerFingerprintStore;
use crate::store::{
    MODE_PRIVATE_FILE, MODE_PUBLIC_FILE, ensure_private_dir, read_trimmed_file,
    write_file_with_mode,
};

const TLS_DIR: &str = "tls";
const KEY_FILE: &str = "key.pem";
const CERT_FILE: &str = "cert.pem";
const META_FILE: &str = "meta.json";
const RSA_BITS: usize = 2048;
const VALIDITY_YEARS: i32 = 10;
const COMMON_NAME: &str = "termlink host";
const SUBJECT_ALT_NAMES: [&str; 3] = ["localhost", "127.0.0.1", "0.0.0.0"];

/// 证书身份相关错误。
#[derive(Debug, thiserror::Error)]
pub(crate) enum IdentityError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),
    #[error("certificate generation failed: {0}")]
    Certificate(#[from] rcgen::Error),
    #[error("certificate pem has no decodable body")]
    InvalidPem,
}

/// 当前生效的证书身份。
#[derive(Debug, Clone)]
pub(crate) struct CertificateIdentity {
    pub(crate) private_key_pem: String,
    pub(crate) certificate_pem: String,
    /// `hex(sha256(DER))`，小写。
    pub(crate) fingerprint: String,
    pub(crate) created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityMeta {
    fingerprint: String,
    created_at: DateTime<Utc>,
    valid_years: i32,
}

/// 证书身份存储；同时持有 ServerFingerprint。
pub(crate) struct IdentityStore {
    tls_dir: PathBuf,
    cached: Mutex<Option<CertificateIdentity>>,
    server_fingerprint: ServerFingerprintStore,
}

impl IdentityStore {
    pub(crate) fn new(data_dir: &Path) -> Self {
        Self {
            tls_dir: data_dir.join(TLS_DIR),
            cached: Mutex::new(None),
            server_fingerprint: ServerFingerprintStore::new(data_dir),
        }
    }

    /// 缓存 → 磁盘 → 新生成。
    pub(crate) fn get_or_create(&self) -> Result<CertificateIdentity, IdentityError> {
        let mut cached = self.cached.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }
        let identity = match self.load_from_disk() {
            Some(identity) => identity,
            None => {
                let identity = generate_identity()?;
                self.persist(&identity);
                identity
            }
        };
        *cached = Some(identity.clone());
        Ok(identity)
    }

    pub(crate) fn certificate_path(&self) -> PathBuf {
        self.tls_dir.join(CERT_FILE)
    }

    /// 证书指纹。
    pub(crate) fn fingerprint(&self) -> Result<String, IdentityError> {
        Ok(self.get_or_create()?.fingerprint)
    }

    /// TOFU 指纹（与证书独立持久化）。
    pub(crate) fn server_fingerprint(&self) -> String {
        self.server_fingerprint.get_or_create()
    }

    /// 重新生成证书并轮换 ServerFingerprint；已钉扎的客户端需要重新确认。
    pub(crate) fn regenerate(&self) -> Result<(CertificateIdentity, String), IdentityError> {
        let identity = generate_identity()?;
        let mut cached = self.cached.lock().unwrap_or_else(|p| p.into_inner());
        self.persist(&identity);
        *cached = Some(identity.clone());
        drop(cached);
        let server_fp = self.server_fingerprint.regenerate();
        info!(cert_fingerprint = %identity.fingerprint, "host identity regenerated");
        Ok((identity, server_fp))
    }

    fn load_from_disk(&self) -> Option<CertificateIdentity> {
        let private_key_pem = read_trimmed_file(&self.tls_dir.join(KEY_FILE))?;
        let certificate_pem = read_trimmed_file(&self.tls_dir.join(CERT_FILE))?;
        let Some(fingerprint) = fingerprint_pem(&certificate_pem) else {
            warn!(dir = %self.tls_dir.display(), "stored certificate unreadable, regenerating");
            return None;
        };
        let created_at = std::fs::read(self.tls_dir.join(META_FILE))
            .ok()
            .and_then(|raw| serde_json::from_slice::<IdentityMeta>(&raw).ok())
            .map(|meta| meta.created_at)
            .unwrap_or_else(Utc::now);
        Some(CertificateIdentity {
            private_key_pem,
            certificate_pem,
            fingerprint,
            created_at,
        })
    }

    /// 写盘失败只告警，身份仍在内存中生效。
    fn persist(&self, identity: &CertificateIdentity) {
        if let Err(err) = self.try_persist(identity) {
            warn!(dir = %self.tls_dir.display(), "persist tls identity failed, using in-memory identity: {err}");
        }
    }

    fn try_persist(&self, identity: &CertificateIdentity) -> std::io::Result<()> {
        ensure_private_dir(&self.tls_dir)?;
        write_file_with_mode(
            &self.tls_dir.join(KEY_FILE),
            identity.private_key_pem.as_bytes(),
            MODE_PRIVATE_FILE,
        )?;
        write_file_with_mode(
            &self.tls_dir.join(CERT_FILE),
            identity.certificate_pem.as_bytes(),
            MODE_PUBLIC_FILE,
        )?;
        let meta = IdentityMeta {
            fingerprint: identity.fingerprint.clone(),
            created_at: identity.created_at,
            valid_years: VALIDITY_YEARS,
        };
        let raw = serde_json::to_vec_pretty(&meta).map_err(std::io::Error::other)?;
        write_file_with_mode(&self.tls_dir.join(META_FILE), &raw, MODE_PRIVATE_FILE)
    }
}

/// 生成 RSA-2048 自签证书。
pub(crate) fn generate_identity() -> Result<CertificateIdentity, IdentityError> {
    let mut rng = rand::rngs::OsRng;
    let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS)
        .map_err(|err| IdentityError::KeyGeneration(err.to_string()))?;
    let private_key_pem = private_key
        .to_pkcs8_pem(LineEnding::LF)
        .map_err(|err| IdentityError::KeyGeneration(err.to_string()))?
        .to_string();
    let key_pair = KeyPair::from_pem_and_sign_algo(&private_key_pem, &PKCS_RSA_SHA256)?;

    let mut params = CertificateParams::new(
        SUBJECT_ALT_NAMES
            .iter()
            .map(|name| name.to_string())
            .collect::<Vec<_>>(),
    )?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, COMMON_NAME);
    params.distinguished_name = dn;
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let created_at = Utc::now();
    // 日期截到 28 号，避免 2 月 29 日加年后无效。
    let day = created_at.day().min(28) as u8;
    let month = created_at.month() as u8;
    params.not_before = date_time_ymd(created_at.year(), month, day);
    params.not_after = date_time_ymd(created_at.year() + VALIDITY_YEARS, month, day);

    let cert = params.self_signed(&key_pair)?;
    let certificate_pem = cert.pem();
    let fingerprint = fingerprint_der(cert.der());

    Ok(CertificateIdentity {
        private_key_pem,
        certificate_pem,
        fingerprint,
        created_at,
    })
}

/// PEM → DER → sha256 十六进制；PEM 无法解析时返回 None。
pub(crate) fn fingerprint_pem(pem: &str) -> Option<String> {
    let body: String = pem
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect();
    if body.is_empty() {
        return None;
    }
    let der = STANDARD.decode(body.as_bytes()).ok()?;
    Some(fingerprint_der(&der))
}

pub(crate) fn fingerprint_der(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

#[cfg(test)]
mod tests {
    use super::{CERT_FILE, IdentityStore, KEY_FILE, TLS_DIR, fingerprint_pem};
    use crate::store::temp_dir_for_test;

    #[test]
    fn fingerprint_pem_hashes_der_body() {
        // "hello" 的 base64 主体。
        let pem = "-----BEGIN CERTIFICATE-----\naGVsbG8=\n-----END CERTIFICATE-----\n";
        assert_eq!(
            fingerprint_pem(pem).as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );
        assert_eq!(fingerprint_pem("-----BEGIN X-----\n-----END X-----"), None);
    }

    #[test]
    fn identity_is_persisted_reloaded_and_rotated() {
        let dir = temp_dir_for_test("identity");
        let store = IdentityStore::new(&dir);
        let first = store.get_or_create().unwrap();
        assert_eq!(first.fingerprint.len(), 64);
        assert_eq!(fingerprint_pem(&first.certificate_pem), Some(first.fingerprint.clone()));
        assert!(dir.join(TLS_DIR).join(KEY_FILE).exists());
        assert!(dir.join(TLS_DIR).join(CERT_FILE).exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = |name: &str| {
                std::fs::metadata(dir.join(TLS_DIR).join(name))
                    .unwrap()
                    .permissions()
                    .mode()
                    & 0o777
            };
            assert_eq!(mode(KEY_FILE), 0o600);
            assert_eq!(mode(CERT_FILE), 0o644);
        }

        let reloaded = IdentityStore::new(&dir).get_or_create().unwrap();
        assert_eq!(reloaded.fingerprint, first.fingerprint);

        let server_fp = store.server_fingerprint();
        let (rotated, rotated_fp) = store.regenerate().unwrap();
        assert_ne!(rotated.fingerprint, first.fingerprint);
        assert_ne!(rotated_fp, server_fp);
        assert_eq!(store.fingerprint().unwrap(), rotated.fingerprint);
        assert_eq!(IdentityStore::new(&dir).server_fingerprint(), rotated_fp);
    }

    #[test]
    fn corrupt_certificate_is_regenerated() {
        let dir = temp_dir_for_test("identity-corrupt");
        let tls = dir.join(TLS_DIR);
        std::fs::create_dir_all(&tls).unwrap();
        std::fs::write(tls.join(KEY_FILE), "garbage").unwrap();
        std::fs::write(tls.join(CERT_FILE), "-----BEGIN CERTIFICATE-----\n!!!\n-----END CERTIFICATE-----").unwrap();
        let identity = IdentityStore::new(&dir).get_or_create().unwrap();
        assert_eq!(fingerprint_pem(&identity.certificate_pem), Some(identity.fingerprint));
    }
}
