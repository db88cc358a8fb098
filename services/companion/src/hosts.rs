//! 已配对宿主机存储：
//! 1. 维护 `PairedHost` 列表并以 JSON 落盘（文件 0600，目录 0700）。
//! 2. 同一 `host:port` 重复配对时复用记录 ID 与已固定的指纹。

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tl_shared_protocol::PairingPayload;
use tracing::warn;
use uuid::Uuid;

/// 已配对宿主机。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PairedHost {
    /// 本地记录 ID。
    pub(crate) id: String,
    /// 展示名。
    #[serde(default)]
    pub(crate) name: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    /// bearer token。
    pub(crate) token: String,
    /// 已固定（TOFU）的宿主机指纹。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) fingerprint: Option<String>,
    /// 二维码内嵌的指纹，仅用于首配交叉校验，不作为固定值。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) expected_fingerprint: Option<String>,
    /// 指纹不一致时宿主机出示的新值，等待用户确认。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) presented_fingerprint: Option<String>,
    /// 尚未校验的一次性 nonce。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) pending_nonce: Option<String>,
    /// nonce 过期时间（unix 毫秒）。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) nonce_expires: Option<i64>,
    /// 最近一次成功连接时间（unix 毫秒）。
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(crate) last_connected: Option<i64>,
}

impl PairedHost {
    /// 由配对载荷构造新记录。
    pub(crate) fn from_payload(payload: PairingPayload) -> Self {
        let name = payload
            .name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", payload.host, payload.port));
        Self {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            name,
            host: payload.host,
            port: payload.port,
            token: payload.token,
            fingerprint: None,
            expected_fingerprint: payload.fingerprint,
            presented_fingerprint: None,
            pending_nonce: payload.nonce,
            nonce_expires: payload.expires_at,
            last_connected: None,
        }
    }

    /// `host:port`，IPv6 地址加方括号。
    pub(crate) fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// HTTP 接口 base URL。
    pub(crate) fn http_base(&self) -> String {
        format!("http://{}", self.authority())
    }

    /// 多路复用 WS 地址。
    pub(crate) fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.authority())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HostsFile {
    #[serde(default)]
    hosts: Vec<PairedHost>,
}

/// 已配对宿主机列表存储。
#[derive(Debug, Clone)]
pub(crate) struct PairedHostStore {
    /// 存储文件路径；为空时仅保存在内存。
    path: Option<PathBuf>,
    hosts: Vec<PairedHost>,
}

impl PairedHostStore {
    /// 从文件加载；文件缺失或损坏时返回空列表。
    pub(crate) fn load(path: &Path) -> Self {
        let hosts = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<HostsFile>(&bytes)
                .map(|file| file.hosts)
                .unwrap_or_else(|err| {
                    warn!("load paired hosts failed: {err}");
                    Vec::new()
                }),
            Err(_) => Vec::new(),
        };
        Self {
            path: Some(path.to_path_buf()),
            hosts,
        }
    }

    #[cfg(test)]
    pub(crate) fn in_memory() -> Self {
        Self {
            path: None,
            hosts: Vec::new(),
        }
    }

    pub(crate) fn list(&self) -> &[PairedHost] {
        &self.hosts
    }

    pub(crate) fn get(&self, id: &str) -> Option<&PairedHost> {
        self.hosts.iter().find(|host| host.id == id)
    }

    /// 写入记录：同 ID 覆盖；同 `host:port` 的新配对沿用旧 ID 与已固定指纹。
    pub(crate) fn upsert(&mut self, mut host: PairedHost) -> PairedHost {
        if let Some(existing) = self.hosts.iter_mut().find(|item| item.id == host.id) {
            *existing = host.clone();
            return host;
        }
        if let Some(existing) = self
            .hosts
            .iter_mut()
            .find(|item| item.host == host.host && item.port == host.port)
        {
            host.id = existing.id.clone();
            host.fingerprint = existing.fingerprint.clone();
            host.presented_fingerprint = existing.presented_fingerprint.clone();
            host.last_connected = existing.last_connected;
            *existing = host.clone();
            return host;
        }
        self.hosts.push(host.clone());
        host
    }

    /// 删除记录；返回是否存在。
    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let before = self.hosts.len();
        self.hosts.retain(|host| host.id != id);
        self.hosts.len() != before
    }

    /// 原子落盘：临时文件写入并设 0600 后 rename。
    pub(crate) fn save(&self) -> anyhow::Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
            set_mode(parent, 0o700)?;
        }
        let bytes = serde_json::to_vec_pretty(&HostsFile {
            hosts: self.hosts.clone(),
        })?;
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        {
            let mut file = fs::File::create(&tmp)?;
            set_mode(&tmp, 0o600)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
pub(crate) fn sample_host(host: &str, port: u16) -> PairedHost {
    PairedHost::from_payload(PairingPayload {
        host: host.to_string(),
        port,
        token: "a".repeat(64),
        nonce: None,
        expires_at: None,
        fingerprint: None,
        name: None,
    })
}

#[cfg(test)]
mod tests {
    use super::{PairedHostStore, sample_host};

    #[test]
    fn repairing_same_address_keeps_id_and_pin() {
        let mut store = PairedHostStore::in_memory();
        let mut first = store.upsert(sample_host("10.0.0.2", 7878));
        first.fingerprint = Some("f".repeat(32));
        store.upsert(first.clone());

        let mut again = sample_host("10.0.0.2", 7878);
        again.token = "b".repeat(64);
        let merged = store.upsert(again);

        assert_eq!(store.list().len(), 1);
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.fingerprint, first.fingerprint);
        assert_eq!(store.get(&first.id).unwrap().token, "b".repeat(64));
    }

    #[test]
    fn save_and_load_round_trip_with_private_mode() {
        let dir = std::env::temp_dir().join(format!(
            "termlink-companion-{}",
            uuid::Uuid::new_v4().simple()
        ));
        let path = dir.join("hosts.json");
        let mut store = PairedHostStore::load(&path);
        assert!(store.list().is_empty());
        let saved = store.upsert(sample_host("fd00::1", 7878));
        store.save().unwrap();

        let loaded = PairedHostStore::load(&path);
        assert_eq!(loaded.get(&saved.id), Some(&saved));
        assert_eq!(saved.ws_url(), "ws://[fd00::1]:7878/ws");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_file_loads_empty_and_remove_reports_presence() {
        let dir = std::env::temp_dir().join(format!(
            "termlink-companion-{}",
            uuid::Uuid::new_v4().simple()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("hosts.json");
        std::fs::write(&path, b"{not json").unwrap();
        let mut store = PairedHostStore::load(&path);
        assert!(store.list().is_empty());

        let host = store.upsert(sample_host("10.0.0.3", 7878));
        assert!(store.remove(&host.id));
        assert!(!store.remove(&host.id));
        let _ = std::fs::remove_dir_all(dir);
    }
}
