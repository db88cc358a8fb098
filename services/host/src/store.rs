//! 持久化文件读写：目录 0700、私密文件 0600、公开文件 0644。

use std::{
    fs,
    io::Write,
    path::Path,
};

/// 仅属主可访问的目录权限。
pub(crate) const MODE_PRIVATE_DIR: u32 = 0o700;
/// 仅属主可读写的文件权限。
pub(crate) const MODE_PRIVATE_FILE: u32 = 0o600;
/// 证书等公开文件权限。
pub(crate) const MODE_PUBLIC_FILE: u32 = 0o644;

/// 确保目录存在并收紧为 owner-only。
pub(crate) fn ensure_private_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    set_mode(dir, MODE_PRIVATE_DIR)
}

/// 原子写文件：先写同目录临时文件并设权限，再 rename 覆盖。
pub(crate) fn write_file_with_mode(path: &Path, bytes: &[u8], mode: u32) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_private_dir(parent)?;
    }
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    {
        let mut file = fs::File::create(&tmp)?;
        set_mode(&tmp, mode)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(err) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}

/// 读取文本并去掉首尾空白；空字符串视为无效。
pub(crate) fn read_trimmed_file(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let value = raw.trim().to_string();
    if value.is_empty() { None } else { Some(value) }
}

/// 当前 unix 毫秒。
pub(crate) fn unix_now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
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
pub(crate) fn temp_dir_for_test(label: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "termlink-{label}-{}",
        uuid::Uuid::new_v4().simple()
    ));
    let _ = fs::create_dir_all(&dir);
    dir
}

#[cfg(test)]
mod tests {
    use super::{MODE_PRIVATE_FILE, read_trimmed_file, temp_dir_for_test, write_file_with_mode};

    #[test]
    fn write_replaces_content_and_trims_on_read() {
        let dir = temp_dir_for_test("store");
        let path = dir.join("nested").join("value.txt");
        write_file_with_mode(&path, b"first\n", MODE_PRIVATE_FILE).unwrap();
        write_file_with_mode(&path, b"  second \n", MODE_PRIVATE_FILE).unwrap();
        assert_eq!(read_trimmed_file(&path).as_deref(), Some("second"));
    }

    #[cfg(unix)]
    #[test]
    fn private_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = temp_dir_for_test("store-mode");
        let path = dir.join("secret.txt");
        write_file_with_mode(&path, b"x", MODE_PRIVATE_FILE).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        let dir_mode = std::fs::metadata(&dir).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }
}
