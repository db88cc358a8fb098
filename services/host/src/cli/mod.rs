//! tl-host CLI 分发：`run`、`token`、`cert`、`pairing`、`doctor`、`version`。

use std::path::Path;

use anyhow::{Context, anyhow, bail};
use serde::Deserialize;
use serde_json::json;
use tl_shared_protocol::PairingPayload;

use crate::{
    auth::token_vault::{TOKEN_FILE, TokenVault, is_valid_token},
    config::HostConfig,
    identity::{
        IdentityStore,
        fingerprint::{SERVER_FINGERPRINT_FILE, is_valid_fingerprint},
    },
    pairing::banner::{print_pairing_banner, print_rotation_warning},
    store::read_trimmed_file,
};

/// CLI 分发结果。
pub(crate) enum CliDispatch {
    /// 继续进入宿主机主循环。
    Run,
    /// 命令已处理完成，主程序应退出。
    Exit,
}

/// 输出格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
    Link,
}

/// 解析并执行 CLI。
pub(crate) async fn dispatch(args: &[String], config: &HostConfig) -> anyhow::Result<CliDispatch> {
    let Some(cmd) = args.first().map(|value| value.trim()) else {
        return Ok(CliDispatch::Run);
    };
    if cmd.is_empty() || cmd == "run" {
        return Ok(CliDispatch::Run);
    }
    if matches!(cmd, "-h" | "--help" | "help") {
        print_root_help();
        return Ok(CliDispatch::Exit);
    }

    let sub = args.get(1).map(String::as_str).unwrap_or("");
    match cmd {
        "token" => match sub {
            "show" => {
                let vault = TokenVault::new(&config.data_dir);
                println!("{}", vault.load_or_create());
            }
            "regenerate" => {
                let vault = TokenVault::new(&config.data_dir);
                println!("{}", vault.regenerate());
                print_rotation_warning("访问令牌");
                println!("运行中的 tl-host 需要重启后生效。");
            }
            _ => bail!("usage: tl-host token <show|regenerate>"),
        },
        "cert" => {
            let store = IdentityStore::new(&config.data_dir);
            match sub {
                "show" => {
                    let identity = store.get_or_create()?;
                    println!("cert-fingerprint: {}", identity.fingerprint);
                    println!("server-fingerprint: {}", store.server_fingerprint());
                    println!("created-at: {}", identity.created_at.to_rfc3339());
                }
                "regenerate" => {
                    let (identity, server_fp) = store.regenerate()?;
                    println!("cert-fingerprint: {}", identity.fingerprint);
                    println!("server-fingerprint: {server_fp}");
                    print_rotation_warning("宿主机身份");
                }
                _ => bail!("usage: tl-host cert <show|regenerate>"),
            }
        }
        "pairing" => {
            let format = parse_format(&args[1..], &[OutputFormat::Text, OutputFormat::Json, OutputFormat::Link])?;
            let payload = fetch_pairing_payload(config).await?;
            match format {
                OutputFormat::Text => print_pairing_banner(&payload, None),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&payload)?),
                OutputFormat::Link => println!("{}", payload.to_link()),
            }
        }
        "doctor" => {
            let format = parse_format(&args[1..], &[OutputFormat::Text, OutputFormat::Json])?;
            if !run_doctor(config, format) {
                std::process::exit(1);
            }
        }
        "version" => println!("{}", env!("CARGO_PKG_VERSION")),
        other => {
            return Err(anyhow!(
                "unknown command: {other}; run `tl-host --help` for usage"
            ));
        }
    }
    Ok(CliDispatch::Exit)
}

/// 解析 `--format`；未指定时为 text。
fn parse_format(args: &[String], allowed: &[OutputFormat]) -> anyhow::Result<OutputFormat> {
    if args.is_empty() {
        return Ok(OutputFormat::Text);
    }
    if args.len() == 2 && args[0] == "--format" {
        let format = match args[1].as_str() {
            "text" => OutputFormat::Text,
            "json" => OutputFormat::Json,
            "link" => OutputFormat::Link,
            other => bail!("unsupported format: {other}"),
        };
        if allowed.contains(&format) {
            return Ok(format);
        }
        bail!("unsupported format: {}", args[1]);
    }
    Err(anyhow!("usage: --format <text|json|link>"))
}

#[derive(Debug, Deserialize)]
struct QrEnvelope {
    ok: bool,
    #[serde(default)]
    message: String,
    data: Option<QrData>,
}

#[derive(Debug, Deserialize)]
struct QrData {
    payload: PairingPayload,
}

/// 向本机运行中的宿主机申请新 nonce；nonce 只在该进程内存中有效。
async fn fetch_pairing_payload(config: &HostConfig) -> anyhow::Result<PairingPayload> {
    let token = TokenVault::new(&config.data_dir).load_or_create();
    let endpoint = format!(
        "http://127.0.0.1:{}/api/pairing/qr",
        config.listen_addr.port()
    );
    let response = reqwest::Client::new()
        .post(&endpoint)
        .bearer_auth(token)
        .send()
        .await
        .with_context(|| format!("tl-host not reachable at {endpoint}; start it with `tl-host run`"))?;
    let status = response.status();
    let envelope: QrEnvelope = response
        .json()
        .await
        .with_context(|| format!("decode pairing response failed (http {status})"))?;
    if !envelope.ok {
        bail!("pairing request rejected (http {status}): {}", envelope.message);
    }
    envelope
        .data
        .map(|data| data.payload)
        .ok_or_else(|| anyhow!("pairing response missing data"))
}

/// 打印自检结果，返回是否健康。
fn run_doctor(config: &HostConfig, format: OutputFormat) -> bool {
    let data_dir = config.data_dir.as_path();
    let token_ok = read_trimmed_file(&data_dir.join(TOKEN_FILE))
        .map(|blob| {
            TokenVault::new(data_dir)
                .decrypt(&blob)
                .map(|token| is_valid_token(&token))
                .unwrap_or(false)
        })
        .unwrap_or(false);
    let fingerprint_ok = read_trimmed_file(&data_dir.join(SERVER_FINGERPRINT_FILE))
        .map(|fp| is_valid_fingerprint(&fp))
        .unwrap_or(false);
    let cert_ok = IdentityStore::new(data_dir).certificate_path().exists();
    let dir_mode = dir_mode(data_dir);
    let dir_private = dir_mode.map(|mode| mode & 0o077 == 0).unwrap_or(false);
    let healthy = token_ok && fingerprint_ok && cert_ok && dir_private;

    match format {
        OutputFormat::Json => {
            let payload = json!({
                "listenAddr": config.listen_addr.to_string(),
                "dataDir": data_dir.display().to_string(),
                "dataDirMode": dir_mode.map(|mode| format!("{mode:o}")),
                "tokenDecryptable": token_ok,
                "serverFingerprint": fingerprint_ok,
                "certificate": cert_ok,
                "hostName": config.host_name,
                "healthy": healthy,
            });
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
            );
        }
        _ => {
            println!("listen-addr: {}", config.listen_addr);
            println!("data-dir: {}", data_dir.display());
            println!(
                "data-dir-mode: {}",
                dir_mode.map(|mode| format!("{mode:o}")).unwrap_or_else(|| "missing".to_string())
            );
            println!("token-decryptable: {}", yes_no(token_ok));
            println!("server-fingerprint: {}", yes_no(fingerprint_ok));
            println!("certificate: {}", yes_no(cert_ok));
            println!("host-name: {}", config.host_name);
        }
    }
    healthy
}

#[cfg(unix)]
fn dir_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .ok()
        .map(|meta| meta.permissions().mode() & 0o777)
}

#[cfg(not(unix))]
fn dir_mode(path: &Path) -> Option<u32> {
    path.exists().then_some(0o700)
}

fn yes_no(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

/// 打印 root help。
fn print_root_help() {
    println!("tl-host usage:");
    println!("  tl-host run");
    println!("  tl-host token <show|regenerate>");
    println!("  tl-host cert <show|regenerate>");
    println!("  tl-host pairing [--format text|json|link]");
    println!("  tl-host doctor [--format text|json]");
    println!("  tl-host version");
}

#[cfg(test)]
mod tests {
    use super::{OutputFormat, parse_format};

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn format_flag_parsing() {
        let all = [OutputFormat::Text, OutputFormat::Json, OutputFormat::Link];
        assert_eq!(parse_format(&[], &all).unwrap(), OutputFormat::Text);
        assert_eq!(
            parse_format(&args(&["--format", "link"]), &all).unwrap(),
            OutputFormat::Link
        );
        assert!(parse_format(&args(&["--format", "link"]), &all[..2]).is_err());
        assert!(parse_format(&args(&["--format"]), &all).is_err());
    }
}
