//! 配对信息高亮输出。

use chrono::{Local, TimeZone};
use tl_shared_protocol::PairingPayload;

use crate::api::types::{ANSI_BOLD, ANSI_CYAN, ANSI_RESET, ANSI_WHITE, ANSI_YELLOW};

/// 打印宿主机配对区块。
pub(crate) fn print_pairing_banner(payload: &PairingPayload, cert_fingerprint: Option<&str>) {
    println!(
        "{cyan}{bold}\n╔══════════════════════════════════════════════════════════════╗\n\
         ║                    配对新设备（宿主机）                   ║\n\
         ╚══════════════════════════════════════════════════════════════╝{reset}",
        cyan = ANSI_CYAN,
        bold = ANSI_BOLD,
        reset = ANSI_RESET
    );
    print_field("宿主机", &format!("{}:{}", payload.host, payload.port));
    if let Some(name) = payload.name.as_deref() {
        print_field("宿主机名", name);
    }
    if let Some(fp) = payload.fingerprint.as_deref() {
        print_field("身份指纹", fp);
    }
    if let Some(cert_fp) = cert_fingerprint {
        print_field("证书指纹", cert_fp);
    }
    if let Some(expires) = payload
        .expires_at
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
    {
        print_field("nonce 过期", &expires.format("%H:%M:%S").to_string());
    }
    print_field("配对链接", &payload.to_link());
    println!(
        "{yellow}{bold}提示:{reset} 链接包含访问令牌，请勿在不可信渠道分享；过期后执行 `tl-host pairing` 重新获取。\n",
        yellow = ANSI_YELLOW,
        bold = ANSI_BOLD,
        reset = ANSI_RESET
    );
}

/// 身份/令牌轮换后的醒目提示。
pub(crate) fn print_rotation_warning(what: &str) {
    println!(
        "{yellow}{bold}警告:{reset} {what} 已重新生成，所有已配对设备需要重新配对或确认新指纹。",
        yellow = ANSI_YELLOW,
        bold = ANSI_BOLD,
        reset = ANSI_RESET
    );
}

fn print_field(label: &str, value: &str) {
    println!(
        "{white}{bold}{label}:{reset} {value}",
        white = ANSI_WHITE,
        bold = ANSI_BOLD,
        reset = ANSI_RESET
    );
}
