//! tl-companion CLI：`pair`、`hosts`、`forget`、`accept-fingerprint`、`connect`、`version`。

use std::{io::Write, sync::Arc};

use anyhow::{anyhow, bail};
use tl_shared_protocol::{WsMessage, WsMessageType};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::info;

use crate::{
    config::CompanionConfig,
    hosts::PairedHostStore,
    pairing::{api::ReqwestHostApi, protocol::PairingProtocol},
    transport::{
        backoff::ReconnectPolicy,
        session::{TransportSettings, spawn_session},
    },
};

/// 解析并执行 CLI。
pub(crate) async fn dispatch(args: &[String], config: &CompanionConfig) -> anyhow::Result<()> {
    let cmd = args.first().map(|value| value.trim()).unwrap_or("help");
    let arg = args.get(1).map(|value| value.trim()).filter(|value| !value.is_empty());
    match cmd {
        "pair" => {
            let link = arg.ok_or_else(|| anyhow!("usage: tl-companion pair <link>"))?;
            let mut pairing = build_protocol(config)?;
            let host = pairing.add_from_link(link)?;
            println!("paired {} ({}) as {}", host.name, host.authority(), host.id);
            if host.pending_nonce.is_some() {
                println!("run `tl-companion connect {}` to verify the host", host.id);
            }
        }
        "hosts" => {
            let pairing = build_protocol(config)?;
            if pairing.hosts().is_empty() {
                println!("no paired hosts");
            }
            for host in pairing.hosts() {
                let pin = host.fingerprint.as_deref().unwrap_or("(not pinned)");
                let warn = if host.presented_fingerprint.is_some() {
                    "  [identity changed]"
                } else {
                    ""
                };
                println!(
                    "{}  {}  {}  {}{}",
                    host.id,
                    host.name,
                    host.authority(),
                    pin,
                    warn
                );
            }
        }
        "forget" => {
            let id = arg.ok_or_else(|| anyhow!("usage: tl-companion forget <id>"))?;
            build_protocol(config)?.forget(id)?;
            println!("forgot {id}");
        }
        "accept-fingerprint" => {
            let id = arg.ok_or_else(|| anyhow!("usage: tl-companion accept-fingerprint <id>"))?;
            let fingerprint = build_protocol(config)?.accept_fingerprint(id)?;
            println!("pinned {id} to {fingerprint}");
        }
        "connect" => {
            let id = arg.ok_or_else(|| anyhow!("usage: tl-companion connect <id> [--pty <id>]"))?;
            let pty = parse_pty_flag(&args[2..])?;
            run_connect(config, id, pty).await?;
        }
        "version" | "-V" | "--version" => println!("tl-companion {}", env!("CARGO_PKG_VERSION")),
        "help" | "-h" | "--help" => print_help(),
        other => {
            print_help();
            bail!("unknown command: {other}");
        }
    }
    Ok(())
}

fn build_protocol(config: &CompanionConfig) -> anyhow::Result<PairingProtocol> {
    let api = ReqwestHostApi::new(config.request_timeout)?;
    let store = PairedHostStore::load(&config.hosts_path());
    Ok(PairingProtocol::new(Arc::new(api), store))
}

fn parse_pty_flag(args: &[String]) -> anyhow::Result<Option<String>> {
    let mut pty = None;
    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        match flag.as_str() {
            "--pty" => {
                let value = iter
                    .next()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow!("--pty requires a terminal id"))?;
                pty = Some(value);
            }
            other => bail!("unknown flag: {other}"),
        }
    }
    Ok(pty)
}

/// 连接宿主机；指定 `--pty` 时订阅该终端并把 stdin 行转发为 `terminal:write`。
async fn run_connect(
    config: &CompanionConfig,
    host_id: &str,
    pty: Option<String>,
) -> anyhow::Result<()> {
    let mut pairing = build_protocol(config)?;
    let endpoint = pairing.connect(host_id).await?;
    info!(state = ?pairing.state(), host_id, "pairing finished");
    eprintln!("connected to {}", endpoint.ws_url);

    let settings = TransportSettings {
        policy: ReconnectPolicy::new(config.reconnect_base, config.reconnect_max_attempts),
        ping_interval: config.ping_interval,
        max_missed_pongs: config.max_missed_pongs,
    };
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<WsMessage>(256);
    let handle = spawn_session(endpoint, settings, inbound_tx);
    if let Some(pty_id) = pty.as_deref() {
        handle
            .send(WsMessage::new(
                WsMessageType::Subscribe,
                Some(pty_id.to_string()),
                None,
            ))
            .await;
    }

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("disconnect requested");
                handle.disconnect();
                break;
            }
            line = stdin.next_line(), if pty.is_some() => {
                let (Ok(Some(line)), Some(pty_id)) = (line, pty.as_deref()) else {
                    handle.disconnect();
                    break;
                };
                handle.send(WsMessage::terminal_write(pty_id, &format!("{line}\n"))).await;
            }
            maybe = inbound_rx.recv() => {
                let Some(msg) = maybe else {
                    break;
                };
                if print_inbound(&msg, pty.as_deref()) {
                    handle.disconnect();
                    break;
                }
            }
        }
    }

    handle.join().await?;
    Ok(())
}

/// 输出下行消息；所订阅终端退出时返回 true。
fn print_inbound(msg: &WsMessage, pty: Option<&str>) -> bool {
    match msg.kind {
        WsMessageType::TerminalData => {
            if let Some(data) = msg.text_payload() {
                print!("{data}");
                let _ = std::io::stdout().flush();
            }
            false
        }
        WsMessageType::TerminalExit => {
            let code = msg
                .payload
                .as_ref()
                .and_then(|payload| payload.get("exitCode"))
                .and_then(serde_json::Value::as_i64);
            eprintln!(
                "terminal {} exited ({})",
                msg.pty_id.as_deref().unwrap_or("-"),
                code.map(|value| value.to_string())
                    .unwrap_or_else(|| "signal".to_string())
            );
            pty.is_some() && msg.pty_id.as_deref() == pty
        }
        WsMessageType::Error => {
            eprintln!(
                "host error: {}",
                msg.payload
                    .as_ref()
                    .map(|payload| payload.to_string())
                    .unwrap_or_default()
            );
            false
        }
        _ => false,
    }
}

fn print_help() {
    println!(
        "tl-companion\n\n\
         USAGE:\n  \
         tl-companion pair <termlink://pair?...|json>\n  \
         tl-companion hosts\n  \
         tl-companion forget <id>\n  \
         tl-companion accept-fingerprint <id>\n  \
         tl-companion connect <id> [--pty <terminal-id>]\n  \
         tl-companion version\n\n\
         ENV:\n  \
         TL_COMPANION_DATA_DIR, TL_RECONNECT_BASE_MS, TL_RECONNECT_MAX_ATTEMPTS,\n  \
         TL_PING_INTERVAL_SEC, TL_MAX_MISSED_PONGS"
    );
}
