//! tl-companion 主程序职责：
//! 1. 扫码配对：保存宿主机地址、token 与二维码指纹。
//! 2. 连接前校验宿主机身份（TOFU）与 token 可用性。
//! 3. 维持带鉴权、心跳与退避重连的终端 WS 会话。

mod cli;
mod config;
mod hosts;
mod pairing;
mod transport;

use tracing_subscriber::EnvFilter;

use crate::config::CompanionConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args = std::env::args().skip(1).collect::<Vec<String>>();
    let config = CompanionConfig::from_env();
    cli::dispatch(&args, &config).await
}
