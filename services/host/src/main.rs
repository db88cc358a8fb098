//! tl-host 二进制入口：CLI 分发后启动宿主机服务。

mod api;
mod app;
mod auth;
mod cli;
mod config;
mod identity;
mod logging;
mod pairing;
mod state;
mod store;
mod terminal;
mod ws;

#[tokio::main]
/// 启动宿主机服务。
async fn main() -> anyhow::Result<()> {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    let config = config::HostConfig::from_env()?;
    match cli::dispatch(&args, &config).await? {
        cli::CliDispatch::Run => {}
        cli::CliDispatch::Exit => return Ok(()),
    }

    let _log_runtime = logging::init("tl-host")?;
    app::run(config).await
}
