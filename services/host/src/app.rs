//! 宿主机应用装配：路由、守卫、CORS、后台清扫与监听。

use std::net::{IpAddr, SocketAddr};

use axum::{
    Router,
    http::{
        HeaderValue, Method,
        header::{AUTHORIZATION, CONTENT_TYPE},
    },
    middleware,
    routing::{delete, get, post},
};
use tokio::time::MissedTickBehavior;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use crate::{
    auth::{
        handlers::{auth_check_handler, regenerate_identity_handler, regenerate_token_handler},
        ip::{IpClass, classify},
        middleware::guard,
    },
    config::HostConfig,
    pairing::{
        banner::print_pairing_banner,
        handlers::{
            connect_handler, health_handler, pairing_qr_handler, verify_handshake_handler,
            ws_test_handler,
        },
    },
    state::AppState,
    terminal::handlers::{
        terminal_create_handler, terminal_kill_handler, terminal_list_handler,
        terminal_resize_handler, terminal_write_handler,
    },
    ws::handlers::{pty_stream_handler, ws_handler},
};

/// 启动宿主机服务，直到收到 Ctrl-C。
pub(crate) async fn run(config: HostConfig) -> anyhow::Result<()> {
    let addr = config.listen_addr;
    let sweep_interval = config.sweep_interval;
    let state = tokio::task::spawn_blocking(move || AppState::new(config)).await?;

    let cert_fingerprint = match state.cert_fingerprint().await {
        Ok(fp) => Some(fp),
        Err(err) => {
            warn!("tls identity unavailable: {err}");
            None
        }
    };
    let payload = state.pairing_payload().await;
    print_pairing_banner(&payload, cert_fingerprint.as_deref());

    let sweeper = spawn_sweeper(state.clone(), sweep_interval);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("tl-host listening on {addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;
    sweeper.abort();
    Ok(())
}

/// 组装路由：未鉴权的发现/握手接口 + 守卫保护的 API 与 WS。
pub(crate) fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/pty/{id}/stream", get(pty_stream_handler))
        .route("/api/auth/check", get(auth_check_handler))
        .route("/api/auth/regenerate-token", post(regenerate_token_handler))
        .route("/api/identity/regenerate", post(regenerate_identity_handler))
        .route("/api/pairing/qr", post(pairing_qr_handler))
        .route("/api/terminal/list", get(terminal_list_handler))
        .route("/api/terminal/create", post(terminal_create_handler))
        .route("/api/terminal/{id}/write", post(terminal_write_handler))
        .route("/api/terminal/{id}/resize", post(terminal_resize_handler))
        .route("/api/terminal/{id}", delete(terminal_kill_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), guard));

    Router::new()
        .route("/health", get(health_handler))
        .route("/connect", get(connect_handler))
        .route("/verify-handshake", post(verify_handshake_handler))
        .route("/ws-test", get(ws_test_handler))
        .merge(protected)
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin.to_str().map(is_allowed_origin).unwrap_or(false)
        }))
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION])
}

/// 允许 `capacitor://`、`file://`、本机、内网/Tailscale 地址与 `*.ts.net`。
pub(crate) fn is_allowed_origin(origin: &str) -> bool {
    if origin.starts_with("capacitor://") || origin.starts_with("file://") {
        return true;
    }
    let Ok(url) = url::Url::parse(origin) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host == "localhost" || host.ends_with(".ts.net") {
        return true;
    }
    host.parse::<IpAddr>()
        .map(|ip| matches!(classify(ip), IpClass::Localhost | IpClass::LocalNetwork))
        .unwrap_or(false)
}

fn spawn_sweeper(state: AppState, every: std::time::Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            state.sweep().await;
        }
    })
}
