//! 终端 HTTP 接口：列表、新建、写入、调整尺寸、销毁。

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};

use super::backend::{BackendError, SpawnSpec, TerminalInfo};
use crate::{
    api::{
        error::ApiError,
        response::{ApiEnvelope, ok_response},
        types::{
            TerminalCreateRequest, TerminalListData, TerminalResizeRequest, TerminalWriteRequest,
        },
    },
    state::AppState,
};

type ApiResult<T> = Result<(StatusCode, Json<ApiEnvelope<T>>), ApiError>;

pub(crate) async fn terminal_list_handler(State(state): State<AppState>) -> ApiResult<TerminalListData> {
    let terminals = state.backend.list().await;
    Ok(ok_response("ok", TerminalListData { terminals }))
}

pub(crate) async fn terminal_create_handler(
    State(state): State<AppState>,
    body: Option<Json<TerminalCreateRequest>>,
) -> ApiResult<TerminalInfo> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let info = state
        .backend
        .spawn(SpawnSpec {
            shell: req.shell,
            cwd: req.cwd,
            cols: req.cols,
            rows: req.rows,
        })
        .await
        .map_err(backend_error)?;
    Ok(ok_response("终端已创建", info))
}

pub(crate) async fn terminal_write_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TerminalWriteRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .backend
        .write(&id, &req.data)
        .await
        .map_err(backend_error)?;
    Ok(ok_response("ok", serde_json::json!({ "id": id })))
}

pub(crate) async fn terminal_resize_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TerminalResizeRequest>,
) -> ApiResult<serde_json::Value> {
    state
        .backend
        .resize(&id, req.cols, req.rows)
        .await
        .map_err(backend_error)?;
    Ok(ok_response(
        "ok",
        serde_json::json!({ "id": id, "cols": req.cols, "rows": req.rows }),
    ))
}

pub(crate) async fn terminal_kill_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<serde_json::Value> {
    state.backend.kill(&id).await.map_err(backend_error)?;
    Ok(ok_response("终端已关闭", serde_json::json!({ "id": id })))
}

fn backend_error(err: BackendError) -> ApiError {
    match err {
        BackendError::NotFound(id) => ApiError::new(
            StatusCode::NOT_FOUND,
            "TERMINAL_NOT_FOUND",
            format!("终端不存在: {id}"),
            "请刷新终端列表",
        ),
        BackendError::Exited(id) => ApiError::new(
            StatusCode::CONFLICT,
            "TERMINAL_EXITED",
            format!("终端已退出: {id}"),
            "请新建终端",
        ),
        BackendError::Spawn(err) => ApiError::internal(format!("启动终端失败: {err}")),
        BackendError::Io(err) => ApiError::internal(format!("终端读写失败: {err}")),
    }
}
