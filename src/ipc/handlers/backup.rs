use crate::backup;
use crate::ipc::handlers::core::select_workspace;
use crate::ipc::helpers::{respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use serde_json::{json, Value};
use std::path::PathBuf;

fn path_param(params: &Value, key: &str) -> Result<PathBuf, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(PathBuf::from(v.trim())),
        _ => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

fn current_workspace(state: &AppState) -> Result<PathBuf, HandlerErr> {
    state
        .workspace
        .clone()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn backup_export(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let out_path = path_param(params, "outPath")?;
    let workspace = current_workspace(state)?;

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let export = backup::export_workspace_bundle(&workspace, &out_path).map_err(|e| {
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "path": out_path.to_string_lossy() }))
    })?;
    tracing::info!(path = %out_path.display(), sha256 = %export.db_sha256, "workspace exported");

    Ok(json!({
        "ok": true,
        "path": out_path.to_string_lossy(),
        "bundleFormat": export.bundle_format,
        "dbSha256": export.db_sha256,
        "entryCount": export.entry_count
    }))
}

fn backup_import(state: &mut AppState, params: &Value) -> Result<Value, HandlerErr> {
    let in_path = path_param(params, "inPath")?;
    let workspace = current_workspace(state)?;
    if !in_path.is_file() {
        return Err(HandlerErr::not_found("bundle file not found")
            .with_details(json!({ "path": in_path.to_string_lossy() })));
    }

    // The database file is replaced underneath, so release the handle first.
    state.db = None;
    let imported = backup::import_workspace_bundle(&in_path, &workspace);
    let reopened = select_workspace(state, &workspace);

    let import = imported.map_err(|e| {
        HandlerErr::new("backup_failed", format!("{e:#}"))
            .with_details(json!({ "path": in_path.to_string_lossy() }))
    })?;
    reopened.map_err(|e| HandlerErr::new("db_open_failed", format!("{e:#}")))?;
    tracing::info!(
        path = %in_path.display(),
        format = %import.bundle_format_detected,
        "workspace imported"
    );

    Ok(json!({
        "ok": true,
        "workspacePath": workspace.to_string_lossy(),
        "bundleFormatDetected": import.bundle_format_detected,
        "dbSha256": import.db_sha256
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&mut AppState, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "backup.exportWorkspaceBundle" => backup_export,
        "backup.importWorkspaceBundle" => backup_import,
        _ => return None,
    };
    Some(respond(&req.id, run(state, &req.params)))
}
