use crate::config;
use crate::db;
use crate::ipc::handlers::grades::DIGITS_SETTING_KEY;
use crate::ipc::helpers::{require_db, required_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Value};

fn validate_setting(key: &str, value: &Value) -> Result<(), HandlerErr> {
    if key == DIGITS_SETTING_KEY {
        let Some(digits) = value.as_u64() else {
            return Err(HandlerErr::bad_params(
                "display.digits must be a non-negative integer",
            ));
        };
        config::parse_digits(DIGITS_SETTING_KEY, digits.to_string())
            .map_err(|e| HandlerErr::bad_params(e.to_string()))?;
    }
    Ok(())
}

fn settings_get(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = required_str(params, "key")?;
    let value = db::settings_get_json(conn, &key).map_err(HandlerErr::query)?;
    Ok(json!({ "key": key, "value": value }))
}

fn settings_set(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let key = required_str(params, "key")?;
    if key.trim().is_empty() {
        return Err(HandlerErr::bad_params("key must not be empty"));
    }
    let Some(value) = params.get("value") else {
        return Err(HandlerErr::bad_params("missing value"));
    };
    validate_setting(&key, value)?;

    db::settings_set_json(conn, &key, value)
        .map_err(|e| HandlerErr::write("db_update_failed", "settings", e))?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "settings.get" => settings_get,
        "settings.set" => settings_set,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| run(conn, &req.params));
    Some(respond(&req.id, result))
}
