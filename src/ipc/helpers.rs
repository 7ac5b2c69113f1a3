use crate::calc::ValidationError;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::AppState;
use rusqlite::Connection;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::fmt::Display;

#[derive(Debug)]
pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new("bad_params", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("not_found", message)
    }

    pub fn query(e: impl Display) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    /// Write failure on `table`; `code` is one of the `db_*_failed` codes.
    pub fn write(code: &'static str, table: &str, e: impl Display) -> Self {
        Self::new(code, e.to_string()).with_details(json!({ "table": table }))
    }

    pub fn response(self, id: &str) -> Value {
        err(id, self.code, self.message, self.details)
    }
}

impl From<ValidationError> for HandlerErr {
    fn from(e: ValidationError) -> Self {
        HandlerErr::bad_params(e.to_string())
    }
}

pub fn respond(id: &str, result: Result<Value, HandlerErr>) -> Value {
    match result {
        Ok(v) => ok(id, v),
        Err(e) => e.response(id),
    }
}

pub fn require_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

pub fn require_course(conn: &Connection, course_id: &str) -> Result<(), HandlerErr> {
    match db::course_exists(conn, course_id) {
        Ok(true) => Ok(()),
        Ok(false) => Err(HandlerErr::not_found("course not found")),
        Err(e) => Err(HandlerErr::query(e)),
    }
}

pub fn required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) => Ok(v.to_string()),
        None => Err(HandlerErr::bad_params(format!("missing {}", key))),
    }
}

/// Trimmed, non-empty display name.
pub fn required_name(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let v = required_str(params, key)?.trim().to_string();
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(v)
}

/// Absent and null both read as `None`; anything else must be a string.
pub fn optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_str() {
            Some(s) => Ok(Some(s.to_string())),
            None => Err(HandlerErr::bad_params(format!(
                "{} must be a string or null",
                key
            ))),
        },
    }
}

pub fn optional_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_f64() {
            Some(n) => Ok(Some(n)),
            None => Err(HandlerErr::bad_params(format!(
                "{} must be a number or null",
                key
            ))),
        },
    }
}

pub fn optional_i64(params: &Value, key: &str) -> Result<Option<i64>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) => Ok(Some(n)),
            None => Err(HandlerErr::bad_params(format!(
                "{} must be an integer",
                key
            ))),
        },
    }
}

pub fn optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None => Ok(None),
        Some(v) if v.is_null() => Ok(None),
        Some(v) => match v.as_bool() {
            Some(b) => Ok(Some(b)),
            None => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
        },
    }
}

pub fn string_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing/invalid {}", key)));
    };
    let mut out: Vec<String> = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err(HandlerErr::bad_params(format!("{} must be strings", key)));
        };
        out.push(s.to_string());
    }
    Ok(out)
}

pub fn patch_object<'a>(
    params: &'a Value,
) -> Result<&'a serde_json::Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing/invalid patch"))
}

/// `ordered` must name every id in `current` exactly once.
pub fn check_permutation(
    key: &str,
    current: &[String],
    ordered: &[String],
) -> Result<(), HandlerErr> {
    if ordered.len() != current.len() {
        return Err(HandlerErr::bad_params(format!(
            "{} must be a permutation of the existing ids",
            key
        ))
        .with_details(json!({ "expected": current.len(), "got": ordered.len() })));
    }

    let current_set: HashSet<&str> = current.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::new();
    for id in ordered {
        if !seen.insert(id.as_str()) {
            return Err(
                HandlerErr::bad_params(format!("{} contains duplicates", key))
                    .with_details(json!({ "id": id })),
            );
        }
        if !current_set.contains(id.as_str()) {
            return Err(
                HandlerErr::bad_params(format!("{} contains unknown id", key))
                    .with_details(json!({ "id": id })),
            );
        }
    }
    Ok(())
}

/// Rewrites `position` for every id of `table` in `scope_column = scope_id`, in one transaction.
pub fn write_positions(
    conn: &Connection,
    table: &str,
    scope_column: &str,
    scope_id: &str,
    ordered: &[String],
) -> Result<(), HandlerErr> {
    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    apply_positions(&tx, table, scope_column, scope_id, ordered)?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))
}

/// Same as `write_positions`, inside a transaction the caller owns.
pub fn apply_positions(
    conn: &Connection,
    table: &str,
    scope_column: &str,
    scope_id: &str,
    ordered: &[String],
) -> Result<(), HandlerErr> {
    let sql = format!(
        "UPDATE {} SET position = ? WHERE id = ? AND {} = ?",
        table, scope_column
    );
    let mut up = conn
        .prepare(&sql)
        .map_err(|e| HandlerErr::write("db_update_failed", table, e))?;
    for (i, id) in ordered.iter().enumerate() {
        up.execute((i as i64, id, scope_id))
            .map_err(|e| HandlerErr::write("db_update_failed", table, e))?;
    }
    Ok(())
}
