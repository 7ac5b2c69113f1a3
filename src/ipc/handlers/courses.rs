use crate::db;
use crate::ipc::helpers::{
    optional_str, patch_object, require_course, require_db, required_name, required_str,
    respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

const NO_TERM_LABEL: &str = "—";

fn ensure_open_term(conn: &Connection, term_id: &str) -> Result<(), HandlerErr> {
    let archived: Option<i64> = conn
        .query_row(
            "SELECT archived FROM terms WHERE id = ?",
            [term_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    match archived {
        None => Err(HandlerErr::not_found("term not found")),
        Some(v) if v != 0 => Err(HandlerErr::new(
            "conflict",
            "term is archived; unarchive it before adding courses",
        )),
        Some(_) => Ok(()),
    }
}

fn courses_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term_id = optional_str(params, "termId")?;

    let mut sql = String::from(
        "SELECT
           c.id,
           c.name,
           c.term_id,
           t.name,
           COALESCE(t.archived, 0),
           (SELECT COUNT(*) FROM categories k WHERE k.course_id = c.id) AS category_count,
           (SELECT COUNT(*) FROM assignments a WHERE a.course_id = c.id) AS assignment_count
         FROM courses c
         LEFT JOIN terms t ON t.id = c.term_id",
    );
    let mut bind_values: Vec<SqlValue> = Vec::new();
    if let Some(t) = term_id {
        sql.push_str(" WHERE c.term_id = ?");
        bind_values.push(SqlValue::Text(t));
    }
    sql.push_str(" ORDER BY c.created_at DESC, c.id");

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let courses = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let term_id: Option<String> = row.get(2)?;
            let term_name: Option<String> = row.get(3)?;
            let term_archived: i64 = row.get(4)?;
            let category_count: i64 = row.get(5)?;
            let assignment_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "termId": term_id,
                "termLabel": term_name.as_deref().unwrap_or(NO_TERM_LABEL),
                "termName": term_name,
                "termArchived": term_archived != 0,
                "categoryCount": category_count,
                "assignmentCount": assignment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    Ok(json!({ "courses": courses }))
}

fn courses_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_name(params, "name")?;
    let term_id = optional_str(params, "termId")?;
    if let Some(t) = &term_id {
        ensure_open_term(conn, t)?;
    }

    let course_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO courses(id, term_id, name, created_at) VALUES(?, ?, ?, ?)",
        (&course_id, &term_id, &name, db::now_timestamp()),
    )
    .map_err(|e| HandlerErr::write("db_insert_failed", "courses", e))?;

    Ok(json!({ "courseId": course_id, "name": name, "termId": term_id }))
}

fn courses_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let patch = patch_object(params)?;
    require_course(conn, &course_id)?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();

    if patch.contains_key("name") {
        let name = required_name(&Value::Object(patch.clone()), "name")?;
        set_parts.push("name = ?");
        bind_values.push(SqlValue::Text(name));
    }
    if let Some(v) = patch.get("termId") {
        if v.is_null() {
            set_parts.push("term_id = ?");
            bind_values.push(SqlValue::Null);
        } else if let Some(t) = v.as_str() {
            ensure_open_term(conn, t)?;
            set_parts.push("term_id = ?");
            bind_values.push(SqlValue::Text(t.to_string()));
        } else {
            return Err(HandlerErr::bad_params(
                "patch.termId must be a string or null",
            ));
        }
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params(
            "patch must include at least one field",
        ));
    }

    let sql = format!("UPDATE courses SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(SqlValue::Text(course_id));
    conn.execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::write("db_update_failed", "courses", e))?;

    Ok(json!({ "ok": true }))
}

fn courses_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    require_course(conn, &course_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Dependency order; there is no ON DELETE CASCADE.
    for (table, sql) in [
        ("assignments", "DELETE FROM assignments WHERE course_id = ?"),
        ("categories", "DELETE FROM categories WHERE course_id = ?"),
        ("courses", "DELETE FROM courses WHERE id = ?"),
    ] {
        tx.execute(sql, [&course_id])
            .map_err(|e| HandlerErr::write("db_delete_failed", table, e))?;
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "courses.list" => courses_list,
        "courses.create" => courses_create,
        "courses.update" => courses_update,
        "courses.delete" => courses_delete,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| run(conn, &req.params));
    Some(respond(&req.id, result))
}
