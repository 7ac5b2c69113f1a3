use crate::db;
use crate::ipc::helpers::{
    check_permutation, optional_bool, require_db, required_name, required_str, respond,
    string_list, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn term_archived(conn: &Connection, term_id: &str) -> Result<bool, HandlerErr> {
    let archived: Option<i64> = conn
        .query_row(
            "SELECT archived FROM terms WHERE id = ?",
            [term_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    match archived {
        Some(v) => Ok(v != 0),
        None => Err(HandlerErr::not_found("term not found")),
    }
}

fn name_taken(conn: &Connection, name: &str, except_id: Option<&str>) -> Result<bool, HandlerErr> {
    let other: Option<String> = conn
        .query_row(
            "SELECT id FROM terms WHERE name = ?",
            [name],
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    Ok(match other {
        Some(id) => Some(id.as_str()) != except_id,
        None => false,
    })
}

fn terms_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let include_archived = optional_bool(params, "includeArchived")?.unwrap_or(false);
    let archived_only = optional_bool(params, "archivedOnly")?.unwrap_or(false);

    let mut stmt = conn
        .prepare(
            "SELECT
               t.id,
               t.name,
               t.position,
               t.archived,
               (SELECT COUNT(*) FROM courses c WHERE c.term_id = t.id) AS course_count
             FROM terms t
             ORDER BY t.position, t.created_at",
        )
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let position: i64 = row.get(2)?;
            let archived: bool = row.get::<_, i64>(3)? != 0;
            let course_count: i64 = row.get(4)?;
            Ok((archived, json!({
                "id": id,
                "name": name,
                "position": position,
                "archived": archived,
                "courseCount": course_count
            })))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let terms: Vec<Value> = rows
        .into_iter()
        .filter(|(archived, _)| {
            if archived_only {
                *archived
            } else {
                include_archived || !*archived
            }
        })
        .map(|(_, v)| v)
        .collect();
    Ok(json!({ "terms": terms }))
}

fn terms_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let name = required_name(params, "name")?;
    if name_taken(conn, &name, None)? {
        return Err(HandlerErr::new("conflict", "a term with that name already exists")
            .with_details(json!({ "name": name })));
    }

    let position: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(position), -1) + 1 FROM terms",
            [],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    let term_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO terms(id, name, position, archived, created_at) VALUES(?, ?, ?, 0, ?)",
        (&term_id, &name, position, db::now_timestamp()),
    )
    .map_err(|e| HandlerErr::write("db_insert_failed", "terms", e))?;

    Ok(json!({ "termId": term_id, "name": name, "position": position }))
}

fn terms_rename(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term_id = required_str(params, "termId")?;
    let name = required_name(params, "name")?;
    term_archived(conn, &term_id)?;
    if name_taken(conn, &name, Some(&term_id))? {
        return Err(HandlerErr::new("conflict", "a term with that name already exists")
            .with_details(json!({ "name": name })));
    }
    conn.execute("UPDATE terms SET name = ? WHERE id = ?", (&name, &term_id))
        .map_err(|e| HandlerErr::write("db_update_failed", "terms", e))?;
    Ok(json!({ "ok": true }))
}

fn terms_set_archived(
    conn: &Connection,
    params: &Value,
    archived: bool,
) -> Result<Value, HandlerErr> {
    let term_id = required_str(params, "termId")?;
    let changed = conn
        .execute(
            "UPDATE terms SET archived = ? WHERE id = ?",
            (archived as i64, &term_id),
        )
        .map_err(|e| HandlerErr::write("db_update_failed", "terms", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("term not found"));
    }
    Ok(json!({ "ok": true, "archived": archived }))
}

fn terms_archive(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    terms_set_archived(conn, params, true)
}

fn terms_unarchive(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    terms_set_archived(conn, params, false)
}

fn terms_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term_id = required_str(params, "termId")?;
    if !term_archived(conn, &term_id)? {
        return Err(HandlerErr::new(
            "conflict",
            "only archived terms can be deleted; archive it first",
        ));
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    // Courses outlive their term and fall back to the unassigned bucket.
    let detached = tx
        .execute("UPDATE courses SET term_id = NULL WHERE term_id = ?", [&term_id])
        .map_err(|e| HandlerErr::write("db_update_failed", "courses", e))?;
    tx.execute("DELETE FROM terms WHERE id = ?", [&term_id])
        .map_err(|e| HandlerErr::write("db_delete_failed", "terms", e))?;

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "detachedCourses": detached }))
}

fn terms_reorder(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let ordered = string_list(params, "orderedTermIds")?;

    let mut stmt = conn
        .prepare("SELECT id FROM terms ORDER BY position, created_at")
        .map_err(HandlerErr::query)?;
    let current: Vec<String> = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    check_permutation("orderedTermIds", &current, &ordered)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    {
        let mut up = tx
            .prepare("UPDATE terms SET position = ? WHERE id = ?")
            .map_err(|e| HandlerErr::write("db_update_failed", "terms", e))?;
        for (i, id) in ordered.iter().enumerate() {
            up.execute((i as i64, id))
                .map_err(|e| HandlerErr::write("db_update_failed", "terms", e))?;
        }
    }
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "terms.list" => terms_list,
        "terms.create" => terms_create,
        "terms.rename" => terms_rename,
        "terms.archive" => terms_archive,
        "terms.unarchive" => terms_unarchive,
        "terms.delete" => terms_delete,
        "terms.reorder" => terms_reorder,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| run(conn, &req.params));
    Some(respond(&req.id, result))
}
