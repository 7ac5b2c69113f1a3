use crate::calc::{clamp_drop_lowest, validate_weight};
use crate::db;
use crate::ipc::helpers::{
    apply_positions, check_permutation, optional_i64, patch_object, require_course, require_db, required_name,
    required_str, respond, string_list, write_positions, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};
use std::collections::HashMap;
use uuid::Uuid;

fn required_weight(params: &Value) -> Result<f64, HandlerErr> {
    let Some(v) = params.get("weight") else {
        return Err(HandlerErr::bad_params("missing weight"));
    };
    let Some(n) = v.as_f64() else {
        return Err(HandlerErr::bad_params("weight must be a number"));
    };
    Ok(validate_weight(n)?)
}

fn assignment_counts(
    conn: &Connection,
    course_id: &str,
) -> Result<HashMap<String, i64>, HandlerErr> {
    let mut stmt = conn
        .prepare(
            "SELECT category_id, COUNT(*) FROM assignments WHERE course_id = ? GROUP BY category_id",
        )
        .map_err(HandlerErr::query)?;
    let counts = stmt
        .query_map([course_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .and_then(|it| it.collect::<Result<HashMap<_, _>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(counts)
}

fn categories_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    require_course(conn, &course_id)?;

    let rows = db::course_categories(conn, &course_id).map_err(HandlerErr::query)?;
    let counts = assignment_counts(conn, &course_id)?;
    let categories: Vec<Value> = rows
        .iter()
        .map(|r| {
            let c = &r.category;
            json!({
                "id": c.id,
                "name": c.name,
                "weight": c.weight,
                "dropLowest": c.drop_lowest,
                "position": r.position,
                "assignmentCount": counts.get(&c.id).copied().unwrap_or(0)
            })
        })
        .collect();
    let weight_total: f64 = rows.iter().map(|r| r.category.weight).sum();

    Ok(json!({ "categories": categories, "weightTotal": weight_total }))
}

fn categories_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let name = required_name(params, "name")?;
    let weight = required_weight(params)?;
    let drop_lowest = clamp_drop_lowest(optional_i64(params, "dropLowest")?.unwrap_or(0));
    require_course(conn, &course_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;
    // Pin the order the user currently sees before appending, so the first
    // positioned row does not reshuffle weight-ordered categories.
    let existing = db::course_categories(&tx, &course_id).map_err(HandlerErr::query)?;
    if existing.iter().any(|r| r.position.is_none()) {
        let ids: Vec<String> = existing.iter().map(|r| r.category.id.clone()).collect();
        apply_positions(&tx, "categories", "course_id", &course_id, &ids)?;
    }
    let position = existing.len() as i64;

    let category_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO categories(id, course_id, name, weight, drop_lowest, position, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &category_id,
            &course_id,
            &name,
            weight,
            drop_lowest as i64,
            position,
            db::now_timestamp(),
        ),
    )
    .map_err(|e| HandlerErr::write("db_insert_failed", "categories", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "categoryId": category_id, "position": position }))
}

fn categories_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let category_id = required_str(params, "categoryId")?;
    let patch = Value::Object(patch_object(params)?.clone());
    require_course(conn, &course_id)?;

    let mut set_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<SqlValue> = Vec::new();

    if patch.get("name").is_some() {
        set_parts.push("name = ?");
        bind_values.push(SqlValue::Text(required_name(&patch, "name")?));
    }
    if patch.get("weight").is_some() {
        set_parts.push("weight = ?");
        bind_values.push(SqlValue::Real(required_weight(&patch)?));
    }
    if let Some(n) = optional_i64(&patch, "dropLowest")? {
        set_parts.push("drop_lowest = ?");
        bind_values.push(SqlValue::Integer(clamp_drop_lowest(n) as i64));
    }

    if set_parts.is_empty() {
        return Err(HandlerErr::bad_params(
            "patch must include at least one field",
        ));
    }

    let sql = format!(
        "UPDATE categories SET {} WHERE id = ? AND course_id = ?",
        set_parts.join(", ")
    );
    bind_values.push(SqlValue::Text(category_id));
    bind_values.push(SqlValue::Text(course_id));

    let changed = conn
        .execute(&sql, params_from_iter(bind_values))
        .map_err(|e| HandlerErr::write("db_update_failed", "categories", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("category not found"));
    }

    Ok(json!({ "ok": true }))
}

fn categories_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let category_id = required_str(params, "categoryId")?;
    require_course(conn, &course_id)?;

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| HandlerErr::new("db_tx_failed", e.to_string()))?;

    let removed_assignments = tx
        .execute(
            "DELETE FROM assignments WHERE category_id = ? AND course_id = ?",
            (&category_id, &course_id),
        )
        .map_err(|e| HandlerErr::write("db_delete_failed", "assignments", e))?;
    let changed = tx
        .execute(
            "DELETE FROM categories WHERE id = ? AND course_id = ?",
            (&category_id, &course_id),
        )
        .map_err(|e| HandlerErr::write("db_delete_failed", "categories", e))?;
    if changed == 0 {
        let _ = tx.rollback();
        return Err(HandlerErr::not_found("category not found"));
    }

    tx.commit()
        .map_err(|e| HandlerErr::new("db_commit_failed", e.to_string()))?;

    Ok(json!({ "ok": true, "removedAssignments": removed_assignments }))
}

fn categories_reorder(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let ordered = string_list(params, "orderedCategoryIds")?;
    require_course(conn, &course_id)?;

    let current: Vec<String> = db::course_categories(conn, &course_id)
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|r| r.category.id)
        .collect();
    check_permutation("orderedCategoryIds", &current, &ordered)?;
    write_positions(conn, "categories", "course_id", &course_id, &ordered)?;

    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "categories.list" => categories_list,
        "categories.create" => categories_create,
        "categories.update" => categories_update,
        "categories.delete" => categories_delete,
        "categories.reorder" => categories_reorder,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| run(conn, &req.params));
    Some(respond(&req.id, result))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unpositioned_course(conn: &Connection) {
        conn.execute_batch(
            "INSERT INTO courses(id, term_id, name, created_at) VALUES('c1', NULL, 'Math', 'now');
             INSERT INTO categories(id, course_id, name, weight, drop_lowest, position, created_at)
                 VALUES('k1', 'c1', 'Tests', 60, 0, NULL, 'now');
             INSERT INTO categories(id, course_id, name, weight, drop_lowest, position, created_at)
                 VALUES('k2', 'c1', 'Homework', 40, 0, NULL, 'now');",
        )
        .expect("seed course");
    }

    fn positions(conn: &Connection) -> Vec<Option<i64>> {
        let mut stmt = conn
            .prepare("SELECT position FROM categories WHERE id IN ('k1', 'k2') ORDER BY id")
            .expect("prepare");
        stmt.query_map([], |r| r.get(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .expect("positions")
    }

    #[test]
    fn failed_insert_leaves_positions_unpinned() {
        let workspace = std::env::temp_dir().join(format!(
            "gradebook-category-create-{}",
            Uuid::new_v4()
        ));
        let conn = db::open_db(&workspace).expect("open db");
        unpositioned_course(&conn);
        conn.execute_batch(
            "CREATE TRIGGER block_category_insert BEFORE INSERT ON categories
             BEGIN SELECT RAISE(ABORT, 'blocked'); END;",
        )
        .expect("create trigger");

        let err = categories_create(
            &conn,
            &json!({ "courseId": "c1", "name": "Quizzes", "weight": 10 }),
        )
        .expect_err("insert is blocked");
        assert_eq!(err.code, "db_insert_failed");
        assert_eq!(positions(&conn), vec![None, None]);

        drop(conn);
        let _ = std::fs::remove_dir_all(workspace);
    }

    #[test]
    fn create_pins_existing_order_and_clamps_drop_lowest() {
        let workspace = std::env::temp_dir().join(format!(
            "gradebook-category-create-{}",
            Uuid::new_v4()
        ));
        let conn = db::open_db(&workspace).expect("open db");
        unpositioned_course(&conn);

        let created = categories_create(
            &conn,
            &json!({ "courseId": "c1", "name": "Quizzes", "weight": 10, "dropLowest": -3 }),
        )
        .expect("create category");
        assert_eq!(created["position"], json!(2));
        assert_eq!(positions(&conn), vec![Some(0), Some(1)]);

        let rows = db::course_categories(&conn, "c1").expect("load categories");
        let quizzes = rows
            .iter()
            .find(|r| r.category.name == "Quizzes")
            .expect("quizzes row");
        assert_eq!(quizzes.category.drop_lowest, 0);

        drop(conn);
        let _ = std::fs::remove_dir_all(workspace);
    }
}
