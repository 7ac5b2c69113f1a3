use crate::calc::{self, AssignmentStatus};
use crate::db::{self, AssignmentRow};
use crate::ipc::helpers::{
    check_permutation, optional_f64, optional_str, patch_object, require_course, require_db,
    required_name, required_str, respond, string_list, write_positions, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use chrono::{NaiveDate, NaiveTime};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::cmp::Ordering;
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

fn assignment_json(row: &AssignmentRow) -> Value {
    let a = &row.assignment;
    json!({
        "id": a.id,
        "courseId": row.course_id,
        "categoryId": a.category_id,
        "title": a.title,
        "pointsEarned": a.points_earned,
        "pointsPossible": a.points_possible,
        "status": a.status,
        "fraction": a.fraction(),
        "dueDate": row.due_date,
        "dueTime": row.due_time,
        "position": row.position
    })
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part which is ignored.
fn parse_due_date(raw: Option<String>) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    let day = raw.get(..10).unwrap_or(&raw);
    NaiveDate::parse_from_str(day, DATE_FORMAT)
        .map(|d| Some(d.format(DATE_FORMAT).to_string()))
        .map_err(|_| {
            HandlerErr::bad_params("dueDate must be YYYY-MM-DD")
                .with_details(json!({ "dueDate": raw }))
        })
}

/// Accepts `HH:MM` or `HH:MM:SS`; stored as `HH:MM:SS`.
fn parse_due_time(raw: Option<String>) -> Result<Option<String>, HandlerErr> {
    let Some(raw) = raw.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };
    NaiveTime::parse_from_str(&raw, TIME_FORMAT)
        .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M"))
        .map(|t| Some(t.format(TIME_FORMAT).to_string()))
        .map_err(|_| {
            HandlerErr::bad_params("dueTime must be HH:MM or HH:MM:SS")
                .with_details(json!({ "dueTime": raw }))
        })
}

fn parse_status(raw: Option<String>) -> Result<Option<AssignmentStatus>, HandlerErr> {
    match raw {
        None => Ok(None),
        Some(s) => Ok(Some(s.parse::<AssignmentStatus>()?)),
    }
}

fn points(params: &Value, key: &'static str) -> Result<Option<f64>, HandlerErr> {
    Ok(calc::validate_points(key, optional_f64(params, key)?)?)
}

fn require_category(
    conn: &Connection,
    course_id: &str,
    category_id: &str,
) -> Result<(), HandlerErr> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM categories WHERE id = ? AND course_id = ?",
            (category_id, course_id),
            |r| r.get(0),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    match found {
        Some(_) => Ok(()),
        None => Err(HandlerErr::not_found("category not found in course")
            .with_details(json!({ "categoryId": category_id }))),
    }
}

fn reject_what_if(assignment_id: &str) -> Result<(), HandlerErr> {
    if calc::is_what_if_id(assignment_id) {
        return Err(HandlerErr::bad_params(
            "the what-if assignment is not stored and cannot be changed",
        ));
    }
    Ok(())
}

fn load_assignment(
    conn: &Connection,
    course_id: &str,
    assignment_id: &str,
) -> Result<AssignmentRow, HandlerErr> {
    let sql = format!(
        "SELECT {} FROM assignments WHERE id = ? AND course_id = ?",
        db::ASSIGNMENT_COLUMNS
    );
    conn.query_row(&sql, (assignment_id, course_id), db::assignment_from_row)
        .optional()
        .map_err(HandlerErr::query)?
        .ok_or_else(|| HandlerErr::not_found("assignment not found"))
}

fn title_owner(
    conn: &Connection,
    course_id: &str,
    category_id: &str,
    title: &str,
) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM assignments WHERE course_id = ? AND category_id = ? AND title = ?",
        (course_id, category_id, title),
        |r| r.get(0),
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn assignments_list(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let category_id = optional_str(params, "categoryId")?;
    require_course(conn, &course_id)?;

    let rows = db::course_assignments(conn, &course_id).map_err(HandlerErr::query)?;
    let assignments: Vec<Value> = rows
        .iter()
        .filter(|r| match &category_id {
            Some(c) => &r.assignment.category_id == c,
            None => true,
        })
        .map(assignment_json)
        .collect();

    Ok(json!({ "assignments": assignments }))
}

fn assignments_create(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let category_id = required_str(params, "categoryId")?;
    let title = required_name(params, "title")?;
    let points_earned = points(params, "pointsEarned")?;
    let points_possible = points(params, "pointsPossible")?;
    let requested = parse_status(optional_str(params, "status")?)?;
    let due_date = parse_due_date(optional_str(params, "dueDate")?)?;
    let due_time = parse_due_time(optional_str(params, "dueTime")?)?;
    require_course(conn, &course_id)?;
    require_category(conn, &course_id, &category_id)?;

    let status = calc::resolve_status(requested, points_earned, points_possible);

    // Same title in the same category replaces the earlier entry.
    if let Some(existing_id) = title_owner(conn, &course_id, &category_id, &title)? {
        conn.execute(
            "UPDATE assignments
             SET points_earned = ?, points_possible = ?, status = ?, due_date = ?, due_time = ?
             WHERE id = ?",
            (
                points_earned,
                points_possible,
                status.as_str(),
                &due_date,
                &due_time,
                &existing_id,
            ),
        )
        .map_err(|e| HandlerErr::write("db_update_failed", "assignments", e))?;
        return Ok(json!({ "assignmentId": existing_id, "created": false, "status": status }));
    }

    // Once the course has a manual order, new rows go to the end of it.
    let position: Option<i64> = conn
        .query_row(
            "SELECT MAX(position) + 1 FROM assignments WHERE course_id = ?",
            [&course_id],
            |r| r.get(0),
        )
        .map_err(HandlerErr::query)?;

    let assignment_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO assignments(
            id, course_id, category_id, title, points_earned, points_possible,
            status, due_date, due_time, position, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &assignment_id,
            &course_id,
            &category_id,
            &title,
            points_earned,
            points_possible,
            status.as_str(),
            &due_date,
            &due_time,
            position,
            db::now_timestamp(),
        ],
    )
    .map_err(|e| HandlerErr::write("db_insert_failed", "assignments", e))?;

    Ok(json!({ "assignmentId": assignment_id, "created": true, "status": status }))
}

fn assignments_update(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let assignment_id = required_str(params, "assignmentId")?;
    reject_what_if(&assignment_id)?;
    let patch = Value::Object(patch_object(params)?.clone());
    require_course(conn, &course_id)?;

    let current = load_assignment(conn, &course_id, &assignment_id)?;
    let mut a = current.assignment.clone();
    let mut due_date = current.due_date.clone();
    let mut due_time = current.due_time.clone();
    let mut touched = false;

    if patch.get("title").is_some() {
        a.title = required_name(&patch, "title")?;
        touched = true;
    }
    if patch.get("categoryId").is_some() {
        let category_id = required_str(&patch, "categoryId")?;
        require_category(conn, &course_id, &category_id)?;
        a.category_id = category_id;
        touched = true;
    }
    if patch.get("pointsEarned").is_some() {
        a.points_earned = points(&patch, "pointsEarned")?;
        touched = true;
    }
    if patch.get("pointsPossible").is_some() {
        a.points_possible = points(&patch, "pointsPossible")?;
        touched = true;
    }
    if patch.get("dueDate").is_some() {
        due_date = parse_due_date(optional_str(&patch, "dueDate")?)?;
        touched = true;
    }
    if patch.get("dueTime").is_some() {
        due_time = parse_due_time(optional_str(&patch, "dueTime")?)?;
        touched = true;
    }
    let requested = parse_status(optional_str(&patch, "status")?)?;
    if requested.is_some() {
        touched = true;
    }
    if !touched {
        return Err(HandlerErr::bad_params(
            "patch must include at least one field",
        ));
    }

    a.status = calc::resolve_updated_status(
        requested,
        a.status,
        a.points_earned,
        a.points_possible,
    );

    if let Some(owner) = title_owner(conn, &course_id, &a.category_id, &a.title)? {
        if owner != assignment_id {
            return Err(HandlerErr::new(
                "conflict",
                "another assignment in that category already has this title",
            )
            .with_details(json!({ "assignmentId": owner })));
        }
    }

    let bind_values: Vec<SqlValue> = vec![
        SqlValue::Text(a.category_id.clone()),
        SqlValue::Text(a.title.clone()),
        a.points_earned.map(SqlValue::Real).unwrap_or(SqlValue::Null),
        a.points_possible.map(SqlValue::Real).unwrap_or(SqlValue::Null),
        SqlValue::Text(a.status.as_str().to_string()),
        due_date.map(SqlValue::Text).unwrap_or(SqlValue::Null),
        due_time.map(SqlValue::Text).unwrap_or(SqlValue::Null),
        SqlValue::Text(assignment_id),
    ];
    conn.execute(
        "UPDATE assignments
         SET category_id = ?, title = ?, points_earned = ?, points_possible = ?,
             status = ?, due_date = ?, due_time = ?
         WHERE id = ?",
        params_from_iter(bind_values),
    )
    .map_err(|e| HandlerErr::write("db_update_failed", "assignments", e))?;

    Ok(json!({ "ok": true, "status": a.status }))
}

fn assignments_delete(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    let assignment_id = required_str(params, "assignmentId")?;
    reject_what_if(&assignment_id)?;
    require_course(conn, &course_id)?;

    let changed = conn
        .execute(
            "DELETE FROM assignments WHERE id = ? AND course_id = ?",
            (&assignment_id, &course_id),
        )
        .map_err(|e| HandlerErr::write("db_delete_failed", "assignments", e))?;
    if changed == 0 {
        return Err(HandlerErr::not_found("assignment not found"));
    }
    Ok(json!({ "ok": true }))
}

fn assignments_reorder(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    // The client list may still carry the what-if row.
    let ordered = calc::without_what_if(string_list(params, "orderedAssignmentIds")?);
    require_course(conn, &course_id)?;

    let current: Vec<String> = db::course_assignments(conn, &course_id)
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|r| r.assignment.id)
        .collect();
    check_permutation("orderedAssignmentIds", &current, &ordered)?;
    write_positions(conn, "assignments", "course_id", &course_id, &ordered)?;

    Ok(json!({ "ok": true, "count": ordered.len() }))
}

struct UpcomingRow {
    row: AssignmentRow,
    course_name: String,
    category_name: String,
}

fn due_order(a: &UpcomingRow, b: &UpcomingRow) -> Ordering {
    // Undated rows sort last.
    match (&a.row.due_date, &b.row.due_date) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then_with(|| {
        let x = a.row.due_time.as_deref().unwrap_or("23:59:59");
        let y = b.row.due_time.as_deref().unwrap_or("23:59:59");
        x.cmp(y)
    })
    .then_with(|| a.row.assignment.title.cmp(&b.row.assignment.title))
    .then_with(|| a.row.assignment.id.cmp(&b.row.assignment.id))
}

fn assignments_upcoming(conn: &Connection, params: &Value) -> Result<Value, HandlerErr> {
    let term_id = optional_str(params, "termId")?;
    let today = optional_str(params, "today")?
        .map(|s| {
            NaiveDate::parse_from_str(&s, DATE_FORMAT)
                .map_err(|_| HandlerErr::bad_params("today must be YYYY-MM-DD"))
        })
        .transpose()?
        .unwrap_or_else(|| chrono::Local::now().date_naive())
        .format(DATE_FORMAT)
        .to_string();

    let columns: Vec<String> = db::ASSIGNMENT_COLUMNS
        .split(',')
        .map(|c| format!("a.{}", c.trim()))
        .collect();
    let mut sql = format!(
        "SELECT {}, c.name, k.name
         FROM assignments a
         JOIN courses c ON c.id = a.course_id
         JOIN categories k ON k.id = a.category_id",
        columns.join(", ")
    );
    let mut bind_values: Vec<SqlValue> = Vec::new();
    if let Some(t) = term_id {
        sql.push_str(" WHERE c.term_id = ?");
        bind_values.push(SqlValue::Text(t));
    }

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let mut rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            Ok(UpcomingRow {
                row: db::assignment_from_row(r)?,
                course_name: r.get(11)?,
                category_name: r.get(12)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    rows.sort_by(due_order);

    let mut graded: Vec<Value> = Vec::new();
    let mut ungraded: Vec<Value> = Vec::new();
    let mut per_course: Map<String, Value> = Map::new();
    for u in &rows {
        let is_graded = u.row.assignment.status == AssignmentStatus::Graded;
        let mut v = assignment_json(&u.row);
        v["courseName"] = json!(u.course_name);
        v["categoryName"] = json!(u.category_name);
        v["dueToday"] = json!(u.row.due_date.as_deref() == Some(today.as_str()));

        let counts = per_course
            .entry(u.row.course_id.clone())
            .or_insert_with(|| json!({ "courseName": u.course_name, "graded": 0, "ungraded": 0 }));
        let key = if is_graded { "graded" } else { "ungraded" };
        counts[key] = json!(counts[key].as_i64().unwrap_or(0) + 1);

        if is_graded {
            graded.push(v);
        } else {
            ungraded.push(v);
        }
    }

    Ok(json!({
        "today": today,
        "ungraded": ungraded,
        "graded": graded,
        "courseCounts": per_course
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "assignments.list" => assignments_list,
        "assignments.create" => assignments_create,
        "assignments.update" => assignments_update,
        "assignments.delete" => assignments_delete,
        "assignments.reorder" => assignments_reorder,
        "assignments.upcoming" => assignments_upcoming,
        _ => return None,
    };
    let result = require_db(state).and_then(|conn| run(conn, &req.params));
    Some(respond(&req.id, result))
}
