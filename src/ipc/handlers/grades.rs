use crate::calc::{self, Assignment, Category, WhatIf};
use crate::config;
use crate::db;
use crate::ipc::helpers::{
    optional_i64, optional_str, require_course, require_db, required_str, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use serde_json::{json, Value};

pub const DIGITS_SETTING_KEY: &str = "display.digits";

/// Request `digits`, then the workspace preference, then the process default.
fn display_digits(
    conn: &Connection,
    params: &Value,
    fallback: usize,
) -> Result<usize, HandlerErr> {
    if let Some(n) = optional_i64(params, "digits")? {
        return config::parse_digits("digits", n.to_string())
            .map_err(|e| HandlerErr::bad_params(e.to_string()));
    }
    let stored = db::settings_get_json(conn, DIGITS_SETTING_KEY).map_err(HandlerErr::query)?;
    let from_workspace = stored
        .and_then(|v| v.as_u64())
        .and_then(|n| config::parse_digits(DIGITS_SETTING_KEY, n.to_string()).ok());
    Ok(from_workspace.unwrap_or(fallback))
}

fn load_course(
    conn: &Connection,
    course_id: &str,
) -> Result<(Vec<Category>, Vec<Assignment>), HandlerErr> {
    let categories = db::course_categories(conn, course_id)
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|r| r.category)
        .collect();
    let assignments = db::course_assignments(conn, course_id)
        .map_err(HandlerErr::query)?
        .into_iter()
        .map(|r| r.assignment)
        .collect();
    Ok((categories, assignments))
}

fn parse_what_if(params: &Value, categories: &[Category]) -> Result<Option<WhatIf>, HandlerErr> {
    let Some(raw) = params.get("whatIf").filter(|v| !v.is_null()) else {
        return Ok(None);
    };
    let what_if: WhatIf = serde_json::from_value(raw.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid whatIf: {}", e)))?;
    if !categories.iter().any(|c| c.id == what_if.category_id) {
        return Err(
            HandlerErr::bad_params("whatIf.categoryId is not a category of this course")
                .with_details(json!({ "categoryId": what_if.category_id })),
        );
    }
    Ok(Some(what_if))
}

fn points_text(totals: &calc::PointTotals) -> String {
    format!("{}/{}", totals.earned, totals.possible)
}

fn grades_course(
    conn: &Connection,
    params: &Value,
    fallback_digits: usize,
) -> Result<Value, HandlerErr> {
    let course_id = required_str(params, "courseId")?;
    require_course(conn, &course_id)?;
    let digits = display_digits(conn, params, fallback_digits)?;

    let (categories, assignments) = load_course(conn, &course_id)?;
    let what_if = parse_what_if(params, &categories)?;
    // Inputs that cannot be scored fall back to the plain grade.
    let what_if_applied = what_if.as_ref().and_then(WhatIf::to_assignment).is_some();
    let stats = calc::project_course_stats(&categories, &assignments, what_if.as_ref());

    let category_rows: Vec<Value> = categories
        .iter()
        .map(|c| {
            let weighted = stats.category_weighted.get(&c.id).copied().flatten();
            let unweighted = stats.category_unweighted.get(&c.id).copied().flatten();
            let contribution = stats.category_contribution.get(&c.id).copied().flatten();
            let points = stats.category_points.get(&c.id).copied().unwrap_or_default();
            json!({
                "id": c.id,
                "name": c.name,
                "weight": c.weight,
                "dropLowest": c.drop_lowest,
                "average": weighted,
                "averageText": calc::format_pct(weighted, digits),
                "unweighted": unweighted,
                "unweightedText": calc::format_pct(unweighted, digits),
                "contribution": contribution,
                "contributionText": calc::format_pct(contribution, digits),
                "points": points,
                "pointsText": points_text(&points)
            })
        })
        .collect();

    Ok(json!({
        "courseId": course_id,
        "digits": digits,
        "whatIfApplied": what_if_applied,
        "overall": {
            "weighted": stats.overall_weighted,
            "weightedText": calc::format_pct(Some(stats.overall_weighted), digits),
            "unweighted": stats.overall_unweighted,
            "unweightedText": calc::format_pct(Some(stats.overall_unweighted), digits),
            "points": stats.totals,
            "pointsText": points_text(&stats.totals)
        },
        "categories": category_rows,
        "stats": stats
    }))
}

fn grades_dashboard(
    conn: &Connection,
    params: &Value,
    fallback_digits: usize,
) -> Result<Value, HandlerErr> {
    let term_id = optional_str(params, "termId")?;
    let digits = display_digits(conn, params, fallback_digits)?;

    let mut sql = String::from(
        "SELECT c.id, c.name, c.term_id, t.name
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
        .query_map(params_from_iter(bind_values), |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, Option<String>>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut rows: Vec<Value> = Vec::with_capacity(courses.len());
    for (course_id, name, term_id, term_name) in courses {
        let (categories, assignments) = load_course(conn, &course_id)?;
        let stats = calc::compute_course_stats(&categories, &assignments);
        // A course with no categories has no weighted grade yet.
        let weighted = (!categories.is_empty()).then_some(stats.overall_weighted);
        let unweighted = stats.totals.ratio();
        rows.push(json!({
            "courseId": course_id,
            "name": name,
            "termId": term_id,
            "termName": term_name,
            "weighted": weighted,
            "weightedText": calc::format_pct(weighted, digits),
            "unweighted": unweighted,
            "unweightedText": calc::format_pct(unweighted, digits),
            "points": stats.totals,
            "pointsText": points_text(&stats.totals)
        }));
    }

    Ok(json!({ "digits": digits, "courses": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let run: fn(&Connection, &Value, usize) -> Result<Value, HandlerErr> =
        match req.method.as_str() {
            "grades.course" => grades_course,
            "grades.dashboard" => grades_dashboard,
            _ => return None,
        };
    let fallback_digits = state.settings.pct_digits();
    let result = require_db(state).and_then(|conn| run(conn, &req.params, fallback_digits));
    Some(respond(&req.id, result))
}
