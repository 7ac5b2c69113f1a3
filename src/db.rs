use crate::calc::{Assignment, AssignmentStatus, Category};
use rusqlite::{Connection, OptionalExtension};
use std::cmp::Ordering;
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS terms(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            position INTEGER NOT NULL,
            archived INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            term_id TEXT,
            name TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY(term_id) REFERENCES terms(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_term ON courses(term_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS categories(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            weight REAL NOT NULL DEFAULT 0,
            drop_lowest INTEGER NOT NULL DEFAULT 0,
            position INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    ensure_categories_position(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_categories_course ON categories(course_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assignments(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            category_id TEXT NOT NULL,
            title TEXT NOT NULL,
            points_earned REAL,
            points_possible REAL,
            status TEXT NOT NULL DEFAULT 'planned',
            due_date TEXT,
            due_time TEXT,
            position INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(category_id) REFERENCES categories(id),
            UNIQUE(course_id, category_id, title)
        )",
        [],
    )?;
    ensure_assignments_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_course ON assignments(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assignments_category ON assignments(category_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value_json TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

fn ensure_categories_position(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "categories", "position")? {
        return Ok(());
    }
    // Older workspaces ordered categories by weight only; leave position NULL so that still applies.
    conn.execute("ALTER TABLE categories ADD COLUMN position INTEGER", [])?;
    Ok(())
}

fn ensure_assignments_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "assignments", "due_time")? {
        conn.execute("ALTER TABLE assignments ADD COLUMN due_time TEXT", [])?;
    }
    if !table_has_column(conn, "assignments", "position")? {
        conn.execute("ALTER TABLE assignments ADD COLUMN position INTEGER", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn settings_get_json(
    conn: &Connection,
    key: &str,
) -> anyhow::Result<Option<serde_json::Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value_json FROM settings WHERE key = ?",
            [key],
            |r| r.get(0),
        )
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(
    conn: &Connection,
    key: &str,
    value: &serde_json::Value,
) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value_json) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct CategoryRow {
    pub category: Category,
    pub position: Option<i64>,
}

/// Position order once any category has been placed, otherwise heaviest first.
pub fn order_categories(rows: &mut [CategoryRow]) {
    let has_positions = rows.iter().any(|r| r.position.is_some());
    rows.sort_by(|a, b| {
        let primary = if has_positions {
            a.position.unwrap_or(0).cmp(&b.position.unwrap_or(0))
        } else {
            b.category
                .weight
                .partial_cmp(&a.category.weight)
                .unwrap_or(Ordering::Equal)
        };
        primary.then_with(|| a.category.id.cmp(&b.category.id))
    });
}

pub fn course_categories(conn: &Connection, course_id: &str) -> anyhow::Result<Vec<CategoryRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, weight, drop_lowest, position
         FROM categories
         WHERE course_id = ?",
    )?;
    let mut rows = stmt
        .query_map([course_id], |r| {
            let drop_lowest: i64 = r.get(3)?;
            Ok(CategoryRow {
                category: Category {
                    id: r.get(0)?,
                    name: r.get(1)?,
                    weight: r.get(2)?,
                    drop_lowest: u32::try_from(drop_lowest.max(0)).unwrap_or(u32::MAX),
                },
                position: r.get(4)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    order_categories(&mut rows);
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct AssignmentRow {
    pub assignment: Assignment,
    pub course_id: String,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    pub position: Option<i64>,
    pub created_at: String,
}

pub const ASSIGNMENT_COLUMNS: &str = "id, category_id, title, points_earned, points_possible, status,
     course_id, due_date, due_time, position, created_at";

pub fn assignment_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<AssignmentRow> {
    let status: String = r.get(5)?;
    Ok(AssignmentRow {
        assignment: Assignment {
            id: r.get(0)?,
            category_id: r.get(1)?,
            title: r.get(2)?,
            points_earned: r.get(3)?,
            points_possible: r.get(4)?,
            status: status.parse().unwrap_or(AssignmentStatus::Planned),
        },
        course_id: r.get(6)?,
        due_date: r.get(7)?,
        due_time: r.get(8)?,
        position: r.get(9)?,
        created_at: r.get(10)?,
    })
}

/// Assignments of a course: by position once any has been placed, otherwise newest first.
pub fn course_assignments(
    conn: &Connection,
    course_id: &str,
) -> anyhow::Result<Vec<AssignmentRow>> {
    let sql = format!(
        "SELECT {} FROM assignments WHERE course_id = ?",
        ASSIGNMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt
        .query_map([course_id], assignment_from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    let has_positions = rows.iter().any(|r| r.position.is_some());
    rows.sort_by(|a, b| {
        let primary = if has_positions {
            a.position.unwrap_or(0).cmp(&b.position.unwrap_or(0))
        } else {
            b.created_at.cmp(&a.created_at)
        };
        primary.then_with(|| a.assignment.id.cmp(&b.assignment.id))
    });
    Ok(rows)
}

pub fn course_exists(conn: &Connection, course_id: &str) -> anyhow::Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM courses WHERE id = ?", [course_id], |r| {
            r.get::<_, i64>(0)
        })
        .optional()?
        .is_some())
}
