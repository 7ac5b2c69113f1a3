mod test_support;

use serde_json::{json, Value};
use test_support::{error_code, request, request_ok, spawn_sidecar, str_field, temp_dir};

fn f64_at(value: &Value, pointer: &str) -> f64 {
    value
        .pointer(pointer)
        .and_then(|v| v.as_f64())
        .unwrap_or_else(|| panic!("missing number at {} in {}", pointer, value))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> &'a str {
    value
        .pointer(pointer)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing string at {} in {}", pointer, value))
}

#[test]
fn weighted_grade_what_if_and_sentinel_safe_reorder() {
    let workspace = temp_dir("gradebook-course-grades");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "name": "Chemistry" }),
    );
    let course_id = str_field(&course, "courseId");
    let homework = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "categories.create",
        json!({ "courseId": course_id, "name": "Homework", "weight": 40 }),
    );
    let homework_id = str_field(&homework, "categoryId");
    let exams = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "categories.create",
        json!({ "courseId": course_id, "name": "Exams", "weight": 60 }),
    );
    let exams_id = str_field(&exams, "categoryId");

    let hw1 = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.create",
        json!({
            "courseId": course_id,
            "categoryId": homework_id,
            "title": "HW 1",
            "pointsEarned": 9,
            "pointsPossible": 10
        }),
    );
    let hw1_id = str_field(&hw1, "assignmentId");
    let midterm = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "assignments.create",
        json!({
            "courseId": course_id,
            "categoryId": exams_id,
            "title": "Midterm",
            "pointsEarned": 8,
            "pointsPossible": 10
        }),
    );
    let midterm_id = str_field(&midterm, "assignmentId");

    let grades = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.course",
        json!({ "courseId": course_id }),
    );
    assert!((f64_at(&grades, "/overall/weighted") - 0.84).abs() < 1e-9);
    assert_eq!(str_at(&grades, "/overall/weightedText"), "84.0%");
    assert_eq!(str_at(&grades, "/overall/pointsText"), "17/20");
    assert_eq!(grades.get("whatIfApplied").and_then(|v| v.as_bool()), Some(false));
    let contribution = grades
        .get("categories")
        .and_then(|v| v.as_array())
        .and_then(|rows| {
            rows.iter()
                .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(exams_id.as_str()))
        })
        .map(|r| f64_at(r, "/contribution"))
        .expect("exams row");
    assert!((contribution - 0.48).abs() < 1e-9);

    let projected = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.course",
        json!({
            "courseId": course_id,
            "whatIf": { "categoryId": exams_id, "pointsEarned": 10, "pointsPossible": 10 }
        }),
    );
    assert_eq!(projected.get("whatIfApplied").and_then(|v| v.as_bool()), Some(true));
    assert!((f64_at(&projected, "/overall/weighted") - 0.90).abs() < 1e-9);
    assert!((f64_at(&projected, "/overall/unweighted") - 0.85).abs() < 1e-9);

    // The projection never reaches the store.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "assignments.list",
        json!({ "courseId": course_id }),
    );
    assert_eq!(
        listed.get("assignments").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );

    let reorder = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "assignments.reorder",
        json!({
            "courseId": course_id,
            "orderedAssignmentIds": [midterm_id, "__what_if__", hw1_id]
        }),
    );
    assert_eq!(reorder.get("count").and_then(|v| v.as_u64()), Some(2));
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "assignments.list",
        json!({ "courseId": course_id }),
    );
    let order: Vec<&str> = listed
        .get("assignments")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|r| r.get("id").and_then(|v| v.as_str())).collect())
        .unwrap_or_default();
    assert_eq!(order, vec![midterm_id.as_str(), hw1_id.as_str()]);

    let delete_sentinel = request(
        &mut stdin,
        &mut reader,
        "12",
        "assignments.delete",
        json!({ "courseId": course_id, "assignmentId": "__what_if__" }),
    );
    assert_eq!(error_code(&delete_sentinel), Some("bad_params"));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn display_digits_come_from_request_then_workspace() {
    let workspace = temp_dir("gradebook-course-digits");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "courses.create",
        json!({ "name": "Physics" }),
    );
    let course_id = str_field(&course, "courseId");
    let labs = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "categories.create",
        json!({ "courseId": course_id, "name": "Labs", "weight": 100 }),
    );
    let labs_id = str_field(&labs, "categoryId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assignments.create",
        json!({
            "courseId": course_id,
            "categoryId": labs_id,
            "title": "Lab 1",
            "pointsEarned": 2,
            "pointsPossible": 3
        }),
    );

    let two = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "grades.course",
        json!({ "courseId": course_id, "digits": 2 }),
    );
    assert_eq!(str_at(&two, "/overall/weightedText"), "66.67%");

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "settings.set",
        json!({ "key": "display.digits", "value": 0 }),
    );
    let zero = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.course",
        json!({ "courseId": course_id }),
    );
    assert_eq!(str_at(&zero, "/overall/weightedText"), "67%");

    let rejected = request(
        &mut stdin,
        &mut reader,
        "8",
        "settings.set",
        json!({ "key": "display.digits", "value": 9 }),
    );
    assert_eq!(error_code(&rejected), Some("bad_params"));
    let stored = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "settings.get",
        json!({ "key": "display.digits" }),
    );
    assert_eq!(stored.get("value").and_then(|v| v.as_u64()), Some(0));

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn dashboard_reports_each_course_in_a_term() {
    let workspace = temp_dir("gradebook-dashboard");
    let (_child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let term = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "terms.create",
        json!({ "name": "Spring" }),
    );
    let term_id = str_field(&term, "termId");

    let graded = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "courses.create",
        json!({ "name": "History", "termId": term_id }),
    );
    let graded_id = str_field(&graded, "courseId");
    let essays = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "categories.create",
        json!({ "courseId": graded_id, "name": "Essays", "weight": 50 }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "assignments.create",
        json!({
            "courseId": graded_id,
            "categoryId": str_field(&essays, "categoryId"),
            "title": "Essay 1",
            "pointsEarned": 18,
            "pointsPossible": 20
        }),
    );
    let empty = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "courses.create",
        json!({ "name": "Art", "termId": term_id }),
    );
    let empty_id = str_field(&empty, "courseId");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "courses.create",
        json!({ "name": "Unfiled" }),
    );

    let dashboard = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.dashboard",
        json!({ "termId": term_id }),
    );
    let rows = dashboard
        .get("courses")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    assert_eq!(rows.len(), 2);

    let row = |id: &str| -> Value {
        rows.iter()
            .find(|r| r.get("courseId").and_then(|v| v.as_str()) == Some(id))
            .cloned()
            .unwrap_or_else(|| panic!("course {} missing", id))
    };
    // Weights are not normalized: 90% in a 50% category is 45% overall.
    let history = row(&graded_id);
    assert!((f64_at(&history, "/weighted") - 0.45).abs() < 1e-9);
    assert!((f64_at(&history, "/unweighted") - 0.9).abs() < 1e-9);
    assert_eq!(str_at(&history, "/pointsText"), "18/20");

    let art = row(&empty_id);
    assert!(art.get("weighted").map(|v| v.is_null()).unwrap_or(false));
    assert_eq!(str_at(&art, "/weightedText"), "—");
    assert!(art.get("unweighted").map(|v| v.is_null()).unwrap_or(false));

    let _ = std::fs::remove_dir_all(workspace);
}
