mod test_support;

use serde_json::json;
use test_support::{enroll, request, request_ok, setup_campus, spawn_server};

fn close(value: &serde_json::Value, expected: f64) -> bool {
    value.as_f64().map(|v| (v - expected).abs() < 1e-9).unwrap_or(false)
}

#[tokio::test]
async fn bulk_entry_is_all_or_nothing() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let teacher = Some(campus.teacher.token.as_str());
    let s0 = &campus.students[0];
    let s2 = &campus.students[2];
    enroll(server.addr, &campus, s0, campus.class_id, campus.programming_id).await;

    // s2 is not enrolled, so the second row fails and the first is discarded.
    let resp = request(
        server.addr,
        "POST",
        "/api/teacher/grades/bulk",
        teacher,
        Some(json!({
            "subject_id": campus.programming_id,
            "semester_id": campus.semester_id,
            "grades": [
                { "student_id": s0.profile_id, "process_score": 8, "midterm_score": 7, "final_score": 6 },
                { "student_id": s2.profile_id, "process_score": 5 },
            ],
        })),
    )
    .await;
    assert_eq!(resp.status, 400, "{}", resp.text);
    assert_eq!(resp.body["error"]["details"]["index"], 1);

    let listed = request_ok(
        server.addr,
        "GET",
        &format!(
            "/api/teacher/grades?subject_id={}&semester_id={}",
            campus.programming_id, campus.semester_id
        ),
        teacher,
        None,
    )
    .await;
    assert_eq!(listed["students"].as_array().unwrap().len(), 1);
    assert!(listed["students"][0]["grade"]["id"].is_null());

    let out_of_range = request(
        server.addr,
        "POST",
        "/api/teacher/grades",
        teacher,
        Some(json!({
            "student_id": s0.profile_id,
            "subject_id": campus.programming_id,
            "semester_id": campus.semester_id,
            "final_score": 11,
        })),
    )
    .await;
    assert_eq!(out_of_range.status, 400);
}

#[tokio::test]
async fn only_the_assigned_teacher_may_grade() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let s0 = &campus.students[0];
    enroll(server.addr, &campus, s0, campus.class_id, campus.physics_id).await;

    let resp = request(
        server.addr,
        "POST",
        "/api/teacher/grades",
        Some(&campus.teacher.token),
        Some(json!({
            "student_id": s0.profile_id,
            "subject_id": campus.physics_id,
            "semester_id": campus.semester_id,
            "process_score": 7,
        })),
    )
    .await;
    assert_eq!(resp.status, 403);
    assert_eq!(resp.error_code(), "forbidden");
}

#[tokio::test]
async fn partial_scores_merge_and_complete_the_enrollment() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let teacher = Some(campus.teacher.token.as_str());
    let s0 = &campus.students[0];
    enroll(server.addr, &campus, s0, campus.class_id, campus.programming_id).await;
    let base = json!({
        "student_id": s0.profile_id,
        "subject_id": campus.programming_id,
        "semester_id": campus.semester_id,
    });

    let mut first = base.clone();
    first["process_score"] = json!(8);
    let saved = request_ok(server.addr, "POST", "/api/teacher/grades", teacher, Some(first)).await;
    assert!(saved["grade"]["average_score"].is_null());
    assert!(saved["grade"]["letter_grade"].is_null());

    let mut rest = base.clone();
    rest["midterm_score"] = json!(7);
    rest["final_score"] = json!(6);
    let saved = request_ok(server.addr, "POST", "/api/teacher/grades", teacher, Some(rest)).await;
    let grade = &saved["grade"];
    assert_eq!(grade["process_score"], 8.0);
    assert!(close(&grade["average_score"], 7.1), "{grade}");
    assert_eq!(grade["letter_grade"], "B");
    assert_eq!(grade["passed"], true);

    let enrollments = request_ok(server.addr, "GET", "/api/student/enrollments", Some(&s0.token), None).await;
    assert_eq!(enrollments["enrollments"][0]["status"], "completed");

    let updated = request_ok(
        server.addr,
        "PUT",
        &format!("/api/teacher/grades/{}", grade["id"]),
        teacher,
        Some(json!({ "final_score": 9 })),
    )
    .await;
    assert!(close(&updated["grade"]["average_score"], 8.0), "{}", updated["grade"]);
    assert_eq!(updated["grade"]["letter_grade"], "B+");
}

#[tokio::test]
async fn gpa_is_credit_weighted_per_semester_and_overall() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let teacher = Some(campus.teacher.token.as_str());
    let s0 = &campus.students[0];
    enroll(server.addr, &campus, s0, campus.class_id, campus.programming_id).await;
    enroll(server.addr, &campus, s0, campus.class_id, campus.math_id).await;

    let saved = request_ok(
        server.addr,
        "POST",
        "/api/teacher/grades/bulk",
        teacher,
        Some(json!({
            "semester_id": campus.semester_id,
            "grades": [
                { "student_id": s0.profile_id, "subject_id": campus.programming_id,
                  "process_score": 8, "midterm_score": 7, "final_score": 6 },
                { "student_id": s0.profile_id, "subject_id": campus.math_id,
                  "process_score": 9, "midterm_score": 9, "final_score": 9 },
            ],
        })),
    )
    .await;
    assert_eq!(saved["count"], 2);

    let gpa = request_ok(server.addr, "GET", "/api/student/gpa", Some(&s0.token), None).await;
    let semesters = gpa["semesters"].as_array().unwrap();
    assert_eq!(semesters.len(), 1);
    assert_eq!(semesters[0]["semester_id"], campus.semester_id);
    assert!(close(&semesters[0]["gpa"], 3.4), "{gpa}");
    assert!(close(&gpa["cumulative"]["gpa"], 3.4));
    assert_eq!(gpa["cumulative"]["total_credits"], 5);
    assert_eq!(gpa["cumulative"]["earned_credits"], 5);
    assert_eq!(gpa["cumulative"]["standing"], "very_good");

    let grades = request_ok(server.addr, "GET", "/api/student/grades", Some(&s0.token), None).await;
    let letters: Vec<&str> = grades["grades"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["letter_grade"].as_str().unwrap())
        .collect();
    assert_eq!(letters, vec!["B", "A"]);

    // Another student with nothing graded has no GPA yet.
    let empty = request_ok(server.addr, "GET", "/api/student/gpa", Some(&campus.students[1].token), None).await;
    assert!(empty["cumulative"]["gpa"].is_null());
    assert_eq!(empty["semesters"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn dropped_enrollments_cannot_be_regraded() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let teacher = Some(campus.teacher.token.as_str());
    let s0 = &campus.students[0];
    let enrollment_id = enroll(server.addr, &campus, s0, campus.class_id, campus.programming_id).await;

    let saved = request_ok(
        server.addr,
        "POST",
        "/api/teacher/grades",
        teacher,
        Some(json!({
            "student_id": s0.profile_id,
            "subject_id": campus.programming_id,
            "semester_id": campus.semester_id,
            "process_score": 5,
        })),
    )
    .await;
    let grade_path = format!("/api/teacher/grades/{}", saved["grade"]["id"]);

    request_ok(
        server.addr,
        "DELETE",
        &format!("/api/student/enrollments/{enrollment_id}"),
        Some(&s0.token),
        None,
    )
    .await;

    let resp = request(
        server.addr,
        "PUT",
        &grade_path,
        teacher,
        Some(json!({ "midterm_score": 9, "final_score": 9 })),
    )
    .await;
    assert_eq!(resp.status, 400, "{}", resp.text);
    assert_eq!(resp.error_code(), "bad_params");

    let listed = request_ok(server.addr, "GET", "/api/student/grades", Some(&s0.token), None).await;
    assert!(listed["grades"][0]["midterm_score"].is_null());
}
