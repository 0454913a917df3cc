mod test_support;

use serde_json::json;
use test_support::{admin_token, request, request_ok, setup_campus, spawn_server};

#[tokio::test]
async fn major_lifecycle_and_duplicate_code() {
    let server = spawn_server().await;
    let admin = admin_token(server.addr).await;
    let admin = Some(admin.as_str());

    let created = request_ok(
        server.addr,
        "POST",
        "/api/majors",
        admin,
        Some(json!({ "code": "CS", "name": "Computer Science" })),
    )
    .await;
    let path = format!("/api/majors/{}", created["major"]["id"]);
    assert_eq!(created["major"]["class_count"], 0);

    let dup = request(
        server.addr,
        "POST",
        "/api/majors",
        admin,
        Some(json!({ "code": "CS", "name": "Again" })),
    )
    .await;
    assert_eq!(dup.status, 409);

    let renamed = request_ok(server.addr, "PUT", &path, admin, Some(json!({ "name": "Computing" }))).await;
    assert_eq!(renamed["major"]["name"], "Computing");
    assert_eq!(renamed["major"]["code"], "CS");

    let empty = request(server.addr, "PUT", &path, admin, Some(json!({}))).await;
    assert_eq!(empty.status, 400);

    request_ok(server.addr, "DELETE", &path, admin, None).await;
    assert_eq!(request(server.addr, "GET", &path, admin, None).await.status, 404);
}

#[tokio::test]
async fn referenced_rows_cannot_be_deleted() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let admin = Some(campus.admin.as_str());

    let resp = request(server.addr, "DELETE", &format!("/api/majors/{}", campus.major_id), admin, None).await;
    assert_eq!(resp.status, 409, "{}", resp.text);

    let resp = request(server.addr, "DELETE", &format!("/api/classes/{}", campus.class_id), admin, None).await;
    assert_eq!(resp.status, 409);
    assert_eq!(resp.body["error"]["details"]["student_count"], 2);

    let roster = request_ok(
        server.addr,
        "GET",
        &format!("/api/classes/{}/students", campus.class_id),
        admin,
        None,
    )
    .await;
    assert_eq!(roster["students"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn subjects_validate_credits_and_filter_by_teacher() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let admin = Some(campus.admin.as_str());

    let bad = request(
        server.addr,
        "POST",
        "/api/subjects",
        admin,
        Some(json!({ "code": "ZZ1", "name": "Zero", "credits": 0 })),
    )
    .await;
    assert_eq!(bad.status, 400);

    let dangling = request(
        server.addr,
        "POST",
        "/api/subjects",
        admin,
        Some(json!({ "code": "ZZ2", "name": "Nobody", "credits": 2, "teacher_id": 777 })),
    )
    .await;
    assert_eq!(dangling.status, 400);

    let mine = request_ok(
        server.addr,
        "GET",
        &format!("/api/subjects?teacher_id={}", campus.teacher.profile_id),
        admin,
        None,
    )
    .await;
    let codes: Vec<&str> = mine["subjects"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["code"].as_str().unwrap())
        .collect();
    assert_eq!(codes, vec!["IT101", "MA105"]);

    let own = request_ok(server.addr, "GET", "/api/teacher/subjects", Some(&campus.teacher.token), None).await;
    assert_eq!(own["subjects"].as_array().unwrap().len(), 2);

    let updated = request_ok(
        server.addr,
        "PUT",
        &format!("/api/subjects/{}", campus.physics_id),
        admin,
        Some(json!({ "status": "inactive" })),
    )
    .await;
    assert_eq!(updated["subject"]["status"], "inactive");

    // Inactive subjects are closed for self-enrollment.
    let resp = request(
        server.addr,
        "POST",
        "/api/student/enrollments",
        Some(&campus.students[0].token),
        Some(json!({ "subject_id": campus.physics_id })),
    )
    .await;
    assert_eq!(resp.status, 400);
}

#[tokio::test]
async fn semester_dates_must_be_ordered() {
    let server = spawn_server().await;
    let admin = admin_token(server.addr).await;
    let resp = request(
        server.addr,
        "POST",
        "/api/semesters",
        Some(&admin),
        Some(json!({
            "name": "Backwards",
            "academic_year": "2025-2026",
            "start_date": "2026-01-10",
            "end_date": "2025-09-01",
        })),
    )
    .await;
    assert_eq!(resp.status, 400);

    let resp = request(
        server.addr,
        "POST",
        "/api/semesters",
        Some(&admin),
        Some(json!({
            "name": "Bad date",
            "academic_year": "2025-2026",
            "start_date": "2025-13-01",
            "end_date": "2026-01-01",
        })),
    )
    .await;
    assert_eq!(resp.status, 400);

    let none = request(server.addr, "GET", "/api/semesters/active", Some(&admin), None).await;
    assert_eq!(none.status, 404);
}

#[tokio::test]
async fn teacher_classes_follow_enrollments() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let token = Some(campus.teacher.token.as_str());

    let before = request_ok(server.addr, "GET", "/api/teacher/classes", token, None).await;
    assert!(before["classes"].as_array().unwrap().is_empty());

    test_support::enroll(server.addr, &campus, &campus.students[0], campus.class_id, campus.programming_id).await;
    let after = request_ok(server.addr, "GET", "/api/teacher/classes", token, None).await;
    let classes = after["classes"].as_array().unwrap();
    assert_eq!(classes.len(), 1);
    assert_eq!(classes[0]["id"], campus.class_id);
    assert_eq!(classes[0]["student_count"], 2);
    assert_eq!(classes[0]["is_homeroom"], false);
}
