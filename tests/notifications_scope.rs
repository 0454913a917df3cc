mod test_support;

use serde_json::{json, Value};
use test_support::{enroll, request, request_ok, setup_campus, spawn_server};

fn titles(data: &Value) -> Vec<String> {
    let mut out: Vec<String> = data["notifications"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["title"].as_str().unwrap().to_string())
        .collect();
    out.sort();
    out
}

#[tokio::test]
async fn students_see_global_class_and_subject_notices() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let teacher = Some(campus.teacher.token.as_str());
    enroll(server.addr, &campus, &campus.students[0], campus.class_id, campus.programming_id).await;

    let post = |body: Value| request_ok(server.addr, "POST", "/api/teacher/notifications", teacher, Some(body));
    post(json!({ "title": "everyone", "content": "hello all" })).await;
    post(json!({ "title": "class-a", "content": "room change", "class_id": campus.class_id })).await;
    post(json!({ "title": "class-b", "content": "room change", "class_id": campus.other_class_id })).await;
    post(json!({ "title": "it101", "content": "quiz", "subject_id": campus.programming_id })).await;

    let s0 = request_ok(server.addr, "GET", "/api/student/notifications", Some(&campus.students[0].token), None).await;
    assert_eq!(titles(&s0), vec!["class-a", "everyone", "it101"]);

    let s1 = request_ok(server.addr, "GET", "/api/student/notifications", Some(&campus.students[1].token), None).await;
    assert_eq!(titles(&s1), vec!["class-a", "everyone"]);

    let s2 = request_ok(server.addr, "GET", "/api/student/notifications", Some(&campus.students[2].token), None).await;
    assert_eq!(titles(&s2), vec!["class-b", "everyone"]);
}

#[tokio::test]
async fn teachers_only_touch_their_own_notices() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let created = request_ok(
        server.addr,
        "POST",
        "/api/teacher/notifications",
        Some(&campus.teacher.token),
        Some(json!({ "title": "mine", "content": "x" })),
    )
    .await;
    let path = format!("/api/teacher/notifications/{}", created["notification"]["id"]);

    let other = Some(campus.other_teacher.token.as_str());
    assert_eq!(
        request(server.addr, "PUT", &path, other, Some(json!({ "title": "stolen" }))).await.status,
        404
    );
    assert_eq!(request(server.addr, "DELETE", &path, other, None).await.status, 404);
    let listed = request_ok(server.addr, "GET", "/api/teacher/notifications", other, None).await;
    assert!(listed["notifications"].as_array().unwrap().is_empty());

    // Subject-scoped notices need the teacher to be assigned to the subject.
    let resp = request(
        server.addr,
        "POST",
        "/api/teacher/notifications",
        other,
        Some(json!({ "title": "t", "content": "c", "subject_id": campus.programming_id })),
    )
    .await;
    assert_eq!(resp.status, 403);

    let updated = request_ok(
        server.addr,
        "PUT",
        &path,
        Some(&campus.teacher.token),
        Some(json!({ "title": "renamed" })),
    )
    .await;
    assert_eq!(updated["notification"]["title"], "renamed");
    request_ok(server.addr, "DELETE", &path, Some(&campus.teacher.token), None).await;
}

#[tokio::test]
async fn grade_review_round_trip() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let s0 = &campus.students[0];
    enroll(server.addr, &campus, s0, campus.class_id, campus.programming_id).await;
    let saved = request_ok(
        server.addr,
        "POST",
        "/api/teacher/grades",
        Some(&campus.teacher.token),
        Some(json!({
            "student_id": s0.profile_id,
            "subject_id": campus.programming_id,
            "semester_id": campus.semester_id,
            "process_score": 5, "midterm_score": 5, "final_score": 5,
        })),
    )
    .await;
    let grade_id = saved["grade"]["id"].as_i64().unwrap();

    // Someone else's grade reads as missing.
    let resp = request(
        server.addr,
        "POST",
        "/api/student/grade-reviews",
        Some(&campus.students[1].token),
        Some(json!({ "grade_id": grade_id, "reason": "please" })),
    )
    .await;
    assert_eq!(resp.status, 404);

    let body = json!({ "grade_id": grade_id, "reason": "final exam was miscounted" });
    let review = request_ok(server.addr, "POST", "/api/student/grade-reviews", Some(&s0.token), Some(body.clone())).await;
    assert_eq!(review["review"]["status"], "pending");
    let dup = request(server.addr, "POST", "/api/student/grade-reviews", Some(&s0.token), Some(body)).await;
    assert_eq!(dup.status, 409);

    let path = format!("/api/teacher/grade-reviews/{}", review["review"]["id"]);
    let stranger = request(
        server.addr,
        "PUT",
        &path,
        Some(&campus.other_teacher.token),
        Some(json!({ "response": "no" })),
    )
    .await;
    assert_eq!(stranger.status, 404);

    let pending = request_ok(
        server.addr,
        "GET",
        "/api/teacher/grade-reviews?status=pending",
        Some(&campus.teacher.token),
        None,
    )
    .await;
    assert_eq!(pending["reviews"].as_array().unwrap().len(), 1);

    let answered = request_ok(
        server.addr,
        "PUT",
        &path,
        Some(&campus.teacher.token),
        Some(json!({ "response": "rechecked, score stands" })),
    )
    .await;
    assert_eq!(answered["review"]["status"], "reviewed");
    assert!(answered["review"]["reviewed_at"].is_string());

    let again = request(
        server.addr,
        "PUT",
        &path,
        Some(&campus.teacher.token),
        Some(json!({ "response": "twice" })),
    )
    .await;
    assert_eq!(again.status, 409);

    let mine = request_ok(server.addr, "GET", "/api/student/grade-reviews", Some(&s0.token), None).await;
    assert_eq!(mine["reviews"][0]["response"], "rechecked, score stands");
}
