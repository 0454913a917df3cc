mod test_support;

use serde_json::json;
use test_support::{admin_token, request, request_ok, setup_campus, spawn_server, STUDENT_PASSWORD};

#[tokio::test]
async fn deleted_user_disappears_until_restored() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let victim = &campus.students[1];
    let path = format!("/api/admin/users/{}", victim.user_id);

    request_ok(server.addr, "DELETE", &path, Some(&campus.admin), None).await;

    let login = request(
        server.addr,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": victim.email, "password": STUDENT_PASSWORD })),
    )
    .await;
    assert_eq!(login.status, 401);

    let listed = request_ok(server.addr, "GET", "/api/admin/users?role=student", Some(&campus.admin), None).await;
    assert_eq!(listed["pagination"]["total"], 2);
    let deleted = request_ok(server.addr, "GET", "/api/admin/users?deleted=true", Some(&campus.admin), None).await;
    assert_eq!(deleted["users"][0]["id"], victim.user_id);
    assert!(deleted["users"][0]["deleted_at"].is_string());

    assert_eq!(request(server.addr, "GET", &path, Some(&campus.admin), None).await.status, 404);
    assert_eq!(request(server.addr, "DELETE", &path, Some(&campus.admin), None).await.status, 404);

    let restored = request_ok(
        server.addr,
        "PUT",
        &format!("{path}/restore"),
        Some(&campus.admin),
        None,
    )
    .await;
    assert_eq!(restored["user"]["email"], victim.email);
    test_support::login(server.addr, &victim.email, STUDENT_PASSWORD).await;

    let stats = request_ok(server.addr, "GET", "/api/admin/stats", Some(&campus.admin), None).await;
    assert_eq!(stats["users"]["students"], 3);
    assert_eq!(stats["users"]["deleted"], 0);
}

#[tokio::test]
async fn admin_cannot_delete_or_deactivate_self() {
    let server = spawn_server().await;
    let admin = admin_token(server.addr).await;
    let me = request_ok(server.addr, "GET", "/api/auth/me", Some(&admin), None).await;
    let path = format!("/api/admin/users/{}", me["user"]["id"]);

    let resp = request(server.addr, "DELETE", &path, Some(&admin), None).await;
    assert_eq!(resp.status, 400);
    let resp = request(server.addr, "PUT", &path, Some(&admin), Some(json!({ "status": "inactive" }))).await;
    assert_eq!(resp.status, 400);
}

#[tokio::test]
async fn failed_profile_insert_leaves_no_orphan_user() {
    let server = spawn_server().await;
    let admin = admin_token(server.addr).await;
    let resp = request(
        server.addr,
        "POST",
        "/api/admin/users",
        Some(&admin),
        Some(json!({
            "email": "orphan@sims.test",
            "password": "secret123",
            "full_name": "Orphan",
            "role": "student",
            "class_id": 9999,
        })),
    )
    .await;
    assert_eq!(resp.status, 400, "{}", resp.text);

    let listed = request_ok(server.addr, "GET", "/api/admin/users?q=orphan", Some(&admin), None).await;
    assert_eq!(listed["pagination"]["total"], 0);
}

#[tokio::test]
async fn inactive_user_cannot_log_in_and_role_is_fixed() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let student = &campus.students[0];
    let path = format!("/api/admin/users/{}", student.user_id);

    let resp = request(server.addr, "PUT", &path, Some(&campus.admin), Some(json!({ "role": "teacher" }))).await;
    assert_eq!(resp.status, 400);

    let updated = request_ok(
        server.addr,
        "PUT",
        &path,
        Some(&campus.admin),
        Some(json!({ "status": "inactive", "address": "12 Main St" })),
    )
    .await;
    assert_eq!(updated["user"]["status"], "inactive");
    assert_eq!(updated["user"]["student"]["address"], "12 Main St");

    let login = request(
        server.addr,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": student.email, "password": STUDENT_PASSWORD })),
    )
    .await;
    assert_eq!(login.status, 403);
}

#[tokio::test]
async fn admin_password_reset_and_pagination() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let student = &campus.students[2];

    request_ok(
        server.addr,
        "PUT",
        &format!("/api/admin/users/{}/password", student.user_id),
        Some(&campus.admin),
        Some(json!({ "new_password": "reset-456" })),
    )
    .await;
    test_support::login(server.addr, &student.email, "reset-456").await;

    let page = request_ok(server.addr, "GET", "/api/admin/users?page=2&limit=2", Some(&campus.admin), None).await;
    // admin + 2 teachers + 3 students
    assert_eq!(page["pagination"]["total"], 6);
    assert_eq!(page["pagination"]["pages"], 3);
    assert_eq!(page["users"].as_array().unwrap().len(), 2);

    let bad = request(server.addr, "GET", "/api/admin/users?limit=500", Some(&campus.admin), None).await;
    assert_eq!(bad.status, 400);

    for path in [
        "/api/admin/users?page=9223372036854775807",
        "/api/admin/enrollments?page=9223372036854775807",
    ] {
        let huge = request(server.addr, "GET", path, Some(&campus.admin), None).await;
        assert_eq!(huge.status, 400, "{path}: {}", huge.text);
        assert_eq!(huge.error_code(), "bad_params");
    }
}

#[tokio::test]
async fn students_edit_only_their_contact_details() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let student = &campus.students[0];
    let token = Some(student.token.as_str());

    let profile = request_ok(server.addr, "GET", "/api/student/profile", token, None).await;
    assert_eq!(profile["profile"]["email"], student.email.as_str());
    assert_eq!(profile["profile"]["student"]["class_id"], campus.class_id);

    let updated = request_ok(
        server.addr,
        "PUT",
        "/api/student/profile",
        token,
        Some(json!({ "phone": "0901234567", "address": "12 Le Loi" })),
    )
    .await;
    assert_eq!(updated["profile"]["phone"], "0901234567");
    assert_eq!(updated["profile"]["student"]["address"], "12 Le Loi");

    let empty = request(server.addr, "PUT", "/api/student/profile", token, Some(json!({}))).await;
    assert_eq!(empty.status, 400);

    let teacher = request(server.addr, "GET", "/api/student/profile", Some(&campus.teacher.token), None).await;
    assert_eq!(teacher.status, 403);
}

#[tokio::test]
async fn outstanding_tokens_lose_access_after_delete_or_deactivate() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let admin = Some(campus.admin.as_str());

    let teacher = &campus.other_teacher;
    request_ok(server.addr, "GET", "/api/teacher/subjects", Some(&teacher.token), None).await;
    request_ok(server.addr, "DELETE", &format!("/api/admin/users/{}", teacher.user_id), admin, None).await;
    let resp = request(server.addr, "GET", "/api/teacher/subjects", Some(&teacher.token), None).await;
    assert_eq!(resp.status, 401, "{}", resp.text);

    let student = &campus.students[1];
    request_ok(
        server.addr,
        "PUT",
        &format!("/api/admin/users/{}", student.user_id),
        admin,
        Some(json!({ "status": "inactive" })),
    )
    .await;
    let resp = request(server.addr, "GET", "/api/student/grades", Some(&student.token), None).await;
    assert_eq!(resp.status, 403);
}
