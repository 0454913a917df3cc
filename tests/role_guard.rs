mod test_support;

use serde_json::json;
use test_support::{request, send_raw, setup_campus, spawn_server};

#[tokio::test]
async fn protected_routes_need_a_token() {
    let server = spawn_server().await;
    for path in ["/api/auth/me", "/api/majors", "/api/admin/users", "/api/student/gpa"] {
        let resp = request(server.addr, "GET", path, None, None).await;
        assert_eq!(resp.status, 401, "{path}");
        assert_eq!(resp.body["success"], false);
        assert_eq!(resp.error_code(), "unauthorized");
    }
    let health = request(server.addr, "GET", "/api/health", None, None).await;
    assert_eq!(health.status, 200);
    assert_eq!(health.data()["database"], "ok");
}

#[tokio::test]
async fn each_role_is_confined_to_its_area() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let student = &campus.students[0].token;
    let teacher = &campus.teacher.token;

    let cases: [(&str, &str, &str); 6] = [
        (student.as_str(), "GET", "/api/admin/users"),
        (student.as_str(), "GET", "/api/teacher/subjects"),
        (student.as_str(), "POST", "/api/majors"),
        (teacher.as_str(), "GET", "/api/admin/stats"),
        (teacher.as_str(), "GET", "/api/student/grades"),
        (campus.admin.as_str(), "GET", "/api/teacher/schedule"),
    ];
    for (token, method, path) in cases {
        let resp = request(server.addr, method, path, Some(token), Some(json!({}))).await;
        assert_eq!(resp.status, 403, "{method} {path}: {}", resp.text);
        assert_eq!(resp.error_code(), "forbidden");
    }

    // Shared catalog reads are open to every signed-in role.
    for token in [student, teacher, &campus.admin] {
        let resp = request(server.addr, "GET", "/api/subjects", Some(token), None).await;
        assert_eq!(resp.status, 200);
    }
    let roster = format!("/api/classes/{}/students", campus.class_id);
    assert_eq!(request(server.addr, "GET", &roster, Some(teacher), None).await.status, 200);
    assert_eq!(request(server.addr, "GET", &roster, Some(student), None).await.status, 403);
}

#[tokio::test]
async fn unknown_routes_use_the_error_envelope() {
    let server = spawn_server().await;
    let resp = request(server.addr, "GET", "/api/nowhere", None, None).await;
    assert_eq!(resp.status, 404);
    assert_eq!(resp.body["success"], false);
    assert_eq!(resp.error_code(), "not_found");
}

#[tokio::test]
async fn request_id_is_echoed_or_generated() {
    let server = spawn_server().await;
    let raw = format!(
        "GET /api/health HTTP/1.1\r\nHost: {}\r\nX-Request-Id: trace-42\r\nConnection: close\r\n\r\n",
        server.addr
    );
    let resp = send_raw(server.addr, raw).await;
    assert_eq!(resp.header("x-request-id").as_deref(), Some("trace-42"));

    let resp = request(server.addr, "GET", "/api/health", None, None).await;
    let generated = resp.header("x-request-id").expect("request id header");
    assert_eq!(generated.len(), 36);
}

#[tokio::test]
async fn cors_preflight_allows_configured_origin_only() {
    let server = spawn_server().await;
    let preflight = |origin: &str| {
        format!(
            "OPTIONS /api/auth/login HTTP/1.1\r\nHost: {}\r\nOrigin: {origin}\r\n\
             Access-Control-Request-Method: POST\r\nConnection: close\r\n\r\n",
            server.addr
        )
    };
    let allowed = send_raw(server.addr, preflight("http://localhost:3000")).await;
    assert_eq!(allowed.status, 204);
    assert_eq!(
        allowed.header("access-control-allow-origin").as_deref(),
        Some("http://localhost:3000")
    );
    assert!(allowed
        .header("access-control-allow-methods")
        .unwrap_or_default()
        .contains("PUT"));

    let denied = send_raw(server.addr, preflight("http://evil.example")).await;
    assert!(denied.header("access-control-allow-origin").is_none());
}

#[tokio::test]
async fn malformed_json_body_is_a_bad_request() {
    let server = spawn_server().await;
    let body = "{\"email\": ";
    let raw = format!(
        "POST /api/auth/login HTTP/1.1\r\nHost: {}\r\nContent-Type: application/json\r\n\
         Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
        server.addr,
        body.len()
    );
    let resp = send_raw(server.addr, raw).await;
    assert_eq!(resp.status, 400);
    assert_eq!(resp.error_code(), "bad_params");
}
