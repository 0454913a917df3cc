#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;

use serde_json::{json, Value};
use sims::{build_router, db, seed, AppState, Config};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const ADMIN_EMAIL: &str = "admin@sims.local";
pub const ADMIN_PASSWORD: &str = "admin123";
pub const STUDENT_PASSWORD: &str = "student123";
pub const TEACHER_PASSWORD: &str = "teacher123";

pub struct TestServer {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    _dir: tempfile::TempDir,
}

pub async fn spawn_server() -> TestServer {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("sims.sqlite3");
    {
        let conn = db::open_connection(&db_path).expect("open db");
        db::migrate(&conn).expect("migrate");
        seed::ensure_admin(&conn, ADMIN_EMAIL, ADMIN_PASSWORD).expect("seed admin");
    }
    let mut config = Config::for_database(&db_path);
    config.db_pool_size = 4;
    config.jwt_secret = "integration-test-secret".to_string();

    let app = build_router(AppState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    TestServer {
        addr,
        db_path,
        _dir: dir,
    }
}

pub struct Response {
    pub status: u16,
    pub head: String,
    pub text: String,
    pub body: Value,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<String> {
        let prefix = format!("{}:", name.to_ascii_lowercase());
        self.head.lines().find_map(|line| {
            line.to_ascii_lowercase()
                .starts_with(&prefix)
                .then(|| line[prefix.len()..].trim().to_string())
        })
    }

    pub fn data(&self) -> &Value {
        &self.body["data"]
    }

    pub fn error_code(&self) -> &str {
        self.body["error"]["code"].as_str().unwrap_or("")
    }
}

pub async fn send_raw(addr: SocketAddr, raw: String) -> Response {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(raw.as_bytes()).await.expect("write request");
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.expect("read response");
    let text = String::from_utf8_lossy(&buf).to_string();
    let (head, body) = text.split_once("\r\n\r\n").unwrap_or((&text, ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .expect("status code");
    Response {
        status,
        head: head.to_string(),
        text: body.to_string(),
        body: serde_json::from_str(body).unwrap_or(Value::Null),
    }
}

pub async fn request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Response {
    let payload = body.map(|b| b.to_string()).unwrap_or_default();
    let mut raw = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    if let Some(t) = token {
        raw.push_str(&format!("Authorization: Bearer {t}\r\n"));
    }
    if !payload.is_empty() {
        raw.push_str("Content-Type: application/json\r\n");
    }
    raw.push_str(&format!("Content-Length: {}\r\n\r\n{payload}", payload.len()));
    send_raw(addr, raw).await
}

/// Asserts a 2xx envelope and returns its `data`.
pub async fn request_ok(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<Value>,
) -> Value {
    let resp = request(addr, method, path, token, body).await;
    assert!(
        (200..300).contains(&resp.status),
        "{method} {path} -> {}: {}",
        resp.status,
        resp.text
    );
    assert_eq!(resp.body["success"], true, "{}", resp.text);
    resp.body["data"].clone()
}

pub async fn login(addr: SocketAddr, email: &str, password: &str) -> String {
    let data = request_ok(
        addr,
        "POST",
        "/api/auth/login",
        None,
        Some(json!({ "email": email, "password": password })),
    )
    .await;
    data["token"].as_str().expect("token").to_string()
}

pub async fn admin_token(addr: SocketAddr) -> String {
    login(addr, ADMIN_EMAIL, ADMIN_PASSWORD).await
}

pub struct Person {
    pub user_id: i64,
    /// teachers.id or students.id
    pub profile_id: i64,
    pub email: String,
    pub token: String,
}

pub struct Campus {
    pub admin: String,
    pub major_id: i64,
    pub class_id: i64,
    pub other_class_id: i64,
    pub semester_id: i64,
    pub teacher: Person,
    pub other_teacher: Person,
    /// 3 credits, taught by `teacher`.
    pub programming_id: i64,
    /// 2 credits, taught by `teacher`.
    pub math_id: i64,
    /// 3 credits, taught by `other_teacher`.
    pub physics_id: i64,
    /// Two students in `class_id`, one in `other_class_id`.
    pub students: Vec<Person>,
}

pub async fn create_teacher(addr: SocketAddr, admin: &str, email: &str) -> Person {
    let data = request_ok(
        addr,
        "POST",
        "/api/admin/users",
        Some(admin),
        Some(json!({
            "email": email,
            "password": TEACHER_PASSWORD,
            "full_name": format!("Teacher {email}"),
            "role": "teacher",
            "department": "IT",
        })),
    )
    .await;
    Person {
        user_id: data["user"]["id"].as_i64().expect("user id"),
        profile_id: data["user"]["teacher"]["id"].as_i64().expect("teacher id"),
        email: email.to_string(),
        token: login(addr, email, TEACHER_PASSWORD).await,
    }
}

pub async fn create_student(addr: SocketAddr, admin: &str, email: &str, class_id: i64, major_id: i64) -> Person {
    let data = request_ok(
        addr,
        "POST",
        "/api/admin/users",
        Some(admin),
        Some(json!({
            "email": email,
            "password": STUDENT_PASSWORD,
            "full_name": format!("Student {email}"),
            "role": "student",
            "class_id": class_id,
            "major_id": major_id,
        })),
    )
    .await;
    Person {
        user_id: data["user"]["id"].as_i64().expect("user id"),
        profile_id: data["user"]["student"]["id"].as_i64().expect("student id"),
        email: email.to_string(),
        token: login(addr, email, STUDENT_PASSWORD).await,
    }
}

async fn create_id(addr: SocketAddr, admin: &str, path: &str, key: &str, body: Value) -> i64 {
    let data = request_ok(addr, "POST", path, Some(admin), Some(body)).await;
    data[key]["id"].as_i64().expect("created id")
}

/// A major, two classes, an active semester, two teachers, three subjects
/// and three students, all created through the admin API.
pub async fn setup_campus(addr: SocketAddr) -> Campus {
    let admin = admin_token(addr).await;
    let major_id = create_id(
        addr,
        &admin,
        "/api/majors",
        "major",
        json!({ "code": "IT", "name": "Information Technology" }),
    )
    .await;
    let class_id = create_id(
        addr,
        &admin,
        "/api/classes",
        "class",
        json!({ "code": "IT-K20A", "name": "IT K20 A", "major_id": major_id }),
    )
    .await;
    let other_class_id = create_id(
        addr,
        &admin,
        "/api/classes",
        "class",
        json!({ "code": "IT-K20B", "name": "IT K20 B", "major_id": major_id }),
    )
    .await;
    let semester_id = create_id(
        addr,
        &admin,
        "/api/semesters",
        "semester",
        json!({
            "name": "Semester 1",
            "academic_year": "2024-2025",
            "start_date": "2024-09-01",
            "end_date": "2025-01-15",
            "is_active": true,
        }),
    )
    .await;

    let teacher = create_teacher(addr, &admin, "teacher@sims.test").await;
    let other_teacher = create_teacher(addr, &admin, "other.teacher@sims.test").await;

    let subject = |code: &'static str, credits: i64, teacher_id: i64| {
        json!({ "code": code, "name": format!("Subject {code}"), "credits": credits, "teacher_id": teacher_id, "major_id": major_id })
    };
    let programming_id = create_id(addr, &admin, "/api/subjects", "subject", subject("IT101", 3, teacher.profile_id)).await;
    let math_id = create_id(addr, &admin, "/api/subjects", "subject", subject("MA105", 2, teacher.profile_id)).await;
    let physics_id = create_id(addr, &admin, "/api/subjects", "subject", subject("PH110", 3, other_teacher.profile_id)).await;

    let students = vec![
        create_student(addr, &admin, "student1@sims.test", class_id, major_id).await,
        create_student(addr, &admin, "student2@sims.test", class_id, major_id).await,
        create_student(addr, &admin, "student3@sims.test", other_class_id, major_id).await,
    ];

    Campus {
        admin,
        major_id,
        class_id,
        other_class_id,
        semester_id,
        teacher,
        other_teacher,
        programming_id,
        math_id,
        physics_id,
        students,
    }
}

/// Admin enrollment of `student` into `subject_id` in the campus semester.
pub async fn enroll(addr: SocketAddr, campus: &Campus, student: &Person, class_id: i64, subject_id: i64) -> i64 {
    create_id(
        addr,
        &campus.admin,
        "/api/admin/enrollments",
        "enrollment",
        json!({
            "student_id": student.profile_id,
            "class_id": class_id,
            "subject_id": subject_id,
            "semester_id": campus.semester_id,
        }),
    )
    .await
}
