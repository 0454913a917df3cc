mod test_support;

use serde_json::json;
use test_support::{enroll, request, request_ok, setup_campus, spawn_server, Campus};

async fn grade_class(addr: std::net::SocketAddr, campus: &Campus) {
    for student in &campus.students[..2] {
        enroll(addr, campus, student, campus.class_id, campus.programming_id).await;
    }
    request_ok(
        addr,
        "POST",
        "/api/teacher/grades/bulk",
        Some(&campus.teacher.token),
        Some(json!({
            "subject_id": campus.programming_id,
            "semester_id": campus.semester_id,
            "grades": [
                { "student_id": campus.students[0].profile_id,
                  "process_score": 8, "midterm_score": 7, "final_score": 6 },
                { "student_id": campus.students[1].profile_id,
                  "process_score": 3, "midterm_score": 2, "final_score": 2 },
            ],
        })),
    )
    .await;
}

#[tokio::test]
async fn json_report_carries_summary_statistics() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    grade_class(server.addr, &campus).await;

    let report = request_ok(
        server.addr,
        "GET",
        &format!(
            "/api/teacher/reports/grades?subject_id={}&semester_id={}",
            campus.programming_id, campus.semester_id
        ),
        Some(&campus.teacher.token),
        None,
    )
    .await;
    assert_eq!(report["subject"]["code"], "IT101");
    assert_eq!(report["enrolled_count"], 2);
    assert_eq!(report["summary"]["graded_count"], 2);
    assert_eq!(report["summary"]["pass_count"], 1);
    assert_eq!(report["rows"][0]["result"], "pass");
    assert_eq!(report["rows"][1]["result"], "fail");
    assert_eq!(report["rows"][1]["letter_grade"], "F");
}

#[tokio::test]
async fn csv_report_is_an_attachment() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    grade_class(server.addr, &campus).await;

    let resp = request(
        server.addr,
        "GET",
        &format!(
            "/api/teacher/reports/grades?subject_id={}&semester_id={}&format=csv",
            campus.programming_id, campus.semester_id
        ),
        Some(&campus.teacher.token),
        None,
    )
    .await;
    assert_eq!(resp.status, 200);
    assert!(resp.header("content-type").unwrap().starts_with("text/csv"));
    let disposition = resp.header("content-disposition").unwrap();
    assert!(
        disposition.contains(&format!("grades_IT101_{}.csv", campus.semester_id)),
        "{disposition}"
    );

    let lines: Vec<&str> = resp.text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("student_code,student_name,class_code"));
    assert!(lines[1].ends_with(",7.1,3,B,pass"), "{}", lines[1]);
    assert!(lines[1].contains(",IT-K20A,8,7,6,"), "{}", lines[1]);
}

#[tokio::test]
async fn report_is_limited_to_the_subject_teacher() {
    let server = spawn_server().await;
    let campus = setup_campus(server.addr).await;
    let resp = request(
        server.addr,
        "GET",
        &format!(
            "/api/teacher/reports/grades?subject_id={}&semester_id={}",
            campus.programming_id, campus.semester_id
        ),
        Some(&campus.other_teacher.token),
        None,
    )
    .await;
    assert_eq!(resp.status, 403);

    let resp = request(
        server.addr,
        "GET",
        &format!(
            "/api/teacher/reports/grades?subject_id={}&semester_id={}&format=pdf",
            campus.programming_id, campus.semester_id
        ),
        Some(&campus.teacher.token),
        None,
    )
    .await;
    assert_eq!(resp.status, 400);
}
