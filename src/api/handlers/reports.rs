use rusqlite::types::Value as SqlValue;
use rusqlite::OptionalExtension;
use serde_json::json;

use super::grades::{ensure_teaches, grade_fields};
use crate::api::error::{ok, ApiError, Reply};
use crate::api::helpers::{
    active_semester_id, caller, one_of, optional_i64, optional_str, required_i64, teacher_id_for,
};
use crate::api::types::{Ctx, Request};
use crate::calc;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn csv_num(v: Option<f64>) -> String {
    v.map(|x| x.to_string()).unwrap_or_default()
}

struct ReportRow {
    student_code: String,
    student_name: String,
    class_code: String,
    process: Option<f64>,
    midterm: Option<f64>,
    final_score: Option<f64>,
    average: Option<f64>,
}

impl ReportRow {
    fn result(&self) -> &'static str {
        match self.average {
            Some(a) if calc::is_passing(a) => "pass",
            Some(_) => "fail",
            None => "incomplete",
        }
    }

    fn csv_line(&self) -> String {
        let point = self.average.map(calc::convert_score);
        [
            csv_quote(&self.student_code),
            csv_quote(&self.student_name),
            csv_quote(&self.class_code),
            csv_num(self.process),
            csv_num(self.midterm),
            csv_num(self.final_score),
            csv_num(self.average),
            csv_num(point.map(|p| p.scale4)),
            point.map(|p| p.letter.to_string()).unwrap_or_default(),
            self.result().to_string(),
        ]
        .join(",")
    }

    fn json(&self) -> serde_json::Value {
        let mut v = grade_fields(self.process, self.midterm, self.final_score, self.average);
        v["student_code"] = json!(self.student_code);
        v["student_name"] = json!(self.student_name);
        v["class_code"] = json!(self.class_code);
        v["result"] = json!(self.result());
        v
    }
}

const CSV_HEADER: &str = "student_code,student_name,class_code,process_score,midterm_score,final_score,average_score,grade_point,letter_grade,result";

fn handle_grade_report(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let subject_id = required_i64(req, "subject_id")?;
    let semester_id = required_i64(req, "semester_id")?;
    let format = optional_str(req, "format")?.unwrap_or_else(|| "json".to_string());
    one_of("format", &format, &["json", "csv"])?;
    ensure_teaches(ctx.conn, teacher_id, subject_id)?;

    let (subject_code, subject_name, credits): (String, String, i64) = ctx.conn.query_row(
        "SELECT code, name, credits FROM subjects WHERE id = ?",
        [subject_id],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    let (semester_name, academic_year): (String, String) = ctx
        .conn
        .query_row(
            "SELECT name, academic_year FROM semesters WHERE id = ?",
            [semester_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found("semester not found"))?;

    let mut sql = "SELECT st.student_code, u.full_name, c.code,
                g.process_score, g.midterm_score, g.final_score, g.average_score
         FROM enrollments e
         JOIN students st ON st.id = e.student_id
         JOIN users u ON u.id = st.user_id
         JOIN classes c ON c.id = e.class_id
         LEFT JOIN grades g ON g.student_id = e.student_id
                           AND g.subject_id = e.subject_id
                           AND g.semester_id = e.semester_id
         WHERE e.subject_id = ? AND e.semester_id = ? AND e.status <> 'dropped'"
        .to_string();
    let mut values: Vec<SqlValue> = vec![subject_id.into(), semester_id.into()];
    if let Some(class_id) = optional_i64(req, "class_id")? {
        sql.push_str(" AND e.class_id = ?");
        values.push(class_id.into());
    }
    sql.push_str(" ORDER BY c.code, st.student_code");

    let mut stmt = ctx.conn.prepare(&sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(values), |r| {
            Ok(ReportRow {
                student_code: r.get(0)?,
                student_name: r.get(1)?,
                class_code: r.get(2)?,
                process: r.get(3)?,
                midterm: r.get(4)?,
                final_score: r.get(5)?,
                average: r.get(6)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    if format == "csv" {
        let mut content = String::with_capacity(CSV_HEADER.len() + rows.len() * 64);
        content.push_str(CSV_HEADER);
        content.push('\n');
        for row in &rows {
            content.push_str(&row.csv_line());
            content.push('\n');
        }
        let filename = format!(
            "grades_{}_{}.csv",
            subject_code.replace(|c: char| !c.is_ascii_alphanumeric() && c != '-', "_"),
            semester_id
        );
        return Ok(Reply::Csv { filename, content });
    }

    let averages: Vec<f64> = rows.iter().filter_map(|r| r.average).collect();
    let stats = calc::score_stats(&averages);
    Ok(ok(
        "grade report generated",
        json!({
            "subject": { "id": subject_id, "code": subject_code, "name": subject_name, "credits": credits },
            "semester": { "id": semester_id, "name": semester_name, "academic_year": academic_year },
            "enrolled_count": rows.len(),
            "summary": stats,
            "rows": rows.iter().map(ReportRow::json).collect::<Vec<_>>(),
        }),
    ))
}

fn handle_admin_stats(ctx: &Ctx<'_>, _req: &Request) -> Result<Reply, ApiError> {
    let conn = ctx.conn;
    let count = |sql: &str| -> Result<i64, ApiError> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let users_by_role = |role: &str| -> Result<i64, ApiError> {
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM users WHERE role = ? AND is_deleted = 0",
            [role],
            |r| r.get(0),
        )?)
    };

    let active_semester = match active_semester_id(conn)? {
        Some(id) => conn
            .query_row(
                "SELECT id, name, academic_year FROM semesters WHERE id = ?",
                [id],
                |r| {
                    Ok(json!({
                        "id": r.get::<_, i64>(0)?,
                        "name": r.get::<_, String>(1)?,
                        "academic_year": r.get::<_, String>(2)?,
                    }))
                },
            )
            .optional()?,
        None => None,
    };

    let average_score: Option<f64> = conn.query_row(
        "SELECT ROUND(AVG(average_score), 2) FROM grades WHERE average_score IS NOT NULL",
        [],
        |r| r.get(0),
    )?;

    Ok(ok(
        "statistics loaded",
        json!({
            "users": {
                "admins": users_by_role("admin")?,
                "teachers": users_by_role("teacher")?,
                "students": users_by_role("student")?,
                "deleted": count("SELECT COUNT(*) FROM users WHERE is_deleted = 1")?,
            },
            "majors": count("SELECT COUNT(*) FROM majors")?,
            "classes": count("SELECT COUNT(*) FROM classes")?,
            "subjects": count("SELECT COUNT(*) FROM subjects")?,
            "semesters": count("SELECT COUNT(*) FROM semesters")?,
            "active_semester": active_semester,
            "enrollments": {
                "registered": count("SELECT COUNT(*) FROM enrollments WHERE status = 'registered'")?,
                "completed": count("SELECT COUNT(*) FROM enrollments WHERE status = 'completed'")?,
                "dropped": count("SELECT COUNT(*) FROM enrollments WHERE status = 'dropped'")?,
            },
            "grades": {
                "recorded": count("SELECT COUNT(*) FROM grades")?,
                "average_score": average_score,
            },
            "pending_grade_reviews": count("SELECT COUNT(*) FROM grade_reviews WHERE status = 'pending'")?,
        }),
    ))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "reports.grades" => Some(handle_grade_report(ctx, req)),
        "admin.stats" => Some(handle_admin_stats(ctx, req)),
        _ => None,
    }
}
