use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

use crate::api::error::{created, ok, ApiError, DbResultExt, Reply};
use crate::api::helpers::{
    caller, one_of, optional_str, path_id, query_json, required_i64, required_str, student_for,
    teacher_id_for,
};
use crate::api::types::{Ctx, Request};
use crate::db::{now_timestamp, write_transaction};

const REVIEW_SELECT: &str = "SELECT
       r.id, r.status, r.reason, r.response, r.created_at, r.reviewed_at,
       r.grade_id, g.average_score,
       r.student_id, st.student_code, u.full_name,
       g.subject_id, sb.code, sb.name,
       g.semester_id, se.name
     FROM grade_reviews r
     JOIN grades g ON g.id = r.grade_id
     JOIN students st ON st.id = r.student_id
     JOIN users u ON u.id = st.user_id
     JOIN subjects sb ON sb.id = g.subject_id
     JOIN semesters se ON se.id = g.semester_id";

fn review_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "status": r.get::<_, String>(1)?,
        "reason": r.get::<_, String>(2)?,
        "response": r.get::<_, Option<String>>(3)?,
        "created_at": r.get::<_, String>(4)?,
        "reviewed_at": r.get::<_, Option<String>>(5)?,
        "grade_id": r.get::<_, i64>(6)?,
        "average_score": r.get::<_, Option<f64>>(7)?,
        "student_id": r.get::<_, i64>(8)?,
        "student_code": r.get::<_, String>(9)?,
        "student_name": r.get::<_, String>(10)?,
        "subject_id": r.get::<_, i64>(11)?,
        "subject_code": r.get::<_, String>(12)?,
        "subject_name": r.get::<_, String>(13)?,
        "semester_id": r.get::<_, i64>(14)?,
        "semester_name": r.get::<_, String>(15)?,
    }))
}

fn load_review(conn: &Connection, id: i64) -> Result<serde_json::Value, ApiError> {
    conn.query_row(&format!("{REVIEW_SELECT} WHERE r.id = ?"), [id], review_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("grade review not found"))
}

fn handle_student_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let reviews = query_json(
        ctx.conn,
        &format!("{REVIEW_SELECT} WHERE r.student_id = ? ORDER BY r.created_at DESC, r.id DESC"),
        [student.id],
        review_row,
    )?;
    Ok(ok("grade reviews loaded", json!({ "reviews": reviews })))
}

fn handle_student_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let grade_id = required_i64(req, "grade_id")?;
    let reason = required_str(req, "reason")?;

    let owner: Option<i64> = ctx
        .conn
        .query_row("SELECT student_id FROM grades WHERE id = ?", [grade_id], |r| r.get(0))
        .optional()?;
    if owner != Some(student.id) {
        return Err(ApiError::not_found("grade not found"));
    }

    let tx = write_transaction(ctx.conn)?;
    let pending: Option<i64> = tx
        .query_row(
            "SELECT id FROM grade_reviews WHERE grade_id = ? AND status = 'pending'",
            [grade_id],
            |r| r.get(0),
        )
        .optional()?;
    if let Some(existing) = pending {
        return Err(ApiError::conflict("a review request for this grade is already pending")
            .with_details(json!({ "review_id": existing })));
    }
    tx.execute(
        "INSERT INTO grade_reviews(grade_id, student_id, reason, status, created_at)
         VALUES(?, ?, ?, 'pending', ?)",
        (grade_id, student.id, &reason, now_timestamp()),
    )
    .on_duplicate("a review request for this grade is already pending")?;
    let id = tx.last_insert_rowid();
    tx.commit()?;

    let review = load_review(ctx.conn, id)?;
    Ok(created("grade review requested", json!({ "review": review })))
}

fn handle_teacher_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let mut sql = format!("{REVIEW_SELECT} WHERE sb.teacher_id = ?");
    let mut values: Vec<SqlValue> = vec![teacher_id.into()];
    if let Some(status) = optional_str(req, "status")? {
        one_of("status", &status, &["pending", "reviewed"])?;
        sql.push_str(" AND r.status = ?");
        values.push(status.into());
    }
    sql.push_str(" ORDER BY r.status = 'reviewed', r.created_at, r.id");
    let reviews = query_json(ctx.conn, &sql, rusqlite::params_from_iter(values), review_row)?;
    Ok(ok("grade reviews loaded", json!({ "reviews": reviews })))
}

fn handle_teacher_respond(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let id = path_id(req)?;
    let response = required_str(req, "response")?;

    let found: Option<(String, Option<i64>)> = ctx
        .conn
        .query_row(
            "SELECT r.status, sb.teacher_id
             FROM grade_reviews r
             JOIN grades g ON g.id = r.grade_id
             JOIN subjects sb ON sb.id = g.subject_id
             WHERE r.id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;
    let status = match found {
        Some((status, Some(owner))) if owner == teacher_id => status,
        _ => return Err(ApiError::not_found("grade review not found")),
    };
    if status != "pending" {
        return Err(ApiError::conflict("grade review has already been answered"));
    }

    let changed = ctx.conn.execute(
        "UPDATE grade_reviews SET status = 'reviewed', response = ?, reviewed_at = ?
         WHERE id = ? AND status = 'pending'",
        (&response, now_timestamp(), id),
    )?;
    if changed == 0 {
        return Err(ApiError::conflict("grade review has already been answered"));
    }
    let review = load_review(ctx.conn, id)?;
    Ok(ok("grade review answered", json!({ "review": review })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "student.reviews.list" => Some(handle_student_list(ctx, req)),
        "student.reviews.create" => Some(handle_student_create(ctx, req)),
        "teacher.reviews.list" => Some(handle_teacher_list(ctx, req)),
        "teacher.reviews.respond" => Some(handle_teacher_respond(ctx, req)),
        _ => None,
    }
}
