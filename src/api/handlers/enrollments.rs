use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

use crate::api::error::{created, ok, ApiError, DbResultExt, Reply};
use crate::api::helpers::{
    active_semester_id, caller, ensure_exists, ensure_ref, has_key, one_of, optional_i64,
    optional_str, pagination, path_id, query_json, required_i64, required_str, student_for, Patch,
};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;

const STATUSES: &[&str] = &["registered", "completed", "dropped"];
const DUPLICATE: &str = "student is already enrolled in this subject for this semester";

const ENROLLMENT_SELECT: &str = "SELECT
       e.id, e.status, e.enrolled_at, e.updated_at,
       e.student_id, st.student_code, u.full_name,
       e.class_id, c.code, c.name,
       e.subject_id, sb.code, sb.name, sb.credits,
       e.semester_id, se.name, se.academic_year
     FROM enrollments e
     JOIN students st ON st.id = e.student_id
     JOIN users u ON u.id = st.user_id
     JOIN classes c ON c.id = e.class_id
     JOIN subjects sb ON sb.id = e.subject_id
     JOIN semesters se ON se.id = e.semester_id";

fn enrollment_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "status": r.get::<_, String>(1)?,
        "enrolled_at": r.get::<_, String>(2)?,
        "updated_at": r.get::<_, String>(3)?,
        "student_id": r.get::<_, i64>(4)?,
        "student_code": r.get::<_, String>(5)?,
        "student_name": r.get::<_, String>(6)?,
        "class_id": r.get::<_, i64>(7)?,
        "class_code": r.get::<_, String>(8)?,
        "class_name": r.get::<_, String>(9)?,
        "subject_id": r.get::<_, i64>(10)?,
        "subject_code": r.get::<_, String>(11)?,
        "subject_name": r.get::<_, String>(12)?,
        "credits": r.get::<_, i64>(13)?,
        "semester_id": r.get::<_, i64>(14)?,
        "semester_name": r.get::<_, String>(15)?,
        "academic_year": r.get::<_, String>(16)?,
    }))
}

fn load_enrollment(conn: &Connection, id: i64) -> Result<serde_json::Value, ApiError> {
    conn.query_row(&format!("{ENROLLMENT_SELECT} WHERE e.id = ?"), [id], enrollment_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("enrollment not found"))
}

fn handle_enrollments_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let page = pagination(req)?;
    let mut clauses = vec!["1 = 1"];
    let mut values: Vec<SqlValue> = Vec::new();
    for (key, column) in [
        ("student_id", "e.student_id = ?"),
        ("class_id", "e.class_id = ?"),
        ("subject_id", "e.subject_id = ?"),
        ("semester_id", "e.semester_id = ?"),
    ] {
        if let Some(v) = optional_i64(req, key)? {
            clauses.push(column);
            values.push(v.into());
        }
    }
    if let Some(status) = optional_str(req, "status")? {
        one_of("status", &status, STATUSES)?;
        clauses.push("e.status = ?");
        values.push(status.into());
    }
    let where_sql = clauses.join(" AND ");

    let total: i64 = ctx.conn.query_row(
        &format!("SELECT COUNT(*) FROM enrollments e WHERE {where_sql}"),
        rusqlite::params_from_iter(values.iter()),
        |r| r.get(0),
    )?;
    values.push(page.limit.into());
    values.push(page.offset().into());
    let enrollments = query_json(
        ctx.conn,
        &format!("{ENROLLMENT_SELECT} WHERE {where_sql} ORDER BY e.id LIMIT ? OFFSET ?"),
        rusqlite::params_from_iter(values),
        enrollment_row,
    )?;
    Ok(ok(
        "enrollments loaded",
        json!({ "enrollments": enrollments, "pagination": page.meta(total) }),
    ))
}

fn handle_enrollments_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student_id = required_i64(req, "student_id")?;
    let class_id = required_i64(req, "class_id")?;
    let subject_id = required_i64(req, "subject_id")?;
    let semester_id = required_i64(req, "semester_id")?;
    let status = optional_str(req, "status")?.unwrap_or_else(|| "registered".to_string());
    one_of("status", &status, STATUSES)?;
    ensure_ref(ctx.conn, "students", student_id, "student_id")?;
    ensure_ref(ctx.conn, "classes", class_id, "class_id")?;
    ensure_ref(ctx.conn, "subjects", subject_id, "subject_id")?;
    ensure_ref(ctx.conn, "semesters", semester_id, "semester_id")?;

    let now = now_timestamp();
    ctx.conn
        .execute(
            "INSERT INTO enrollments(student_id, class_id, subject_id, semester_id, status, enrolled_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (student_id, class_id, subject_id, semester_id, &status, &now, &now),
        )
        .on_duplicate(DUPLICATE)?;
    let enrollment = load_enrollment(ctx.conn, ctx.conn.last_insert_rowid())?;
    Ok(created("enrollment created", json!({ "enrollment": enrollment })))
}

fn handle_enrollments_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "enrollments", id, "enrollment")?;
    let mut patch = Patch::new();
    if has_key(req, "status") {
        let status = required_str(req, "status")?;
        one_of("status", &status, STATUSES)?;
        patch.set("status", status);
    }
    if has_key(req, "class_id") {
        let class_id = required_i64(req, "class_id")?;
        ensure_ref(ctx.conn, "classes", class_id, "class_id")?;
        patch.set("class_id", class_id);
    }
    if patch.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }
    patch.set("updated_at", now_timestamp());
    patch.execute(ctx.conn, "enrollments", id)?;
    let enrollment = load_enrollment(ctx.conn, id)?;
    Ok(ok("enrollment updated", json!({ "enrollment": enrollment })))
}

fn handle_enrollments_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    let changed = ctx.conn.execute("DELETE FROM enrollments WHERE id = ?", [id])?;
    if changed == 0 {
        return Err(ApiError::not_found("enrollment not found"));
    }
    Ok(ok("enrollment deleted", json!({ "id": id })))
}

fn handle_student_enrollments_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let mut sql = format!("{ENROLLMENT_SELECT} WHERE e.student_id = ?");
    let mut values: Vec<SqlValue> = vec![student.id.into()];
    if let Some(semester_id) = optional_i64(req, "semester_id")? {
        sql.push_str(" AND e.semester_id = ?");
        values.push(semester_id.into());
    }
    sql.push_str(" ORDER BY se.start_date DESC, sb.code");
    let enrollments = query_json(
        ctx.conn,
        &sql,
        rusqlite::params_from_iter(values),
        enrollment_row,
    )?;
    Ok(ok("enrollments loaded", json!({ "enrollments": enrollments })))
}

fn handle_student_enrollments_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let subject_id = required_i64(req, "subject_id")?;
    let active = active_semester_id(ctx.conn)?
        .ok_or_else(|| ApiError::bad_params("there is no active semester open for enrollment"))?;
    if let Some(requested) = optional_i64(req, "semester_id")? {
        if requested != active {
            return Err(ApiError::bad_params(
                "enrollment is only open for the active semester",
            ));
        }
    }
    let class_id = student
        .class_id
        .ok_or_else(|| ApiError::bad_params("you are not assigned to a class"))?;

    let subject_status: Option<String> = ctx
        .conn
        .query_row("SELECT status FROM subjects WHERE id = ?", [subject_id], |r| r.get(0))
        .optional()?;
    match subject_status.as_deref() {
        None => return Err(ApiError::not_found("subject not found")),
        Some("active") => {}
        Some(_) => return Err(ApiError::bad_params("subject is not open for enrollment")),
    }

    let existing: Option<(i64, String)> = ctx
        .conn
        .query_row(
            "SELECT id, status FROM enrollments WHERE student_id = ? AND subject_id = ? AND semester_id = ?",
            (student.id, subject_id, active),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?;

    let now = now_timestamp();
    let id = match existing {
        Some((id, status)) if status == "dropped" => {
            ctx.conn.execute(
                "UPDATE enrollments SET status = 'registered', class_id = ?, updated_at = ? WHERE id = ?",
                (class_id, &now, id),
            )?;
            id
        }
        Some(_) => return Err(ApiError::conflict(DUPLICATE)),
        None => {
            ctx.conn
                .execute(
                    "INSERT INTO enrollments(student_id, class_id, subject_id, semester_id, status, enrolled_at, updated_at)
                     VALUES(?, ?, ?, ?, 'registered', ?, ?)",
                    (student.id, class_id, subject_id, active, &now, &now),
                )
                .on_duplicate(DUPLICATE)?;
            ctx.conn.last_insert_rowid()
        }
    };
    let enrollment = load_enrollment(ctx.conn, id)?;
    Ok(created("enrolled", json!({ "enrollment": enrollment })))
}

fn handle_student_enrollments_drop(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let id = path_id(req)?;
    let status: Option<String> = ctx
        .conn
        .query_row(
            "SELECT status FROM enrollments WHERE id = ? AND student_id = ?",
            (id, student.id),
            |r| r.get(0),
        )
        .optional()?;
    match status.as_deref() {
        None => return Err(ApiError::not_found("enrollment not found")),
        Some("registered") => {}
        Some(_) => {
            return Err(ApiError::bad_params(
                "only registered enrollments can be dropped",
            ))
        }
    }
    ctx.conn.execute(
        "UPDATE enrollments SET status = 'dropped', updated_at = ? WHERE id = ?",
        (now_timestamp(), id),
    )?;
    let enrollment = load_enrollment(ctx.conn, id)?;
    Ok(ok("enrollment dropped", json!({ "enrollment": enrollment })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "enrollments.list" => Some(handle_enrollments_list(ctx, req)),
        "enrollments.create" => Some(handle_enrollments_create(ctx, req)),
        "enrollments.update" => Some(handle_enrollments_update(ctx, req)),
        "enrollments.delete" => Some(handle_enrollments_delete(ctx, req)),
        "student.enrollments.list" => Some(handle_student_enrollments_list(ctx, req)),
        "student.enrollments.create" => Some(handle_student_enrollments_create(ctx, req)),
        "student.enrollments.drop" => Some(handle_student_enrollments_drop(ctx, req)),
        _ => None,
    }
}
