use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, Row};
use serde_json::json;

use crate::api::error::{created, ok, ApiError, DbResultExt, Reply};
use crate::api::helpers::{
    ensure_exists, ensure_ref, has_key, one_of, optional_i64, optional_str, path_id,
    query_json, required_str, Patch,
};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;

// Correlated subquery so joins elsewhere cannot double-count students.
const CLASS_SELECT: &str = "SELECT
       c.id, c.code, c.name, c.academic_year, c.max_students, c.status,
       c.major_id, m.name,
       c.homeroom_teacher_id, u.full_name,
       (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id) AS student_count,
       c.created_at, c.updated_at
     FROM classes c
     LEFT JOIN majors m ON m.id = c.major_id
     LEFT JOIN teachers t ON t.id = c.homeroom_teacher_id
     LEFT JOIN users u ON u.id = t.user_id";

fn class_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "code": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "academic_year": r.get::<_, Option<String>>(3)?,
        "max_students": r.get::<_, i64>(4)?,
        "status": r.get::<_, String>(5)?,
        "major_id": r.get::<_, Option<i64>>(6)?,
        "major_name": r.get::<_, Option<String>>(7)?,
        "homeroom_teacher_id": r.get::<_, Option<i64>>(8)?,
        "homeroom_teacher_name": r.get::<_, Option<String>>(9)?,
        "student_count": r.get::<_, i64>(10)?,
        "created_at": r.get::<_, String>(11)?,
        "updated_at": r.get::<_, String>(12)?,
    }))
}

fn load_class(ctx: &Ctx<'_>, id: i64) -> Result<serde_json::Value, ApiError> {
    ctx.conn
        .query_row(&format!("{CLASS_SELECT} WHERE c.id = ?"), [id], class_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("class not found"))
}

fn handle_classes_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let mut clauses = vec!["1 = 1"];
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(major_id) = optional_i64(req, "major_id")? {
        clauses.push("c.major_id = ?");
        values.push(major_id.into());
    }
    if let Some(status) = optional_str(req, "status")? {
        one_of("status", &status, &["active", "inactive"])?;
        clauses.push("c.status = ?");
        values.push(status.into());
    }
    if let Some(year) = optional_str(req, "academic_year")? {
        clauses.push("c.academic_year = ?");
        values.push(year.into());
    }
    if let Some(q) = optional_str(req, "q")? {
        clauses.push("(c.code LIKE ? OR c.name LIKE ?)");
        let pattern = format!("%{q}%");
        values.push(pattern.clone().into());
        values.push(pattern.into());
    }
    let sql = format!("{CLASS_SELECT} WHERE {} ORDER BY c.code", clauses.join(" AND "));
    let classes = query_json(ctx.conn, &sql, rusqlite::params_from_iter(values), class_row)?;
    Ok(ok("classes loaded", json!({ "classes": classes })))
}

fn handle_classes_get(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let class = load_class(ctx, path_id(req)?)?;
    Ok(ok("class loaded", json!({ "class": class })))
}

fn handle_classes_students(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "classes", id, "class")?;
    let students = query_json(
        ctx.conn,
        "SELECT s.id, s.student_code, u.id, u.full_name, u.email, u.phone, u.status,
                s.gender, s.date_of_birth, s.enrollment_year
         FROM students s
         JOIN users u ON u.id = s.user_id
         WHERE s.class_id = ? AND u.is_deleted = 0
         ORDER BY s.student_code",
        [id],
        |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "student_code": r.get::<_, String>(1)?,
                "user_id": r.get::<_, i64>(2)?,
                "full_name": r.get::<_, String>(3)?,
                "email": r.get::<_, String>(4)?,
                "phone": r.get::<_, Option<String>>(5)?,
                "status": r.get::<_, String>(6)?,
                "gender": r.get::<_, Option<String>>(7)?,
                "date_of_birth": r.get::<_, Option<String>>(8)?,
                "enrollment_year": r.get::<_, Option<i64>>(9)?,
            }))
        },
    )?;
    Ok(ok(
        "class students loaded",
        json!({ "class_id": id, "students": students }),
    ))
}

fn max_students(req: &Request) -> Result<Option<i64>, ApiError> {
    match optional_i64(req, "max_students")? {
        Some(n) if n <= 0 => Err(ApiError::bad_params("max_students must be positive")),
        other => Ok(other),
    }
}

fn handle_classes_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let code = required_str(req, "code")?;
    let name = required_str(req, "name")?;
    let major_id = optional_i64(req, "major_id")?;
    let academic_year = optional_str(req, "academic_year")?;
    let homeroom = optional_i64(req, "homeroom_teacher_id")?;
    let capacity = max_students(req)?.unwrap_or(50);
    let status = optional_str(req, "status")?.unwrap_or_else(|| "active".to_string());
    one_of("status", &status, &["active", "inactive"])?;
    if let Some(m) = major_id {
        ensure_ref(ctx.conn, "majors", m, "major_id")?;
    }
    if let Some(t) = homeroom {
        ensure_ref(ctx.conn, "teachers", t, "homeroom_teacher_id")?;
    }

    let now = now_timestamp();
    ctx.conn
        .execute(
            "INSERT INTO classes(code, name, major_id, academic_year, homeroom_teacher_id, max_students, status, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (&code, &name, major_id, &academic_year, homeroom, capacity, &status, &now, &now),
        )
        .on_duplicate("class code already exists")?;
    let class = load_class(ctx, ctx.conn.last_insert_rowid())?;
    Ok(created("class created", json!({ "class": class })))
}

fn handle_classes_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "classes", id, "class")?;
    let mut patch = Patch::new();
    if has_key(req, "code") {
        patch.set("code", required_str(req, "code")?);
    }
    if has_key(req, "name") {
        patch.set("name", required_str(req, "name")?);
    }
    if has_key(req, "academic_year") {
        patch.set("academic_year", optional_str(req, "academic_year")?);
    }
    if has_key(req, "major_id") {
        let major_id = optional_i64(req, "major_id")?;
        if let Some(m) = major_id {
            ensure_ref(ctx.conn, "majors", m, "major_id")?;
        }
        patch.set("major_id", major_id);
    }
    if has_key(req, "homeroom_teacher_id") {
        let homeroom = optional_i64(req, "homeroom_teacher_id")?;
        if let Some(t) = homeroom {
            ensure_ref(ctx.conn, "teachers", t, "homeroom_teacher_id")?;
        }
        patch.set("homeroom_teacher_id", homeroom);
    }
    if has_key(req, "max_students") {
        let capacity = max_students(req)?
            .ok_or_else(|| ApiError::bad_params("max_students must be positive"))?;
        patch.set("max_students", capacity);
    }
    if has_key(req, "status") {
        let status = required_str(req, "status")?;
        one_of("status", &status, &["active", "inactive"])?;
        patch.set("status", status);
    }
    if patch.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }
    patch.set("updated_at", now_timestamp());
    patch
        .execute(ctx.conn, "classes", id)
        .on_duplicate("class code already exists")?;
    let class = load_class(ctx, id)?;
    Ok(ok("class updated", json!({ "class": class })))
}

fn handle_classes_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "classes", id, "class")?;

    // No ON DELETE CASCADE: a class with members must be emptied first.
    let members: i64 = ctx.conn.query_row(
        "SELECT COUNT(*) FROM students WHERE class_id = ?",
        [id],
        |r| r.get(0),
    )?;
    if members > 0 {
        return Err(ApiError::conflict("class still has students")
            .with_details(json!({ "student_count": members })));
    }
    ctx.conn
        .execute("DELETE FROM classes WHERE id = ?", [id])
        .on_in_use("class still has enrollments, schedules or notifications")?;
    Ok(ok("class deleted", json!({ "id": id })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "classes.list" => Some(handle_classes_list(ctx, req)),
        "classes.get" => Some(handle_classes_get(ctx, req)),
        "classes.students" => Some(handle_classes_students(ctx, req)),
        "classes.create" => Some(handle_classes_create(ctx, req)),
        "classes.update" => Some(handle_classes_update(ctx, req)),
        "classes.delete" => Some(handle_classes_delete(ctx, req)),
        _ => None,
    }
}
