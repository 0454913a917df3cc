//! Majors and subjects.

use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, Row};
use serde_json::json;

use crate::api::error::{created, ok, ApiError, DbResultExt, Reply};
use crate::api::helpers::{
    ensure_exists, ensure_ref, has_key, one_of, optional_i64, optional_str, path_id,
    required_i64, required_str, Patch,
};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;

fn major_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "code": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "description": r.get::<_, Option<String>>(3)?,
        "class_count": r.get::<_, i64>(4)?,
        "student_count": r.get::<_, i64>(5)?,
        "created_at": r.get::<_, String>(6)?,
        "updated_at": r.get::<_, String>(7)?,
    }))
}

const MAJOR_SELECT: &str = "SELECT
       m.id, m.code, m.name, m.description,
       (SELECT COUNT(*) FROM classes c WHERE c.major_id = m.id),
       (SELECT COUNT(*) FROM students s WHERE s.major_id = m.id),
       m.created_at, m.updated_at
     FROM majors m";

fn load_major(ctx: &Ctx<'_>, id: i64) -> Result<serde_json::Value, ApiError> {
    ctx.conn
        .query_row(&format!("{MAJOR_SELECT} WHERE m.id = ?"), [id], major_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("major not found"))
}

fn handle_majors_list(ctx: &Ctx<'_>, _req: &Request) -> Result<Reply, ApiError> {
    let mut stmt = ctx.conn.prepare(&format!("{MAJOR_SELECT} ORDER BY m.code"))?;
    let majors = stmt
        .query_map([], major_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ok("majors loaded", json!({ "majors": majors })))
}

fn handle_majors_get(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let major = load_major(ctx, path_id(req)?)?;
    Ok(ok("major loaded", json!({ "major": major })))
}

fn handle_majors_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let code = required_str(req, "code")?;
    let name = required_str(req, "name")?;
    let description = optional_str(req, "description")?;
    let now = now_timestamp();
    ctx.conn
        .execute(
            "INSERT INTO majors(code, name, description, created_at, updated_at) VALUES(?, ?, ?, ?, ?)",
            (&code, &name, &description, &now, &now),
        )
        .on_duplicate("major code already exists")?;
    let major = load_major(ctx, ctx.conn.last_insert_rowid())?;
    Ok(created("major created", json!({ "major": major })))
}

fn handle_majors_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "majors", id, "major")?;
    let mut patch = Patch::new();
    if has_key(req, "code") {
        patch.set("code", required_str(req, "code")?);
    }
    if has_key(req, "name") {
        patch.set("name", required_str(req, "name")?);
    }
    if has_key(req, "description") {
        patch.set("description", optional_str(req, "description")?);
    }
    if patch.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }
    patch.set("updated_at", now_timestamp());
    patch
        .execute(ctx.conn, "majors", id)
        .on_duplicate("major code already exists")?;
    let major = load_major(ctx, id)?;
    Ok(ok("major updated", json!({ "major": major })))
}

fn handle_majors_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "majors", id, "major")?;
    ctx.conn
        .execute("DELETE FROM majors WHERE id = ?", [id])
        .on_in_use("major is still used by classes, subjects or students")?;
    Ok(ok("major deleted", json!({ "id": id })))
}

const SUBJECT_SELECT: &str = "SELECT
       s.id, s.code, s.name, s.credits, s.description, s.status,
       s.teacher_id, u.full_name, s.major_id, m.name,
       s.created_at, s.updated_at
     FROM subjects s
     LEFT JOIN teachers t ON t.id = s.teacher_id
     LEFT JOIN users u ON u.id = t.user_id
     LEFT JOIN majors m ON m.id = s.major_id";

pub(crate) fn subject_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "code": r.get::<_, String>(1)?,
        "name": r.get::<_, String>(2)?,
        "credits": r.get::<_, i64>(3)?,
        "description": r.get::<_, Option<String>>(4)?,
        "status": r.get::<_, String>(5)?,
        "teacher_id": r.get::<_, Option<i64>>(6)?,
        "teacher_name": r.get::<_, Option<String>>(7)?,
        "major_id": r.get::<_, Option<i64>>(8)?,
        "major_name": r.get::<_, Option<String>>(9)?,
        "created_at": r.get::<_, String>(10)?,
        "updated_at": r.get::<_, String>(11)?,
    }))
}

pub(crate) fn subjects_where(clause: &str) -> String {
    format!("{SUBJECT_SELECT} WHERE {clause} ORDER BY s.code")
}

fn load_subject(ctx: &Ctx<'_>, id: i64) -> Result<serde_json::Value, ApiError> {
    ctx.conn
        .query_row(&format!("{SUBJECT_SELECT} WHERE s.id = ?"), [id], subject_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("subject not found"))
}

fn handle_subjects_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let mut clauses = vec!["1 = 1"];
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(teacher_id) = optional_i64(req, "teacher_id")? {
        clauses.push("s.teacher_id = ?");
        values.push(teacher_id.into());
    }
    if let Some(major_id) = optional_i64(req, "major_id")? {
        clauses.push("s.major_id = ?");
        values.push(major_id.into());
    }
    if let Some(status) = optional_str(req, "status")? {
        one_of("status", &status, &["active", "inactive"])?;
        clauses.push("s.status = ?");
        values.push(status.into());
    }
    if let Some(q) = optional_str(req, "q")? {
        clauses.push("(s.code LIKE ? OR s.name LIKE ?)");
        let pattern = format!("%{q}%");
        values.push(pattern.clone().into());
        values.push(pattern.into());
    }
    let mut stmt = ctx.conn.prepare(&subjects_where(&clauses.join(" AND ")))?;
    let subjects = stmt
        .query_map(rusqlite::params_from_iter(values), subject_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ok("subjects loaded", json!({ "subjects": subjects })))
}

fn handle_subjects_get(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let subject = load_subject(ctx, path_id(req)?)?;
    Ok(ok("subject loaded", json!({ "subject": subject })))
}

fn positive_credits(credits: i64) -> Result<i64, ApiError> {
    if credits <= 0 {
        return Err(ApiError::bad_params("credits must be a positive integer"));
    }
    Ok(credits)
}

fn handle_subjects_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let code = required_str(req, "code")?;
    let name = required_str(req, "name")?;
    let credits = positive_credits(required_i64(req, "credits")?)?;
    let description = optional_str(req, "description")?;
    let teacher_id = optional_i64(req, "teacher_id")?;
    let major_id = optional_i64(req, "major_id")?;
    let status = optional_str(req, "status")?.unwrap_or_else(|| "active".to_string());
    one_of("status", &status, &["active", "inactive"])?;
    if let Some(t) = teacher_id {
        ensure_ref(ctx.conn, "teachers", t, "teacher_id")?;
    }
    if let Some(m) = major_id {
        ensure_ref(ctx.conn, "majors", m, "major_id")?;
    }

    let now = now_timestamp();
    ctx.conn
        .execute(
            "INSERT INTO subjects(code, name, credits, description, teacher_id, major_id, status, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (&code, &name, credits, &description, teacher_id, major_id, &status, &now, &now),
        )
        .on_duplicate("subject code already exists")?;
    let subject = load_subject(ctx, ctx.conn.last_insert_rowid())?;
    Ok(created("subject created", json!({ "subject": subject })))
}

fn handle_subjects_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "subjects", id, "subject")?;
    let mut patch = Patch::new();
    if has_key(req, "code") {
        patch.set("code", required_str(req, "code")?);
    }
    if has_key(req, "name") {
        patch.set("name", required_str(req, "name")?);
    }
    if has_key(req, "credits") {
        patch.set("credits", positive_credits(required_i64(req, "credits")?)?);
    }
    if has_key(req, "description") {
        patch.set("description", optional_str(req, "description")?);
    }
    if has_key(req, "teacher_id") {
        let teacher_id = optional_i64(req, "teacher_id")?;
        if let Some(t) = teacher_id {
            ensure_ref(ctx.conn, "teachers", t, "teacher_id")?;
        }
        patch.set("teacher_id", teacher_id);
    }
    if has_key(req, "major_id") {
        let major_id = optional_i64(req, "major_id")?;
        if let Some(m) = major_id {
            ensure_ref(ctx.conn, "majors", m, "major_id")?;
        }
        patch.set("major_id", major_id);
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
        .execute(ctx.conn, "subjects", id)
        .on_duplicate("subject code already exists")?;
    let subject = load_subject(ctx, id)?;
    Ok(ok("subject updated", json!({ "subject": subject })))
}

fn handle_subjects_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "subjects", id, "subject")?;
    ctx.conn
        .execute("DELETE FROM subjects WHERE id = ?", [id])
        .on_in_use("subject still has enrollments, schedules, grades or notifications")?;
    Ok(ok("subject deleted", json!({ "id": id })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "majors.list" => Some(handle_majors_list(ctx, req)),
        "majors.get" => Some(handle_majors_get(ctx, req)),
        "majors.create" => Some(handle_majors_create(ctx, req)),
        "majors.update" => Some(handle_majors_update(ctx, req)),
        "majors.delete" => Some(handle_majors_delete(ctx, req)),
        "subjects.list" => Some(handle_subjects_list(ctx, req)),
        "subjects.get" => Some(handle_subjects_get(ctx, req)),
        "subjects.create" => Some(handle_subjects_create(ctx, req)),
        "subjects.update" => Some(handle_subjects_update(ctx, req)),
        "subjects.delete" => Some(handle_subjects_delete(ctx, req)),
        _ => None,
    }
}
