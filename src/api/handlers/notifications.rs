use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

use super::grades::ensure_teaches;
use crate::api::error::{created, ok, ApiError, Reply};
use crate::api::helpers::{
    caller, ensure_ref, has_key, optional_i64, path_id, query_json, required_str, student_for,
    teacher_id_for, Patch,
};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;

const NOTIFICATION_SELECT: &str = "SELECT
       n.id, n.title, n.content, n.created_at, n.updated_at,
       n.teacher_id, u.full_name,
       n.class_id, c.name,
       n.subject_id, sb.name
     FROM notifications n
     JOIN teachers t ON t.id = n.teacher_id
     JOIN users u ON u.id = t.user_id
     LEFT JOIN classes c ON c.id = n.class_id
     LEFT JOIN subjects sb ON sb.id = n.subject_id";

fn notification_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "title": r.get::<_, String>(1)?,
        "content": r.get::<_, String>(2)?,
        "created_at": r.get::<_, String>(3)?,
        "updated_at": r.get::<_, String>(4)?,
        "teacher_id": r.get::<_, i64>(5)?,
        "teacher_name": r.get::<_, String>(6)?,
        "class_id": r.get::<_, Option<i64>>(7)?,
        "class_name": r.get::<_, Option<String>>(8)?,
        "subject_id": r.get::<_, Option<i64>>(9)?,
        "subject_name": r.get::<_, Option<String>>(10)?,
    }))
}

fn load_notification(conn: &Connection, id: i64) -> Result<serde_json::Value, ApiError> {
    conn.query_row(&format!("{NOTIFICATION_SELECT} WHERE n.id = ?"), [id], notification_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("notification not found"))
}

/// Someone else's notification reads as missing.
fn ensure_own(conn: &Connection, id: i64, teacher_id: i64) -> Result<(), ApiError> {
    let owner: Option<i64> = conn
        .query_row("SELECT teacher_id FROM notifications WHERE id = ?", [id], |r| r.get(0))
        .optional()?;
    match owner {
        Some(t) if t == teacher_id => Ok(()),
        _ => Err(ApiError::not_found("notification not found")),
    }
}

fn check_scope(conn: &Connection, teacher_id: i64, class_id: Option<i64>, subject_id: Option<i64>) -> Result<(), ApiError> {
    if let Some(c) = class_id {
        ensure_ref(conn, "classes", c, "class_id")?;
    }
    if let Some(s) = subject_id {
        ensure_teaches(conn, teacher_id, s)?;
    }
    Ok(())
}

fn handle_teacher_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let notifications = query_json(
        ctx.conn,
        &format!("{NOTIFICATION_SELECT} WHERE n.teacher_id = ? ORDER BY n.created_at DESC, n.id DESC"),
        [teacher_id],
        notification_row,
    )?;
    Ok(ok("notifications loaded", json!({ "notifications": notifications })))
}

fn handle_teacher_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let title = required_str(req, "title")?;
    let content = required_str(req, "content")?;
    let class_id = optional_i64(req, "class_id")?;
    let subject_id = optional_i64(req, "subject_id")?;
    check_scope(ctx.conn, teacher_id, class_id, subject_id)?;

    let now = now_timestamp();
    ctx.conn.execute(
        "INSERT INTO notifications(teacher_id, title, content, class_id, subject_id, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (teacher_id, &title, &content, class_id, subject_id, &now, &now),
    )?;
    let notification = load_notification(ctx.conn, ctx.conn.last_insert_rowid())?;
    Ok(created(
        "notification created",
        json!({ "notification": notification }),
    ))
}

fn handle_teacher_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let id = path_id(req)?;
    ensure_own(ctx.conn, id, teacher_id)?;

    let mut patch = Patch::new();
    if has_key(req, "title") {
        patch.set("title", required_str(req, "title")?);
    }
    if has_key(req, "content") {
        patch.set("content", required_str(req, "content")?);
    }
    if has_key(req, "class_id") {
        let class_id = optional_i64(req, "class_id")?;
        check_scope(ctx.conn, teacher_id, class_id, None)?;
        patch.set("class_id", class_id);
    }
    if has_key(req, "subject_id") {
        let subject_id = optional_i64(req, "subject_id")?;
        check_scope(ctx.conn, teacher_id, None, subject_id)?;
        patch.set("subject_id", subject_id);
    }
    if patch.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }
    patch.set("updated_at", now_timestamp());
    patch.execute(ctx.conn, "notifications", id)?;
    let notification = load_notification(ctx.conn, id)?;
    Ok(ok("notification updated", json!({ "notification": notification })))
}

fn handle_teacher_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let id = path_id(req)?;
    ensure_own(ctx.conn, id, teacher_id)?;
    ctx.conn.execute("DELETE FROM notifications WHERE id = ?", [id])?;
    Ok(ok("notification deleted", json!({ "id": id })))
}

fn handle_student_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    // Global notices, notices for the student's class, and notices for
    // subjects the student takes. A notice scoped to both must match both.
    let notifications = query_json(
        ctx.conn,
        &format!(
            "{NOTIFICATION_SELECT}
             WHERE (n.class_id IS NULL OR n.class_id = ?)
               AND (n.subject_id IS NULL OR n.subject_id IN (
                     SELECT e.subject_id FROM enrollments e
                     WHERE e.student_id = ? AND e.status <> 'dropped'))
             ORDER BY n.created_at DESC, n.id DESC"
        ),
        (student.class_id.unwrap_or(-1), student.id),
        notification_row,
    )?;
    Ok(ok("notifications loaded", json!({ "notifications": notifications })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "teacher.notifications.list" => Some(handle_teacher_list(ctx, req)),
        "teacher.notifications.create" => Some(handle_teacher_create(ctx, req)),
        "teacher.notifications.update" => Some(handle_teacher_update(ctx, req)),
        "teacher.notifications.delete" => Some(handle_teacher_delete(ctx, req)),
        "student.notifications" => Some(handle_student_list(ctx, req)),
        _ => None,
    }
}
