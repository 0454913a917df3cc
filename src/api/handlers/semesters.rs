use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

use crate::api::error::{created, ok, ApiError, DbResultExt, Reply};
use crate::api::helpers::{
    ensure_exists, has_key, optional_bool, path_id, query_json, required_date, required_str,
    Patch,
};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;

const SEMESTER_SELECT: &str = "SELECT id, name, academic_year, start_date, end_date, is_active, created_at, updated_at
     FROM semesters";

fn semester_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "name": r.get::<_, String>(1)?,
        "academic_year": r.get::<_, String>(2)?,
        "start_date": r.get::<_, String>(3)?,
        "end_date": r.get::<_, String>(4)?,
        "is_active": r.get::<_, i64>(5)? != 0,
        "created_at": r.get::<_, String>(6)?,
        "updated_at": r.get::<_, String>(7)?,
    }))
}

fn load_semester(conn: &Connection, id: i64) -> Result<serde_json::Value, ApiError> {
    conn.query_row(&format!("{SEMESTER_SELECT} WHERE id = ?"), [id], semester_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("semester not found"))
}

// Dates are stored as YYYY-MM-DD, so string order is date order.
fn check_range(start: &str, end: &str) -> Result<(), ApiError> {
    if start >= end {
        return Err(ApiError::bad_params("start_date must be before end_date"));
    }
    Ok(())
}

/// Leaves `id` as the only active semester. Callers run it inside a
/// transaction.
fn activate(conn: &Connection, id: i64) -> Result<(), ApiError> {
    let now = now_timestamp();
    conn.execute(
        "UPDATE semesters SET is_active = 0, updated_at = ? WHERE is_active = 1 AND id <> ?",
        (&now, id),
    )?;
    conn.execute(
        "UPDATE semesters SET is_active = 1, updated_at = ? WHERE id = ?",
        (&now, id),
    )?;
    Ok(())
}

fn handle_semesters_list(ctx: &Ctx<'_>, _req: &Request) -> Result<Reply, ApiError> {
    let semesters = query_json(
        ctx.conn,
        &format!("{SEMESTER_SELECT} ORDER BY start_date DESC, id DESC"),
        [],
        semester_row,
    )?;
    Ok(ok("semesters loaded", json!({ "semesters": semesters })))
}

fn handle_semesters_active(ctx: &Ctx<'_>, _req: &Request) -> Result<Reply, ApiError> {
    let semester = ctx
        .conn
        .query_row(
            &format!("{SEMESTER_SELECT} WHERE is_active = 1 ORDER BY id DESC LIMIT 1"),
            [],
            semester_row,
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found("no active semester"))?;
    Ok(ok("active semester loaded", json!({ "semester": semester })))
}

fn handle_semesters_get(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let semester = load_semester(ctx.conn, path_id(req)?)?;
    Ok(ok("semester loaded", json!({ "semester": semester })))
}

fn handle_semesters_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let name = required_str(req, "name")?;
    let academic_year = required_str(req, "academic_year")?;
    let start = required_date(req, "start_date")?;
    let end = required_date(req, "end_date")?;
    check_range(&start, &end)?;
    let make_active = optional_bool(req, "is_active")?.unwrap_or(false);

    let now = now_timestamp();
    let tx = ctx.conn.unchecked_transaction()?;
    tx.execute(
        "INSERT INTO semesters(name, academic_year, start_date, end_date, is_active, created_at, updated_at)
         VALUES(?, ?, ?, ?, 0, ?, ?)",
        (&name, &academic_year, &start, &end, &now, &now),
    )
    .on_duplicate("semester already exists for this academic year")?;
    let id = tx.last_insert_rowid();
    if make_active {
        activate(&tx, id)?;
    }
    tx.commit()?;
    let semester = load_semester(ctx.conn, id)?;
    Ok(created("semester created", json!({ "semester": semester })))
}

fn handle_semesters_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    let (cur_start, cur_end): (String, String) = ctx
        .conn
        .query_row(
            "SELECT start_date, end_date FROM semesters WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found("semester not found"))?;

    let mut patch = Patch::new();
    if has_key(req, "name") {
        patch.set("name", required_str(req, "name")?);
    }
    if has_key(req, "academic_year") {
        patch.set("academic_year", required_str(req, "academic_year")?);
    }
    let start = if has_key(req, "start_date") {
        required_date(req, "start_date")?
    } else {
        cur_start
    };
    let end = if has_key(req, "end_date") {
        required_date(req, "end_date")?
    } else {
        cur_end
    };
    check_range(&start, &end)?;
    if has_key(req, "start_date") {
        patch.set("start_date", start);
    }
    if has_key(req, "end_date") {
        patch.set("end_date", end);
    }
    let make_active = optional_bool(req, "is_active")?;
    if patch.is_empty() && make_active.is_none() {
        return Err(ApiError::bad_params("no fields to update"));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    if !patch.is_empty() {
        patch.set("updated_at", now_timestamp());
        patch
            .execute(&tx, "semesters", id)
            .on_duplicate("semester already exists for this academic year")?;
    }
    match make_active {
        Some(true) => activate(&tx, id)?,
        Some(false) => {
            tx.execute(
                "UPDATE semesters SET is_active = 0, updated_at = ? WHERE id = ?",
                (now_timestamp(), id),
            )?;
        }
        None => {}
    }
    tx.commit()?;
    let semester = load_semester(ctx.conn, id)?;
    Ok(ok("semester updated", json!({ "semester": semester })))
}

fn handle_semesters_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "semesters", id, "semester")?;
    ctx.conn
        .execute("DELETE FROM semesters WHERE id = ?", [id])
        .on_in_use("semester still has enrollments, schedules or grades")?;
    Ok(ok("semester deleted", json!({ "id": id })))
}

fn handle_semesters_activate(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    ensure_exists(ctx.conn, "semesters", id, "semester")?;
    let tx = ctx.conn.unchecked_transaction()?;
    activate(&tx, id)?;
    tx.commit()?;
    tracing::info!(semester_id = id, "semester activated");
    let semester = load_semester(ctx.conn, id)?;
    Ok(ok("semester activated", json!({ "semester": semester })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "semesters.list" => Some(handle_semesters_list(ctx, req)),
        "semesters.active" => Some(handle_semesters_active(ctx, req)),
        "semesters.get" => Some(handle_semesters_get(ctx, req)),
        "semesters.create" => Some(handle_semesters_create(ctx, req)),
        "semesters.update" => Some(handle_semesters_update(ctx, req)),
        "semesters.delete" => Some(handle_semesters_delete(ctx, req)),
        "semesters.activate" => Some(handle_semesters_activate(ctx, req)),
        _ => None,
    }
}
