use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

use crate::api::error::{created, ok, ApiError, DbResultExt, Reply};
use crate::api::helpers::{
    active_semester_id, caller, ensure_ref, has_key, optional_i64, optional_str, path_id,
    query_json, required_i64, student_for, teacher_id_for,
};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;

const SCHEDULE_SELECT: &str = "SELECT
       sc.id, sc.day_of_week, sc.period, sc.room,
       sc.class_id, c.code, c.name,
       sc.subject_id, sb.code, sb.name,
       sc.semester_id, se.name,
       sc.teacher_id, u.full_name
     FROM schedules sc
     JOIN classes c ON c.id = sc.class_id
     JOIN subjects sb ON sb.id = sc.subject_id
     JOIN semesters se ON se.id = sc.semester_id
     LEFT JOIN teachers t ON t.id = sc.teacher_id
     LEFT JOIN users u ON u.id = t.user_id";

const ORDER: &str = " ORDER BY sc.day_of_week, sc.period, c.code";

fn schedule_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, i64>(0)?,
        "day_of_week": r.get::<_, i64>(1)?,
        "period": r.get::<_, i64>(2)?,
        "room": r.get::<_, Option<String>>(3)?,
        "class_id": r.get::<_, i64>(4)?,
        "class_code": r.get::<_, String>(5)?,
        "class_name": r.get::<_, String>(6)?,
        "subject_id": r.get::<_, i64>(7)?,
        "subject_code": r.get::<_, String>(8)?,
        "subject_name": r.get::<_, String>(9)?,
        "semester_id": r.get::<_, i64>(10)?,
        "semester_name": r.get::<_, String>(11)?,
        "teacher_id": r.get::<_, Option<i64>>(12)?,
        "teacher_name": r.get::<_, Option<String>>(13)?,
    }))
}

fn load_schedule(conn: &Connection, id: i64) -> Result<serde_json::Value, ApiError> {
    conn.query_row(&format!("{SCHEDULE_SELECT} WHERE sc.id = ?"), [id], schedule_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("schedule not found"))
}

#[derive(Debug, Clone, PartialEq)]
struct Slot {
    class_id: i64,
    subject_id: i64,
    semester_id: i64,
    teacher_id: Option<i64>,
    day_of_week: i64,
    period: i64,
    room: Option<String>,
}

impl Slot {
    fn validate(&self) -> Result<(), ApiError> {
        if !(1..=7).contains(&self.day_of_week) {
            return Err(ApiError::bad_params("day_of_week must be between 1 and 7"));
        }
        if !(1..=12).contains(&self.period) {
            return Err(ApiError::bad_params("period must be between 1 and 12"));
        }
        Ok(())
    }

    /// Rejects double-booking of the class, the teacher or the room.
    /// `exclude` is the row being updated.
    fn check_conflicts(&self, conn: &Connection, exclude: i64) -> Result<(), ApiError> {
        let taken = |column: &str, value: SqlValue| -> Result<Option<i64>, ApiError> {
            let sql = format!(
                "SELECT id FROM schedules
                 WHERE semester_id = ? AND day_of_week = ? AND period = ? AND {column} = ? AND id <> ?
                 LIMIT 1"
            );
            Ok(conn
                .query_row(
                    &sql,
                    rusqlite::params![self.semester_id, self.day_of_week, self.period, value, exclude],
                    |r| r.get(0),
                )
                .optional()?)
        };

        if let Some(other) = taken("class_id", self.class_id.into())? {
            return Err(ApiError::conflict("class already has a subject in this slot")
                .with_details(json!({ "schedule_id": other })));
        }
        if let Some(teacher_id) = self.teacher_id {
            if let Some(other) = taken("teacher_id", teacher_id.into())? {
                return Err(ApiError::conflict("teacher is already booked in this slot")
                    .with_details(json!({ "schedule_id": other })));
            }
        }
        if let Some(room) = &self.room {
            if let Some(other) = taken("room", room.clone().into())? {
                return Err(ApiError::conflict("room is already booked in this slot")
                    .with_details(json!({ "schedule_id": other })));
            }
        }
        Ok(())
    }

    fn check_refs(&self, conn: &Connection) -> Result<(), ApiError> {
        ensure_ref(conn, "classes", self.class_id, "class_id")?;
        ensure_ref(conn, "subjects", self.subject_id, "subject_id")?;
        ensure_ref(conn, "semesters", self.semester_id, "semester_id")?;
        if let Some(t) = self.teacher_id {
            ensure_ref(conn, "teachers", t, "teacher_id")?;
        }
        Ok(())
    }
}

const DUPLICATE_SLOT: &str = "this class, subject and semester already occupy the slot";

fn handle_schedules_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let mut clauses = vec!["1 = 1"];
    let mut values: Vec<SqlValue> = Vec::new();
    for (key, column) in [
        ("semester_id", "sc.semester_id = ?"),
        ("class_id", "sc.class_id = ?"),
        ("subject_id", "sc.subject_id = ?"),
        ("teacher_id", "sc.teacher_id = ?"),
        ("day_of_week", "sc.day_of_week = ?"),
    ] {
        if let Some(v) = optional_i64(req, key)? {
            clauses.push(column);
            values.push(v.into());
        }
    }
    let sql = format!("{SCHEDULE_SELECT} WHERE {}{ORDER}", clauses.join(" AND "));
    let schedules = query_json(ctx.conn, &sql, rusqlite::params_from_iter(values), schedule_row)?;
    Ok(ok("schedules loaded", json!({ "schedules": schedules })))
}

fn handle_schedules_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let subject_id = required_i64(req, "subject_id")?;
    let teacher_id = match optional_i64(req, "teacher_id")? {
        Some(t) => Some(t),
        None => ctx
            .conn
            .query_row("SELECT teacher_id FROM subjects WHERE id = ?", [subject_id], |r| {
                r.get::<_, Option<i64>>(0)
            })
            .optional()?
            .flatten(),
    };
    let slot = Slot {
        class_id: required_i64(req, "class_id")?,
        subject_id,
        semester_id: required_i64(req, "semester_id")?,
        teacher_id,
        day_of_week: required_i64(req, "day_of_week")?,
        period: required_i64(req, "period")?,
        room: optional_str(req, "room")?,
    };
    slot.validate()?;
    slot.check_refs(ctx.conn)?;
    slot.check_conflicts(ctx.conn, 0)?;

    let now = now_timestamp();
    ctx.conn
        .execute(
            "INSERT INTO schedules(class_id, subject_id, semester_id, teacher_id, day_of_week, period, room, created_at, updated_at)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                slot.class_id,
                slot.subject_id,
                slot.semester_id,
                slot.teacher_id,
                slot.day_of_week,
                slot.period,
                &slot.room,
                &now,
                &now,
            ),
        )
        .on_duplicate(DUPLICATE_SLOT)?;
    let schedule = load_schedule(ctx.conn, ctx.conn.last_insert_rowid())?;
    Ok(created("schedule created", json!({ "schedule": schedule })))
}

fn handle_schedules_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    let current = ctx
        .conn
        .query_row(
            "SELECT class_id, subject_id, semester_id, teacher_id, day_of_week, period, room
             FROM schedules WHERE id = ?",
            [id],
            |r| {
                Ok(Slot {
                    class_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    semester_id: r.get(2)?,
                    teacher_id: r.get(3)?,
                    day_of_week: r.get(4)?,
                    period: r.get(5)?,
                    room: r.get(6)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found("schedule not found"))?;

    let mut slot = current.clone();
    if has_key(req, "class_id") {
        slot.class_id = required_i64(req, "class_id")?;
    }
    if has_key(req, "subject_id") {
        slot.subject_id = required_i64(req, "subject_id")?;
    }
    if has_key(req, "semester_id") {
        slot.semester_id = required_i64(req, "semester_id")?;
    }
    if has_key(req, "teacher_id") {
        slot.teacher_id = optional_i64(req, "teacher_id")?;
    }
    if has_key(req, "day_of_week") {
        slot.day_of_week = required_i64(req, "day_of_week")?;
    }
    if has_key(req, "period") {
        slot.period = required_i64(req, "period")?;
    }
    if has_key(req, "room") {
        slot.room = optional_str(req, "room")?;
    }
    if slot == current {
        let schedule = load_schedule(ctx.conn, id)?;
        return Ok(ok("schedule unchanged", json!({ "schedule": schedule })));
    }
    slot.validate()?;
    slot.check_refs(ctx.conn)?;
    slot.check_conflicts(ctx.conn, id)?;

    ctx.conn
        .execute(
            "UPDATE schedules
             SET class_id = ?, subject_id = ?, semester_id = ?, teacher_id = ?,
                 day_of_week = ?, period = ?, room = ?, updated_at = ?
             WHERE id = ?",
            (
                slot.class_id,
                slot.subject_id,
                slot.semester_id,
                slot.teacher_id,
                slot.day_of_week,
                slot.period,
                &slot.room,
                now_timestamp(),
                id,
            ),
        )
        .on_duplicate(DUPLICATE_SLOT)?;
    let schedule = load_schedule(ctx.conn, id)?;
    Ok(ok("schedule updated", json!({ "schedule": schedule })))
}

fn handle_schedules_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    let changed = ctx.conn.execute("DELETE FROM schedules WHERE id = ?", [id])?;
    if changed == 0 {
        return Err(ApiError::not_found("schedule not found"));
    }
    Ok(ok("schedule deleted", json!({ "id": id })))
}

/// Explicit `semester_id`, else the active semester, else every semester.
fn semester_scope(ctx: &Ctx<'_>, req: &Request) -> Result<Option<i64>, ApiError> {
    match optional_i64(req, "semester_id")? {
        Some(id) => Ok(Some(id)),
        None => active_semester_id(ctx.conn),
    }
}

fn handle_teacher_schedule(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let semester_id = semester_scope(ctx, req)?;
    let mut sql = format!("{SCHEDULE_SELECT} WHERE sc.teacher_id = ?");
    let mut values: Vec<SqlValue> = vec![teacher_id.into()];
    if let Some(s) = semester_id {
        sql.push_str(" AND sc.semester_id = ?");
        values.push(s.into());
    }
    sql.push_str(ORDER);
    let schedule = query_json(ctx.conn, &sql, rusqlite::params_from_iter(values), schedule_row)?;
    Ok(ok(
        "schedule loaded",
        json!({ "semester_id": semester_id, "schedule": schedule }),
    ))
}

fn handle_student_schedule(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let semester_id = semester_scope(ctx, req)?;
    // Slots of the student's own class plus any subject taken with another class.
    let mut sql = format!(
        "{SCHEDULE_SELECT}
         WHERE (sc.class_id = ?
                OR EXISTS (SELECT 1 FROM enrollments e
                           WHERE e.student_id = ? AND e.status <> 'dropped'
                             AND e.class_id = sc.class_id
                             AND e.subject_id = sc.subject_id
                             AND e.semester_id = sc.semester_id))"
    );
    let mut values: Vec<SqlValue> = vec![
        student.class_id.unwrap_or(-1).into(),
        student.id.into(),
    ];
    if let Some(s) = semester_id {
        sql.push_str(" AND sc.semester_id = ?");
        values.push(s.into());
    }
    sql.push_str(ORDER);
    let schedule = query_json(ctx.conn, &sql, rusqlite::params_from_iter(values), schedule_row)?;
    Ok(ok(
        "schedule loaded",
        json!({ "semester_id": semester_id, "schedule": schedule }),
    ))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "schedules.list" => Some(handle_schedules_list(ctx, req)),
        "schedules.create" => Some(handle_schedules_create(ctx, req)),
        "schedules.update" => Some(handle_schedules_update(ctx, req)),
        "schedules.delete" => Some(handle_schedules_delete(ctx, req)),
        "teacher.schedule" => Some(handle_teacher_schedule(ctx, req)),
        "student.schedule" => Some(handle_student_schedule(ctx, req)),
        _ => None,
    }
}
