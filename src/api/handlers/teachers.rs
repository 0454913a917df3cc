use serde_json::json;

use super::catalog::{subject_row, subjects_where};
use crate::api::error::{ok, ApiError, Reply};
use crate::api::helpers::{active_semester_id, caller, optional_i64, query_json, teacher_id_for};
use crate::api::types::{Ctx, Request};

fn handle_teacher_subjects(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let subjects = query_json(
        ctx.conn,
        &subjects_where("s.teacher_id = ?"),
        [teacher_id],
        subject_row,
    )?;
    Ok(ok("subjects loaded", json!({ "subjects": subjects })))
}

/// Classes the teacher meets: homeroom classes plus classes with enrollments
/// or schedule slots in the teacher's subjects.
fn handle_teacher_classes(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let semester_id = match optional_i64(req, "semester_id")? {
        Some(s) => Some(s),
        None => active_semester_id(ctx.conn)?,
    };
    let classes = query_json(
        ctx.conn,
        "SELECT c.id, c.code, c.name, c.academic_year, c.homeroom_teacher_id = ?1,
                (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
         FROM classes c
         WHERE c.homeroom_teacher_id = ?1
            OR c.id IN (SELECT e.class_id FROM enrollments e
                        JOIN subjects sb ON sb.id = e.subject_id
                        WHERE sb.teacher_id = ?1 AND e.status <> 'dropped'
                          AND (?2 IS NULL OR e.semester_id = ?2))
            OR c.id IN (SELECT sc.class_id FROM schedules sc
                        WHERE sc.teacher_id = ?1 AND (?2 IS NULL OR sc.semester_id = ?2))
         ORDER BY c.code",
        rusqlite::params![teacher_id, semester_id],
        |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "code": r.get::<_, String>(1)?,
                "name": r.get::<_, String>(2)?,
                "academic_year": r.get::<_, Option<String>>(3)?,
                "is_homeroom": r.get::<_, Option<bool>>(4)?.unwrap_or(false),
                "student_count": r.get::<_, i64>(5)?,
            }))
        },
    )?;
    Ok(ok(
        "classes loaded",
        json!({ "semester_id": semester_id, "classes": classes }),
    ))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "teacher.subjects" => Some(handle_teacher_subjects(ctx, req)),
        "teacher.classes" => Some(handle_teacher_classes(ctx, req)),
        _ => None,
    }
}
