use std::collections::BTreeMap;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

use crate::api::error::{ok, ApiError, Reply};
use crate::api::helpers::{
    caller, has_key, optional_i64, optional_str, path_id, query_json, required_i64, student_for,
    teacher_id_for, value_f64,
};
use crate::api::types::{Ctx, Request};
use crate::calc::{self, CreditScore};
use crate::db::{now_timestamp, write_transaction};

const SCORE_KEYS: [&str; 3] = ["process_score", "midterm_score", "final_score"];

/// Score fields plus the derived letter grade, shared by every grade view.
pub(crate) fn grade_fields(
    process: Option<f64>,
    midterm: Option<f64>,
    final_score: Option<f64>,
    average: Option<f64>,
) -> Value {
    let point = average.map(calc::convert_score);
    json!({
        "process_score": process,
        "midterm_score": midterm,
        "final_score": final_score,
        "average_score": average,
        "grade_point": point.map(|p| p.scale4),
        "letter_grade": point.map(|p| p.letter),
        "passed": average.map(calc::is_passing),
    })
}

fn score(v: Option<&Value>, key: &str) -> Result<Option<f64>, ApiError> {
    let s = value_f64(v, key)?;
    if let Some(x) = s {
        if !(0.0..=10.0).contains(&x) {
            return Err(ApiError::bad_params(format!("{key} must be between 0 and 10")));
        }
    }
    Ok(s)
}

/// Fails with 403 unless `teacher_id` is assigned to the subject.
pub(crate) fn ensure_teaches(conn: &Connection, teacher_id: i64, subject_id: i64) -> Result<(), ApiError> {
    let owner: Option<Option<i64>> = conn
        .query_row("SELECT teacher_id FROM subjects WHERE id = ?", [subject_id], |r| r.get(0))
        .optional()?;
    match owner {
        None => Err(ApiError::not_found("subject not found")),
        Some(Some(t)) if t == teacher_id => Ok(()),
        Some(_) => Err(ApiError::forbidden("you are not assigned to this subject")),
    }
}

#[derive(Debug, Clone)]
struct GradeInput {
    student_id: i64,
    subject_id: i64,
    semester_id: i64,
    scores: [Option<f64>; 3],
    notes: Option<String>,
}

impl GradeInput {
    fn from_object(
        obj: &Value,
        subject_id: Option<i64>,
        semester_id: Option<i64>,
    ) -> Result<Self, ApiError> {
        let int = |key: &str, fallback: Option<i64>| -> Result<i64, ApiError> {
            match obj.get(key) {
                Some(v) if !v.is_null() => v
                    .as_i64()
                    .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()))
                    .ok_or_else(|| ApiError::bad_params(format!("{key} must be an integer"))),
                _ => fallback.ok_or_else(|| ApiError::bad_params(format!("missing {key}"))),
            }
        };
        let mut scores = [None; 3];
        for (slot, key) in scores.iter_mut().zip(SCORE_KEYS) {
            *slot = score(obj.get(key), key)?;
        }
        let notes = match obj.get("notes") {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::String(_)) | Some(Value::Null) | None => None,
            Some(_) => return Err(ApiError::bad_params("notes must be a string")),
        };
        Ok(Self {
            student_id: int("student_id", None)?,
            subject_id: int("subject_id", subject_id)?,
            semester_id: int("semester_id", semester_id)?,
            scores,
            notes,
        })
    }
}

fn ensure_enrolled(conn: &Connection, student_id: i64, subject_id: i64, semester_id: i64) -> Result<(), ApiError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM enrollments WHERE student_id = ? AND subject_id = ? AND semester_id = ?",
            (student_id, subject_id, semester_id),
            |r| r.get(0),
        )
        .optional()?;
    match status.as_deref() {
        Some("registered") | Some("completed") => Ok(()),
        _ => Err(ApiError::bad_params(
            "student is not enrolled in this subject for this semester",
        )),
    }
}

/// Marks the enrollment completed once all three scores are present.
fn sync_completion(conn: &Connection, grade_id: i64) -> Result<(), ApiError> {
    conn.execute(
        "UPDATE enrollments SET status = 'completed', updated_at = ?
         WHERE status = 'registered'
           AND (student_id, subject_id, semester_id) IN (
             SELECT student_id, subject_id, semester_id FROM grades
             WHERE id = ? AND process_score IS NOT NULL
               AND midterm_score IS NOT NULL AND final_score IS NOT NULL)",
        (now_timestamp(), grade_id),
    )?;
    Ok(())
}

/// Inserts or merges one grade; scores left out keep their stored value.
fn apply_grade(conn: &Connection, teacher_id: i64, input: &GradeInput) -> Result<i64, ApiError> {
    ensure_teaches(conn, teacher_id, input.subject_id)?;
    ensure_enrolled(conn, input.student_id, input.subject_id, input.semester_id)?;
    let now = now_timestamp();
    let [process, midterm, final_score] = input.scores;
    let grade_id: i64 = conn.query_row(
        "INSERT INTO grades(student_id, subject_id, semester_id, process_score, midterm_score, final_score,
                            graded_by, notes, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(student_id, subject_id, semester_id) DO UPDATE SET
           process_score = COALESCE(excluded.process_score, grades.process_score),
           midterm_score = COALESCE(excluded.midterm_score, grades.midterm_score),
           final_score = COALESCE(excluded.final_score, grades.final_score),
           graded_by = excluded.graded_by,
           notes = COALESCE(excluded.notes, grades.notes),
           updated_at = excluded.updated_at
         RETURNING id",
        (
            input.student_id,
            input.subject_id,
            input.semester_id,
            process,
            midterm,
            final_score,
            teacher_id,
            &input.notes,
            &now,
            &now,
        ),
        |r| r.get(0),
    )?;
    sync_completion(conn, grade_id)?;
    Ok(grade_id)
}

const GRADE_SELECT: &str = "SELECT
       g.id, g.student_id, st.student_code, u.full_name,
       g.subject_id, sb.code, sb.name, sb.credits,
       g.semester_id, se.name, se.academic_year,
       g.process_score, g.midterm_score, g.final_score, g.average_score,
       g.notes, g.updated_at
     FROM grades g
     JOIN students st ON st.id = g.student_id
     JOIN users u ON u.id = st.user_id
     JOIN subjects sb ON sb.id = g.subject_id
     JOIN semesters se ON se.id = g.semester_id";

fn grade_row(r: &Row<'_>) -> rusqlite::Result<Value> {
    let mut v = json!({
        "id": r.get::<_, i64>(0)?,
        "student_id": r.get::<_, i64>(1)?,
        "student_code": r.get::<_, String>(2)?,
        "student_name": r.get::<_, String>(3)?,
        "subject_id": r.get::<_, i64>(4)?,
        "subject_code": r.get::<_, String>(5)?,
        "subject_name": r.get::<_, String>(6)?,
        "credits": r.get::<_, i64>(7)?,
        "semester_id": r.get::<_, i64>(8)?,
        "semester_name": r.get::<_, String>(9)?,
        "academic_year": r.get::<_, String>(10)?,
        "notes": r.get::<_, Option<String>>(15)?,
        "updated_at": r.get::<_, String>(16)?,
    });
    merge(
        &mut v,
        grade_fields(r.get(11)?, r.get(12)?, r.get(13)?, r.get(14)?),
    );
    Ok(v)
}

fn merge(into: &mut Value, from: Value) {
    if let (Value::Object(a), Value::Object(b)) = (into, from) {
        a.extend(b);
    }
}

fn load_grade(conn: &Connection, id: i64) -> Result<Value, ApiError> {
    conn.query_row(&format!("{GRADE_SELECT} WHERE g.id = ?"), [id], grade_row)
        .optional()?
        .ok_or_else(|| ApiError::not_found("grade not found"))
}

fn handle_teacher_grades_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let subject_id = required_i64(req, "subject_id")?;
    let semester_id = required_i64(req, "semester_id")?;
    ensure_teaches(ctx.conn, teacher_id, subject_id)?;

    let mut sql = "SELECT
           e.id, e.status, e.student_id, st.student_code, u.full_name, e.class_id, c.name,
           g.id, g.process_score, g.midterm_score, g.final_score, g.average_score, g.notes
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

    let students = query_json(ctx.conn, &sql, rusqlite::params_from_iter(values), |r| {
        let grade_id: Option<i64> = r.get(7)?;
        let mut grade = grade_fields(r.get(8)?, r.get(9)?, r.get(10)?, r.get(11)?);
        grade["id"] = json!(grade_id);
        grade["notes"] = json!(r.get::<_, Option<String>>(12)?);
        Ok(json!({
            "enrollment_id": r.get::<_, i64>(0)?,
            "enrollment_status": r.get::<_, String>(1)?,
            "student_id": r.get::<_, i64>(2)?,
            "student_code": r.get::<_, String>(3)?,
            "student_name": r.get::<_, String>(4)?,
            "class_id": r.get::<_, i64>(5)?,
            "class_name": r.get::<_, String>(6)?,
            "grade": grade,
        }))
    })?;
    Ok(ok(
        "grades loaded",
        json!({ "subject_id": subject_id, "semester_id": semester_id, "students": students }),
    ))
}

fn handle_teacher_grades_upsert(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let input = GradeInput::from_object(&req.params, None, None)?;
    let tx = write_transaction(ctx.conn)?;
    let grade_id = apply_grade(&tx, teacher_id, &input)?;
    tx.commit()?;
    let grade = load_grade(ctx.conn, grade_id)?;
    Ok(ok("grade saved", json!({ "grade": grade })))
}

fn handle_teacher_grades_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let id = path_id(req)?;
    let tx = write_transaction(ctx.conn)?;
    let (student_id, subject_id, semester_id): (i64, i64, i64) = tx
        .query_row(
            "SELECT student_id, subject_id, semester_id FROM grades WHERE id = ?",
            [id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| ApiError::not_found("grade not found"))?;
    ensure_teaches(&tx, teacher_id, subject_id)?;
    ensure_enrolled(&tx, student_id, subject_id, semester_id)?;

    let mut sets: Vec<String> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    for key in SCORE_KEYS {
        if has_key(req, key) {
            sets.push(format!("{key} = ?"));
            values.push(score(req.params.get(key), key)?.into());
        }
    }
    if has_key(req, "notes") {
        sets.push("notes = ?".to_string());
        values.push(optional_str(req, "notes")?.into());
    }
    if sets.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }
    sets.push("graded_by = ?".to_string());
    values.push(teacher_id.into());
    sets.push("updated_at = ?".to_string());
    values.push(now_timestamp().into());
    values.push(id.into());

    tx.execute(
        &format!("UPDATE grades SET {} WHERE id = ?", sets.join(", ")),
        rusqlite::params_from_iter(values),
    )?;
    sync_completion(&tx, id)?;
    tx.commit()?;
    let grade = load_grade(ctx.conn, id)?;
    Ok(ok("grade updated", json!({ "grade": grade })))
}

fn handle_teacher_grades_bulk(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let teacher_id = teacher_id_for(ctx.conn, caller(req)?.id)?;
    let subject_id = optional_i64(req, "subject_id")?;
    let semester_id = optional_i64(req, "semester_id")?;
    let Some(items) = req.params.get("grades").and_then(Value::as_array) else {
        return Err(ApiError::bad_params("grades must be an array"));
    };
    if items.is_empty() {
        return Err(ApiError::bad_params("grades must not be empty"));
    }

    let tx = write_transaction(ctx.conn)?;
    let mut ids = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        let applied = GradeInput::from_object(item, subject_id, semester_id)
            .and_then(|input| apply_grade(&tx, teacher_id, &input));
        match applied {
            Ok(id) => ids.push(id),
            // Dropping the transaction rolls back every row written so far.
            Err(e) => {
                let mut details = e.details.clone().unwrap_or_else(|| json!({}));
                details["index"] = json!(index);
                return Err(ApiError { details: Some(details), ..e });
            }
        }
    }
    tx.commit()?;
    tracing::info!(teacher_id, count = ids.len(), "bulk grades saved");

    let grades = ids
        .iter()
        .map(|id| load_grade(ctx.conn, *id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ok(
        "grades saved",
        json!({ "count": grades.len(), "grades": grades }),
    ))
}

fn handle_student_grades(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let mut sql = format!("{GRADE_SELECT} WHERE g.student_id = ?");
    let mut values: Vec<SqlValue> = vec![student.id.into()];
    if let Some(semester_id) = optional_i64(req, "semester_id")? {
        sql.push_str(" AND g.semester_id = ?");
        values.push(semester_id.into());
    }
    sql.push_str(" ORDER BY se.start_date, sb.code");
    let grades = query_json(ctx.conn, &sql, rusqlite::params_from_iter(values), grade_row)?;
    Ok(ok("grades loaded", json!({ "grades": grades })))
}

fn summary_json(items: &[CreditScore]) -> Value {
    let summary = calc::summarize(items);
    json!({
        "gpa": summary.gpa,
        "total_credits": summary.total_credits,
        "earned_credits": summary.earned_credits,
        "subject_count": items.len(),
        "standing": summary.gpa.map(calc::classify),
    })
}

fn handle_student_gpa(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let student = student_for(ctx.conn, caller(req)?.id)?;
    let mut stmt = ctx.conn.prepare(
        "SELECT g.semester_id, se.name, se.academic_year, se.start_date, g.average_score, sb.credits
         FROM grades g
         JOIN subjects sb ON sb.id = g.subject_id
         JOIN semesters se ON se.id = g.semester_id
         WHERE g.student_id = ? AND g.average_score IS NOT NULL
         ORDER BY se.start_date, g.semester_id",
    )?;
    let rows = stmt
        .query_map([student.id], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                CreditScore {
                    score10: r.get(4)?,
                    credits: r.get(5)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    // Keyed by (start_date, id) so semesters come out in calendar order.
    let mut by_semester: BTreeMap<(String, i64), (String, String, Vec<CreditScore>)> = BTreeMap::new();
    let mut all = Vec::with_capacity(rows.len());
    for (semester_id, name, year, start, item) in rows {
        by_semester
            .entry((start, semester_id))
            .or_insert_with(|| (name, year, Vec::new()))
            .2
            .push(item);
        all.push(item);
    }

    let semesters: Vec<Value> = by_semester
        .into_iter()
        .map(|((_, semester_id), (name, year, items))| {
            let mut v = summary_json(&items);
            v["semester_id"] = json!(semester_id);
            v["semester_name"] = json!(name);
            v["academic_year"] = json!(year);
            v
        })
        .collect();

    Ok(ok(
        "gpa computed",
        json!({ "semesters": semesters, "cumulative": summary_json(&all) }),
    ))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "teacher.grades.list" => Some(handle_teacher_grades_list(ctx, req)),
        "teacher.grades.upsert" => Some(handle_teacher_grades_upsert(ctx, req)),
        "teacher.grades.update" => Some(handle_teacher_grades_update(ctx, req)),
        "teacher.grades.bulk" => Some(handle_teacher_grades_bulk(ctx, req)),
        "student.grades" => Some(handle_student_grades(ctx, req)),
        "student.gpa" => Some(handle_student_gpa(ctx, req)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grade_fields_derive_letter_from_average() {
        let v = grade_fields(Some(9.0), Some(8.0), Some(8.5), Some(8.55));
        assert_eq!(v["letter_grade"], "A");
        assert_eq!(v["grade_point"], 4.0);
        assert_eq!(v["passed"], true);

        let pending = grade_fields(Some(9.0), None, None, None);
        assert!(pending["letter_grade"].is_null());
        assert!(pending["passed"].is_null());
    }

    #[test]
    fn grade_input_reads_strings_and_rejects_out_of_range() {
        let item = json!({ "student_id": "4", "process_score": 7.5, "final_score": "6" });
        let input = GradeInput::from_object(&item, Some(1), Some(2)).unwrap();
        assert_eq!(input.student_id, 4);
        assert_eq!(input.subject_id, 1);
        assert_eq!(input.scores, [Some(7.5), None, Some(6.0)]);

        let bad = json!({ "student_id": 4, "midterm_score": 10.5 });
        assert!(GradeInput::from_object(&bad, Some(1), Some(2)).is_err());
        let missing = json!({ "process_score": 5 });
        assert!(GradeInput::from_object(&missing, Some(1), Some(2)).is_err());
    }
}
