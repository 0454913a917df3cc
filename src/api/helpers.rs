use chrono::NaiveDate;
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;

use super::error::ApiError;
use super::types::Request;
use crate::auth::Claims;

pub fn caller(req: &Request) -> Result<&Claims, ApiError> {
    req.caller
        .as_ref()
        .ok_or_else(|| ApiError::unauthorized("authentication required"))
}

pub fn has_key(req: &Request, key: &str) -> bool {
    req.params.get(key).is_some()
}

pub fn required_str(req: &Request, key: &str) -> Result<String, ApiError> {
    optional_str(req, key)?.ok_or_else(|| ApiError::bad_params(format!("missing {key}")))
}

/// Passwords are taken verbatim; surrounding whitespace is significant.
pub fn required_password(req: &Request, key: &str) -> Result<String, ApiError> {
    match req.params.get(key) {
        None | Some(Value::Null) => Err(ApiError::bad_params(format!("missing {key}"))),
        Some(Value::String(s)) if s.is_empty() => Err(ApiError::bad_params(format!("missing {key}"))),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(ApiError::bad_params(format!("{key} must be a string"))),
    }
}

/// Missing, `null` and blank strings all read as `None`.
pub fn optional_str(req: &Request, key: &str) -> Result<Option<String>, ApiError> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => {
            let t = s.trim();
            Ok(if t.is_empty() { None } else { Some(t.to_string()) })
        }
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(ApiError::bad_params(format!("{key} must be a string"))),
    }
}

pub fn required_i64(req: &Request, key: &str) -> Result<i64, ApiError> {
    optional_i64(req, key)?.ok_or_else(|| ApiError::bad_params(format!("missing {key}")))
}

/// Accepts JSON integers and numeric strings (query and path values).
pub fn optional_i64(req: &Request, key: &str) -> Result<Option<i64>, ApiError> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| ApiError::bad_params(format!("{key} must be an integer"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| ApiError::bad_params(format!("{key} must be an integer"))),
        Some(_) => Err(ApiError::bad_params(format!("{key} must be an integer"))),
    }
}

pub fn optional_f64(req: &Request, key: &str) -> Result<Option<f64>, ApiError> {
    value_f64(req.params.get(key), key)
}

pub fn value_f64(v: Option<&Value>, key: &str) -> Result<Option<f64>, ApiError> {
    match v {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| ApiError::bad_params(format!("{key} must be a number"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| ApiError::bad_params(format!("{key} must be a number"))),
        Some(_) => Err(ApiError::bad_params(format!("{key} must be a number"))),
    }
}

pub fn optional_bool(req: &Request, key: &str) -> Result<Option<bool>, ApiError> {
    match req.params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => Ok(Some(n.as_i64() != Some(0))),
        Some(Value::String(s)) => crate::config::parse_bool(s)
            .map(Some)
            .ok_or_else(|| ApiError::bad_params(format!("{key} must be a boolean"))),
        Some(_) => Err(ApiError::bad_params(format!("{key} must be a boolean"))),
    }
}

pub fn path_id(req: &Request) -> Result<i64, ApiError> {
    required_i64(req, "id")
}

/// `YYYY-MM-DD`.
pub fn optional_date(req: &Request, key: &str) -> Result<Option<String>, ApiError> {
    let Some(raw) = optional_str(req, key)? else {
        return Ok(None);
    };
    NaiveDate::parse_from_str(&raw, "%Y-%m-%d")
        .map(|d| Some(d.format("%Y-%m-%d").to_string()))
        .map_err(|_| ApiError::bad_params(format!("{key} must be a date (YYYY-MM-DD)")))
}

pub fn required_date(req: &Request, key: &str) -> Result<String, ApiError> {
    optional_date(req, key)?.ok_or_else(|| ApiError::bad_params(format!("missing {key}")))
}

pub fn one_of(key: &str, value: &str, allowed: &[&str]) -> Result<(), ApiError> {
    if allowed.contains(&value) {
        Ok(())
    } else {
        Err(ApiError::bad_params(format!(
            "{key} must be one of: {}",
            allowed.join(", ")
        )))
    }
}

pub fn normalize_email(raw: &str) -> Result<String, ApiError> {
    let email = raw.trim().to_ascii_lowercase();
    let valid = match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    };
    if !valid || email.contains(char::is_whitespace) {
        return Err(ApiError::bad_params("email is not valid"));
    }
    Ok(email)
}

pub const MIN_PASSWORD_LEN: usize = 6;

pub fn check_password(key: &str, password: &str) -> Result<(), ApiError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(ApiError::bad_params(format!(
            "{key} must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct Page {
    pub page: i64,
    pub limit: i64,
}

impl Page {
    pub fn offset(&self) -> i64 {
        (self.page - 1) * self.limit
    }

    pub fn meta(&self, total: i64) -> Value {
        let pages = if total == 0 { 0 } else { (total + self.limit - 1) / self.limit };
        serde_json::json!({
            "page": self.page,
            "limit": self.limit,
            "total": total,
            "pages": pages,
        })
    }
}

pub fn pagination(req: &Request) -> Result<Page, ApiError> {
    let page = optional_i64(req, "page")?.unwrap_or(1);
    let limit = optional_i64(req, "limit")?.unwrap_or(20);
    if page < 1 {
        return Err(ApiError::bad_params("page must be at least 1"));
    }
    if !(1..=100).contains(&limit) {
        return Err(ApiError::bad_params("limit must be between 1 and 100"));
    }
    if (page - 1).checked_mul(limit).is_none() {
        return Err(ApiError::bad_params("page is out of range"));
    }
    Ok(Page { page, limit })
}

/// Column assignments for a partial update; only keys present in the
/// request are written.
#[derive(Default)]
pub struct Patch {
    sets: Vec<&'static str>,
    values: Vec<SqlValue>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, column: &'static str, value: impl Into<SqlValue>) {
        self.sets.push(column);
        self.values.push(value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn execute(self, conn: &Connection, table: &str, id: i64) -> rusqlite::Result<usize> {
        if self.sets.is_empty() {
            return Ok(0);
        }
        let assignments: Vec<String> = self.sets.iter().map(|c| format!("{c} = ?")).collect();
        let sql = format!(
            "UPDATE {table} SET {} WHERE id = ?",
            assignments.join(", ")
        );
        let mut values = self.values;
        values.push(SqlValue::Integer(id));
        conn.execute(&sql, rusqlite::params_from_iter(values))
    }
}

pub fn exists(conn: &Connection, table: &str, id: i64) -> Result<bool, ApiError> {
    let sql = format!("SELECT 1 FROM {table} WHERE id = ?");
    let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    Ok(found.is_some())
}

pub fn ensure_exists(conn: &Connection, table: &str, id: i64, what: &str) -> Result<(), ApiError> {
    if exists(conn, table, id)? {
        Ok(())
    } else {
        Err(ApiError::not_found(format!("{what} not found")))
    }
}

/// Referenced row for a foreign key supplied in the request body.
pub fn ensure_ref(conn: &Connection, table: &str, id: i64, key: &str) -> Result<(), ApiError> {
    if exists(conn, table, id)? {
        Ok(())
    } else {
        Err(ApiError::bad_params(format!("{key} does not reference an existing record")))
    }
}

/// Soft-deleted or deactivated accounts lose role access even while their
/// token is still unexpired.
fn ensure_live_account(is_deleted: bool, status: &str) -> Result<(), ApiError> {
    if is_deleted {
        return Err(ApiError::unauthorized("account no longer exists"));
    }
    if status != "active" {
        return Err(ApiError::forbidden("account is inactive"));
    }
    Ok(())
}

pub fn teacher_id_for(conn: &Connection, user_id: i64) -> Result<i64, ApiError> {
    let (id, is_deleted, status): (i64, bool, String) = conn
        .query_row(
            "SELECT t.id, u.is_deleted, u.status
             FROM teachers t JOIN users u ON u.id = t.user_id
             WHERE t.user_id = ?",
            [user_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?
        .ok_or_else(|| ApiError::forbidden("teacher profile not found"))?;
    ensure_live_account(is_deleted, &status)?;
    Ok(id)
}

#[derive(Debug, Clone, Copy)]
pub struct StudentRef {
    pub id: i64,
    pub class_id: Option<i64>,
}

pub fn student_for(conn: &Connection, user_id: i64) -> Result<StudentRef, ApiError> {
    let (student, is_deleted, status): (StudentRef, bool, String) = conn
        .query_row(
            "SELECT s.id, s.class_id, u.is_deleted, u.status
             FROM students s JOIN users u ON u.id = s.user_id
             WHERE s.user_id = ?",
            [user_id],
            |r| {
                let student = StudentRef {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                };
                Ok((student, r.get(2)?, r.get(3)?))
            },
        )
        .optional()?
        .ok_or_else(|| ApiError::forbidden("student profile not found"))?;
    ensure_live_account(is_deleted, &status)?;
    Ok(student)
}

pub fn active_semester_id(conn: &Connection) -> Result<Option<i64>, ApiError> {
    Ok(conn
        .query_row(
            "SELECT id FROM semesters WHERE is_active = 1 ORDER BY id DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?)
}

/// First free `{prefix}{n:06}` code in `table.column`, counting up from the
/// current row count.
pub fn next_code(conn: &Connection, table: &str, column: &str, prefix: &str) -> Result<String, ApiError> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
    let probe = format!("SELECT 1 FROM {table} WHERE {column} = ?");
    let mut n = count + 1;
    loop {
        let code = format!("{prefix}{n:06}");
        let taken: Option<i64> = conn.query_row(&probe, [&code], |r| r.get(0)).optional()?;
        if taken.is_none() {
            return Ok(code);
        }
        n += 1;
    }
}

/// Collects `SELECT` rows already mapped to JSON.
pub fn query_json<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    map: impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<Value>,
) -> Result<Vec<Value>, ApiError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, map)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
