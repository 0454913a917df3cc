use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::json;

use crate::api::error::{created, ok, ApiError, DbResultExt, Reply};
use crate::api::helpers::{
    caller, check_password, ensure_ref, has_key, next_code, normalize_email, one_of,
    optional_bool, optional_date, optional_i64, optional_str, pagination, path_id,
    required_password, required_str, Patch,
};
use crate::api::types::{Ctx, Request};
use crate::auth::{self, Role};
use crate::db::now_timestamp;

const USER_SELECT: &str = "SELECT
       u.id, u.email, u.full_name, u.role, u.phone, u.status,
       u.last_login_at, u.created_at, u.updated_at, u.is_deleted, u.deleted_at,
       t.id, t.teacher_code, t.department, t.degree, t.specialization, t.hire_date,
       s.id, s.student_code, s.class_id, c.name, s.major_id, m.name,
       s.date_of_birth, s.gender, s.address, s.enrollment_year
     FROM users u
     LEFT JOIN teachers t ON t.user_id = u.id
     LEFT JOIN students s ON s.user_id = u.id
     LEFT JOIN classes c ON c.id = s.class_id
     LEFT JOIN majors m ON m.id = s.major_id";

fn user_row(r: &Row<'_>) -> rusqlite::Result<serde_json::Value> {
    let teacher_id: Option<i64> = r.get(11)?;
    let student_id: Option<i64> = r.get(17)?;
    let teacher = match teacher_id {
        Some(id) => json!({
            "id": id,
            "teacher_code": r.get::<_, String>(12)?,
            "department": r.get::<_, Option<String>>(13)?,
            "degree": r.get::<_, Option<String>>(14)?,
            "specialization": r.get::<_, Option<String>>(15)?,
            "hire_date": r.get::<_, Option<String>>(16)?,
        }),
        None => serde_json::Value::Null,
    };
    let student = match student_id {
        Some(id) => json!({
            "id": id,
            "student_code": r.get::<_, String>(18)?,
            "class_id": r.get::<_, Option<i64>>(19)?,
            "class_name": r.get::<_, Option<String>>(20)?,
            "major_id": r.get::<_, Option<i64>>(21)?,
            "major_name": r.get::<_, Option<String>>(22)?,
            "date_of_birth": r.get::<_, Option<String>>(23)?,
            "gender": r.get::<_, Option<String>>(24)?,
            "address": r.get::<_, Option<String>>(25)?,
            "enrollment_year": r.get::<_, Option<i64>>(26)?,
        }),
        None => serde_json::Value::Null,
    };
    let mut user = json!({
        "id": r.get::<_, i64>(0)?,
        "email": r.get::<_, String>(1)?,
        "full_name": r.get::<_, String>(2)?,
        "role": r.get::<_, String>(3)?,
        "phone": r.get::<_, Option<String>>(4)?,
        "status": r.get::<_, String>(5)?,
        "last_login_at": r.get::<_, Option<String>>(6)?,
        "created_at": r.get::<_, String>(7)?,
        "updated_at": r.get::<_, String>(8)?,
        "teacher": teacher,
        "student": student,
    });
    if r.get::<_, i64>(9)? != 0 {
        user["deleted_at"] = json!(r.get::<_, Option<String>>(10)?);
    }
    Ok(user)
}

/// Live (not soft-deleted) user with its teacher or student profile.
pub(crate) fn load_user(conn: &Connection, user_id: i64) -> Result<Option<serde_json::Value>, ApiError> {
    let sql = format!("{USER_SELECT} WHERE u.id = ? AND u.is_deleted = 0");
    Ok(conn.query_row(&sql, [user_id], user_row).optional()?)
}

fn handle_users_list(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let page = pagination(req)?;
    let deleted = optional_bool(req, "deleted")?.unwrap_or(false);

    let mut clauses = vec![if deleted { "u.is_deleted = 1" } else { "u.is_deleted = 0" }.to_string()];
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(role) = optional_str(req, "role")? {
        one_of("role", &role, &["admin", "teacher", "student"])?;
        clauses.push("u.role = ?".to_string());
        values.push(role.into());
    }
    if let Some(status) = optional_str(req, "status")? {
        one_of("status", &status, &["active", "inactive"])?;
        clauses.push("u.status = ?".to_string());
        values.push(status.into());
    }
    if let Some(q) = optional_str(req, "q")? {
        clauses.push(
            "(u.email LIKE ? OR u.full_name LIKE ? OR t.teacher_code LIKE ? OR s.student_code LIKE ?)"
                .to_string(),
        );
        let pattern = format!("%{q}%");
        for _ in 0..4 {
            values.push(pattern.clone().into());
        }
    }
    let where_sql = clauses.join(" AND ");

    let total: i64 = ctx.conn.query_row(
        &format!(
            "SELECT COUNT(*) FROM users u
             LEFT JOIN teachers t ON t.user_id = u.id
             LEFT JOIN students s ON s.user_id = u.id
             WHERE {where_sql}"
        ),
        rusqlite::params_from_iter(values.iter()),
        |r| r.get(0),
    )?;

    let sql = format!("{USER_SELECT} WHERE {where_sql} ORDER BY u.id LIMIT ? OFFSET ?");
    values.push(page.limit.into());
    values.push(page.offset().into());
    let mut stmt = ctx.conn.prepare(&sql)?;
    let users = stmt
        .query_map(rusqlite::params_from_iter(values.iter()), user_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ok(
        "users loaded",
        json!({ "users": users, "pagination": page.meta(total) }),
    ))
}

fn handle_users_get(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    let user = load_user(ctx.conn, id)?.ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(ok("user loaded", json!({ "user": user })))
}

/// Profile columns shared by admin create and self-registration.
pub(crate) struct StudentProfile {
    pub student_code: Option<String>,
    pub class_id: Option<i64>,
    pub major_id: Option<i64>,
    pub date_of_birth: Option<String>,
    pub gender: Option<String>,
    pub address: Option<String>,
    pub enrollment_year: Option<i64>,
}

impl StudentProfile {
    pub(crate) fn from_request(req: &Request) -> Result<Self, ApiError> {
        let gender = optional_str(req, "gender")?;
        if let Some(g) = &gender {
            one_of("gender", g, &["male", "female", "other"])?;
        }
        Ok(Self {
            student_code: optional_str(req, "student_code")?,
            class_id: optional_i64(req, "class_id")?,
            major_id: optional_i64(req, "major_id")?,
            date_of_birth: optional_date(req, "date_of_birth")?,
            gender,
            address: optional_str(req, "address")?,
            enrollment_year: optional_i64(req, "enrollment_year")?,
        })
    }

    pub(crate) fn insert(self, conn: &Connection, user_id: i64) -> Result<i64, ApiError> {
        if let Some(class_id) = self.class_id {
            ensure_ref(conn, "classes", class_id, "class_id")?;
        }
        if let Some(major_id) = self.major_id {
            ensure_ref(conn, "majors", major_id, "major_id")?;
        }
        let code = match self.student_code {
            Some(c) => c,
            None => next_code(conn, "students", "student_code", "SV")?,
        };
        conn.execute(
            "INSERT INTO students(user_id, student_code, class_id, major_id, date_of_birth, gender, address, enrollment_year)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                user_id,
                &code,
                self.class_id,
                self.major_id,
                &self.date_of_birth,
                &self.gender,
                &self.address,
                self.enrollment_year,
            ),
        )
        .on_duplicate("student code already in use")?;
        Ok(conn.last_insert_rowid())
    }
}

struct TeacherProfile {
    teacher_code: Option<String>,
    department: Option<String>,
    degree: Option<String>,
    specialization: Option<String>,
    hire_date: Option<String>,
}

impl TeacherProfile {
    fn from_request(req: &Request) -> Result<Self, ApiError> {
        Ok(Self {
            teacher_code: optional_str(req, "teacher_code")?,
            department: optional_str(req, "department")?,
            degree: optional_str(req, "degree")?,
            specialization: optional_str(req, "specialization")?,
            hire_date: optional_date(req, "hire_date")?,
        })
    }

    fn insert(self, conn: &Connection, user_id: i64) -> Result<i64, ApiError> {
        let code = match self.teacher_code {
            Some(c) => c,
            None => next_code(conn, "teachers", "teacher_code", "GV")?,
        };
        conn.execute(
            "INSERT INTO teachers(user_id, teacher_code, department, degree, specialization, hire_date)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                user_id,
                &code,
                &self.department,
                &self.degree,
                &self.specialization,
                &self.hire_date,
            ),
        )
        .on_duplicate("teacher code already in use")?;
        Ok(conn.last_insert_rowid())
    }
}

pub(crate) fn insert_user(
    conn: &Connection,
    email: &str,
    password: &str,
    full_name: &str,
    role: Role,
    phone: Option<&str>,
    status: &str,
) -> Result<i64, ApiError> {
    let hash = auth::hash_password(password)?;
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO users(email, password_hash, full_name, role, phone, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (email, &hash, full_name, role.as_str(), phone, status, &now, &now),
    )
    .on_duplicate("email already in use")?;
    Ok(conn.last_insert_rowid())
}

fn handle_users_create(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let email = normalize_email(&required_str(req, "email")?)?;
    let password = required_password(req, "password")?;
    check_password("password", &password)?;
    let full_name = required_str(req, "full_name")?;
    let role_raw = required_str(req, "role")?;
    let role = Role::parse(&role_raw)
        .ok_or_else(|| ApiError::bad_params("role must be one of: admin, teacher, student"))?;
    let phone = optional_str(req, "phone")?;
    let status = optional_str(req, "status")?.unwrap_or_else(|| "active".to_string());
    one_of("status", &status, &["active", "inactive"])?;

    let student = match role {
        Role::Student => Some(StudentProfile::from_request(req)?),
        _ => None,
    };
    let teacher = match role {
        Role::Teacher => Some(TeacherProfile::from_request(req)?),
        _ => None,
    };

    let tx = ctx.conn.unchecked_transaction()?;
    let user_id = insert_user(&tx, &email, &password, &full_name, role, phone.as_deref(), &status)?;
    if let Some(profile) = student {
        profile.insert(&tx, user_id)?;
    }
    if let Some(profile) = teacher {
        profile.insert(&tx, user_id)?;
    }
    tx.commit()?;

    let user = load_user(ctx.conn, user_id)?.ok_or_else(|| ApiError::internal("created user vanished"))?;
    Ok(created("user created", json!({ "user": user })))
}

fn handle_users_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let me = caller(req)?;
    let id = path_id(req)?;
    let role: Option<String> = ctx
        .conn
        .query_row(
            "SELECT role FROM users WHERE id = ? AND is_deleted = 0",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    let role = role.ok_or_else(|| ApiError::not_found("user not found"))?;
    if let Some(requested) = optional_str(req, "role")? {
        if requested != role {
            return Err(ApiError::bad_params("role cannot be changed"));
        }
    }

    let mut user = Patch::new();
    if has_key(req, "email") {
        user.set("email", normalize_email(&required_str(req, "email")?)?);
    }
    if has_key(req, "full_name") {
        user.set("full_name", required_str(req, "full_name")?);
    }
    if has_key(req, "phone") {
        user.set("phone", optional_str(req, "phone")?);
    }
    if has_key(req, "status") {
        let status = required_str(req, "status")?;
        one_of("status", &status, &["active", "inactive"])?;
        if id == me.id && status != "active" {
            return Err(ApiError::bad_params("you cannot deactivate your own account"));
        }
        user.set("status", status);
    }

    let mut profile = Patch::new();
    let profile_table = match role.as_str() {
        "student" => {
            if has_key(req, "student_code") {
                profile.set("student_code", required_str(req, "student_code")?);
            }
            if has_key(req, "class_id") {
                let class_id = optional_i64(req, "class_id")?;
                if let Some(c) = class_id {
                    ensure_ref(ctx.conn, "classes", c, "class_id")?;
                }
                profile.set("class_id", class_id);
            }
            if has_key(req, "major_id") {
                let major_id = optional_i64(req, "major_id")?;
                if let Some(m) = major_id {
                    ensure_ref(ctx.conn, "majors", m, "major_id")?;
                }
                profile.set("major_id", major_id);
            }
            if has_key(req, "date_of_birth") {
                profile.set("date_of_birth", optional_date(req, "date_of_birth")?);
            }
            if has_key(req, "gender") {
                let gender = optional_str(req, "gender")?;
                if let Some(g) = &gender {
                    one_of("gender", g, &["male", "female", "other"])?;
                }
                profile.set("gender", gender);
            }
            if has_key(req, "address") {
                profile.set("address", optional_str(req, "address")?);
            }
            if has_key(req, "enrollment_year") {
                profile.set("enrollment_year", optional_i64(req, "enrollment_year")?);
            }
            Some("students")
        }
        "teacher" => {
            if has_key(req, "teacher_code") {
                profile.set("teacher_code", required_str(req, "teacher_code")?);
            }
            for key in ["department", "degree", "specialization"] {
                if has_key(req, key) {
                    profile.set(key, optional_str(req, key)?);
                }
            }
            if has_key(req, "hire_date") {
                profile.set("hire_date", optional_date(req, "hire_date")?);
            }
            Some("teachers")
        }
        _ => None,
    };

    if user.is_empty() && profile.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    user.set("updated_at", now_timestamp());
    user.execute(&tx, "users", id).on_duplicate("email already in use")?;
    if let Some(table) = profile_table {
        if !profile.is_empty() {
            let profile_id: i64 = tx.query_row(
                &format!("SELECT id FROM {table} WHERE user_id = ?"),
                [id],
                |r| r.get(0),
            )?;
            profile
                .execute(&tx, table, profile_id)
                .on_duplicate("profile code already in use")?;
        }
    }
    tx.commit()?;

    let updated = load_user(ctx.conn, id)?.ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(ok("user updated", json!({ "user": updated })))
}

fn handle_users_delete(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let me = caller(req)?;
    let id = path_id(req)?;
    if id == me.id {
        return Err(ApiError::bad_params("you cannot delete your own account"));
    }
    let now = now_timestamp();
    let changed = ctx.conn.execute(
        "UPDATE users SET is_deleted = 1, deleted_at = ?, updated_at = ? WHERE id = ? AND is_deleted = 0",
        (&now, &now, id),
    )?;
    if changed == 0 {
        return Err(ApiError::not_found("user not found"));
    }
    tracing::info!(user_id = id, by = me.id, "user soft-deleted");
    Ok(ok("user deleted", json!({ "id": id })))
}

fn handle_users_restore(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    let changed = ctx.conn.execute(
        "UPDATE users SET is_deleted = 0, deleted_at = NULL, updated_at = ? WHERE id = ? AND is_deleted = 1",
        (now_timestamp(), id),
    )?;
    if changed == 0 {
        return Err(ApiError::not_found("deleted user not found"));
    }
    let user = load_user(ctx.conn, id)?.ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok(ok("user restored", json!({ "user": user })))
}

fn handle_users_password(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let id = path_id(req)?;
    let password = required_password(req, "new_password")?;
    check_password("new_password", &password)?;
    let hash = auth::hash_password(&password)?;
    let changed = ctx.conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ? AND is_deleted = 0",
        (&hash, now_timestamp(), id),
    )?;
    if changed == 0 {
        return Err(ApiError::not_found("user not found"));
    }
    Ok(ok("password reset", json!({ "id": id })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "users.list" => Some(handle_users_list(ctx, req)),
        "users.get" => Some(handle_users_get(ctx, req)),
        "users.create" => Some(handle_users_create(ctx, req)),
        "users.update" => Some(handle_users_update(ctx, req)),
        "users.delete" => Some(handle_users_delete(ctx, req)),
        "users.restore" => Some(handle_users_restore(ctx, req)),
        "users.password" => Some(handle_users_password(ctx, req)),
        _ => None,
    }
}
