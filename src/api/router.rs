use axum::extract::{DefaultBodyLimit, State};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{on, MethodFilter, MethodRouter};
use axum::Router;
use tracing::{debug, error};

use super::error::{ApiError, Reply};
use super::handlers;
use super::middleware::{auth_middleware, cors_middleware, request_tracing_middleware};
use super::types::{AppState, Ctx, Payload, Request, TokenRejection};
use crate::auth::{Claims, Role};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
    Admin,
    Staff,
    Teacher,
    Student,
}

pub fn authorize(
    access: Access,
    caller: Option<&Claims>,
    rejection: Option<TokenRejection>,
) -> Result<(), ApiError> {
    if access == Access::Public {
        return Ok(());
    }
    let Some(claims) = caller else {
        let message = rejection.map_or("authentication required", |r| r.0);
        return Err(ApiError::unauthorized(message));
    };
    let allowed = match access {
        Access::Public | Access::Authenticated => true,
        Access::Admin => claims.role == Role::Admin,
        Access::Staff => matches!(claims.role, Role::Admin | Role::Teacher),
        Access::Teacher => claims.role == Role::Teacher,
        Access::Student => claims.role == Role::Student,
    };
    if allowed {
        Ok(())
    } else {
        Err(ApiError::forbidden("you do not have permission to perform this action"))
    }
}

async fn dispatch(
    state: AppState,
    access: Access,
    method: &'static str,
    payload: Payload,
) -> Result<Reply, ApiError> {
    authorize(access, payload.caller.as_ref(), payload.rejection)?;
    let req = Request {
        id: payload.request_id,
        method,
        caller: payload.caller,
        params: payload.params,
    };
    let config = state.config.clone();
    let result = state
        .pool
        .run(move |conn| {
            let ctx = Ctx {
                conn,
                config: &config,
            };
            handlers::handle_request(&ctx, &req)
        })
        .await;

    if let Err(e) = &result {
        if e.status().is_server_error() {
            error!(method, code = e.code.as_str(), cause = ?e.cause, details = ?e.details, "{}", e.message);
        } else {
            debug!(method, code = e.code.as_str(), "{}", e.message);
        }
    }
    result
}

fn op(filter: MethodFilter, access: Access, method: &'static str) -> MethodRouter<AppState> {
    on(filter, move |State(state): State<AppState>, payload: Payload| {
        dispatch(state, access, method, payload)
    })
}

fn get(access: Access, method: &'static str) -> MethodRouter<AppState> {
    op(MethodFilter::GET, access, method)
}

fn post(access: Access, method: &'static str) -> MethodRouter<AppState> {
    op(MethodFilter::POST, access, method)
}

fn put(access: Access, method: &'static str) -> MethodRouter<AppState> {
    op(MethodFilter::PUT, access, method)
}

fn delete(access: Access, method: &'static str) -> MethodRouter<AppState> {
    op(MethodFilter::DELETE, access, method)
}

async fn route_not_found() -> ApiError {
    ApiError::not_found("route not found")
}

pub fn build_router(state: AppState) -> Router {
    use Access::*;

    let max_body = state.config.max_body_bytes;
    Router::new()
        .route("/api/health", get(Public, "health"))
        // auth
        .route("/api/auth/login", post(Public, "auth.login"))
        .route("/api/auth/register", post(Public, "auth.register"))
        .route(
            "/api/auth/me",
            get(Authenticated, "auth.me").merge(put(Authenticated, "auth.me.update")),
        )
        .route("/api/auth/password", put(Authenticated, "auth.password"))
        // catalog
        .route(
            "/api/majors",
            get(Authenticated, "majors.list").merge(post(Admin, "majors.create")),
        )
        .route(
            "/api/majors/:id",
            get(Authenticated, "majors.get")
                .merge(put(Admin, "majors.update"))
                .merge(delete(Admin, "majors.delete")),
        )
        .route(
            "/api/classes",
            get(Authenticated, "classes.list").merge(post(Admin, "classes.create")),
        )
        .route(
            "/api/classes/:id",
            get(Authenticated, "classes.get")
                .merge(put(Admin, "classes.update"))
                .merge(delete(Admin, "classes.delete")),
        )
        .route("/api/classes/:id/students", get(Staff, "classes.students"))
        .route(
            "/api/subjects",
            get(Authenticated, "subjects.list").merge(post(Admin, "subjects.create")),
        )
        .route(
            "/api/subjects/:id",
            get(Authenticated, "subjects.get")
                .merge(put(Admin, "subjects.update"))
                .merge(delete(Admin, "subjects.delete")),
        )
        .route(
            "/api/semesters",
            get(Authenticated, "semesters.list").merge(post(Admin, "semesters.create")),
        )
        .route("/api/semesters/active", get(Authenticated, "semesters.active"))
        .route(
            "/api/semesters/:id",
            get(Authenticated, "semesters.get")
                .merge(put(Admin, "semesters.update"))
                .merge(delete(Admin, "semesters.delete")),
        )
        .route("/api/semesters/:id/activate", put(Admin, "semesters.activate"))
        // admin
        .route(
            "/api/admin/users",
            get(Admin, "users.list").merge(post(Admin, "users.create")),
        )
        .route(
            "/api/admin/users/:id",
            get(Admin, "users.get")
                .merge(put(Admin, "users.update"))
                .merge(delete(Admin, "users.delete")),
        )
        .route("/api/admin/users/:id/restore", put(Admin, "users.restore"))
        .route("/api/admin/users/:id/password", put(Admin, "users.password"))
        .route("/api/admin/stats", get(Admin, "admin.stats"))
        .route(
            "/api/admin/enrollments",
            get(Admin, "enrollments.list").merge(post(Admin, "enrollments.create")),
        )
        .route(
            "/api/admin/enrollments/:id",
            put(Admin, "enrollments.update").merge(delete(Admin, "enrollments.delete")),
        )
        .route(
            "/api/admin/schedules",
            get(Admin, "schedules.list").merge(post(Admin, "schedules.create")),
        )
        .route(
            "/api/admin/schedules/:id",
            put(Admin, "schedules.update").merge(delete(Admin, "schedules.delete")),
        )
        // teacher
        .route("/api/teacher/subjects", get(Teacher, "teacher.subjects"))
        .route("/api/teacher/classes", get(Teacher, "teacher.classes"))
        .route("/api/teacher/schedule", get(Teacher, "teacher.schedule"))
        .route(
            "/api/teacher/grades",
            get(Teacher, "teacher.grades.list").merge(post(Teacher, "teacher.grades.upsert")),
        )
        .route("/api/teacher/grades/bulk", post(Teacher, "teacher.grades.bulk"))
        .route("/api/teacher/grades/:id", put(Teacher, "teacher.grades.update"))
        .route("/api/teacher/reports/grades", get(Teacher, "reports.grades"))
        .route(
            "/api/teacher/notifications",
            get(Teacher, "teacher.notifications.list")
                .merge(post(Teacher, "teacher.notifications.create")),
        )
        .route(
            "/api/teacher/notifications/:id",
            put(Teacher, "teacher.notifications.update")
                .merge(delete(Teacher, "teacher.notifications.delete")),
        )
        .route("/api/teacher/grade-reviews", get(Teacher, "teacher.reviews.list"))
        .route(
            "/api/teacher/grade-reviews/:id",
            put(Teacher, "teacher.reviews.respond"),
        )
        // student
        .route(
            "/api/student/profile",
            get(Student, "student.profile").merge(put(Student, "student.profile.update")),
        )
        .route(
            "/api/student/enrollments",
            get(Student, "student.enrollments.list")
                .merge(post(Student, "student.enrollments.create")),
        )
        .route(
            "/api/student/enrollments/:id",
            delete(Student, "student.enrollments.drop"),
        )
        .route("/api/student/schedule", get(Student, "student.schedule"))
        .route("/api/student/grades", get(Student, "student.grades"))
        .route("/api/student/gpa", get(Student, "student.gpa"))
        .route(
            "/api/student/notifications",
            get(Student, "student.notifications"),
        )
        .route(
            "/api/student/grade-reviews",
            get(Student, "student.reviews.list").merge(post(Student, "student.reviews.create")),
        )
        .fallback(route_not_found)
        .layer(DefaultBodyLimit::max(max_body))
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(from_fn_with_state(state.clone(), cors_middleware))
        .layer(from_fn(request_tracing_middleware))
        .with_state(state)
}
