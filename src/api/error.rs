use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use rusqlite::ErrorCode;
use serde_json::json;

use crate::pool::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorCode {
    BadParams,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    DbError,
    Internal,
}

impl ApiErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ApiErrorCode::BadParams => "bad_params",
            ApiErrorCode::Unauthorized => "unauthorized",
            ApiErrorCode::Forbidden => "forbidden",
            ApiErrorCode::NotFound => "not_found",
            ApiErrorCode::Conflict => "conflict",
            ApiErrorCode::DbError => "db_error",
            ApiErrorCode::Internal => "internal",
        }
    }

    pub fn status(self) -> StatusCode {
        match self {
            ApiErrorCode::BadParams => StatusCode::BAD_REQUEST,
            ApiErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiErrorCode::Forbidden => StatusCode::FORBIDDEN,
            ApiErrorCode::NotFound => StatusCode::NOT_FOUND,
            ApiErrorCode::Conflict => StatusCode::CONFLICT,
            ApiErrorCode::DbError | ApiErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApiError {
    pub code: ApiErrorCode,
    pub message: String,
    pub details: Option<serde_json::Value>,
    /// Server-side cause; logged, never sent to the client.
    pub cause: Option<String>,
}

impl ApiError {
    pub fn new(code: ApiErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            cause: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn bad_params(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::BadParams, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Conflict, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ApiErrorCode::Internal, message)
    }

    pub fn status(&self) -> StatusCode {
        self.code.status()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ApiError {}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({ "code": self.code.as_str() });
        if let Some(d) = self.details {
            error["details"] = d;
        }
        let body = json!({
            "success": false,
            "message": self.message,
            "error": error,
        });
        (self.code.status(), Json(body)).into_response()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Constraint {
    Unique,
    ForeignKey,
    Check,
    NotNull,
}

pub fn constraint_kind(e: &rusqlite::Error) -> Option<Constraint> {
    let rusqlite::Error::SqliteFailure(failure, _) = e else {
        return None;
    };
    if failure.code != ErrorCode::ConstraintViolation {
        return None;
    }
    Some(match failure.extended_code {
        rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
            Constraint::Unique
        }
        rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Constraint::ForeignKey,
        rusqlite::ffi::SQLITE_CONSTRAINT_NOTNULL => Constraint::NotNull,
        _ => Constraint::Check,
    })
}

impl From<rusqlite::Error> for ApiError {
    fn from(e: rusqlite::Error) -> Self {
        match constraint_kind(&e) {
            Some(Constraint::Unique) => ApiError::conflict("record already exists"),
            Some(Constraint::ForeignKey) => {
                ApiError::conflict("operation violates a reference between records")
            }
            Some(Constraint::Check) | Some(Constraint::NotNull) => {
                ApiError::bad_params("value is missing or out of the allowed range")
            }
            None => ApiError::new(ApiErrorCode::DbError, "database error").with_cause(e.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        ApiError::new(ApiErrorCode::DbError, "database unavailable").with_cause(e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::internal("unexpected server error").with_cause(format!("{e:#}"))
    }
}

/// Translates constraint violations of a write into user-facing messages.
pub trait DbResultExt<T> {
    /// Duplicate key -> 409 with `message`; missing referenced row -> 400.
    fn on_duplicate(self, message: &str) -> Result<T, ApiError>;
    /// Row still referenced elsewhere -> 409 with `message`.
    fn on_in_use(self, message: &str) -> Result<T, ApiError>;
}

impl<T> DbResultExt<T> for Result<T, rusqlite::Error> {
    fn on_duplicate(self, message: &str) -> Result<T, ApiError> {
        self.map_err(|e| match constraint_kind(&e) {
            Some(Constraint::Unique) => ApiError::conflict(message),
            Some(Constraint::ForeignKey) => {
                ApiError::bad_params("a referenced record does not exist")
            }
            _ => ApiError::from(e),
        })
    }

    fn on_in_use(self, message: &str) -> Result<T, ApiError> {
        self.map_err(|e| match constraint_kind(&e) {
            Some(Constraint::ForeignKey) => ApiError::conflict(message),
            _ => ApiError::from(e),
        })
    }
}

pub enum Reply {
    Json {
        status: StatusCode,
        message: String,
        data: serde_json::Value,
    },
    Csv {
        filename: String,
        content: String,
    },
}

pub fn ok(message: impl Into<String>, data: serde_json::Value) -> Reply {
    Reply::Json {
        status: StatusCode::OK,
        message: message.into(),
        data,
    }
}

pub fn created(message: impl Into<String>, data: serde_json::Value) -> Reply {
    Reply::Json {
        status: StatusCode::CREATED,
        message: message.into(),
        data,
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        match self {
            Reply::Json {
                status,
                message,
                data,
            } => (
                status,
                Json(json!({
                    "success": true,
                    "message": message,
                    "data": data,
                })),
            )
                .into_response(),
            Reply::Csv { filename, content } => {
                let mut resp = (StatusCode::OK, content).into_response();
                resp.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("text/csv; charset=utf-8"),
                );
                if let Ok(v) =
                    HeaderValue::from_str(&format!("attachment; filename=\"{}\"", filename))
                {
                    resp.headers_mut().insert(header::CONTENT_DISPOSITION, v);
                }
                resp
            }
        }
    }
}
