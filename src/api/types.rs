use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRequest, FromRequestParts, Path, Query};
use rusqlite::Connection;

use super::error::ApiError;
use crate::auth::Claims;
use crate::config::Config;
use crate::pool::Pool;

#[derive(Clone)]
pub struct AppState {
    pub pool: Pool,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let pool = Pool::new(
            config.database_path.clone(),
            config.db_pool_size,
            config.db_acquire_timeout,
        );
        Self {
            pool,
            config: Arc::new(config),
        }
    }
}

/// What a handler sees while it holds a pooled connection.
pub struct Ctx<'a> {
    pub conn: &'a Connection,
    pub config: &'a Config,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: String,
    pub method: &'static str,
    pub caller: Option<Claims>,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Why a presented bearer token was not accepted.
#[derive(Debug, Clone, Copy)]
pub struct TokenRejection(pub &'static str);

/// Body, query string and path parameters merged into one JSON object.
/// Path parameters win over query parameters, which only fill keys the
/// body did not set.
pub struct Payload {
    pub request_id: String,
    pub caller: Option<Claims>,
    pub rejection: Option<TokenRejection>,
    pub params: serde_json::Value,
}

#[axum::async_trait]
impl FromRequest<AppState> for Payload {
    type Rejection = ApiError;

    async fn from_request(
        req: axum::extract::Request,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let (mut parts, body) = req.into_parts();

        let path = Path::<HashMap<String, String>>::from_request_parts(&mut parts, state)
            .await
            .map(|Path(p)| p)
            .unwrap_or_default();
        let query = Query::<HashMap<String, String>>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .map_err(|e| ApiError::bad_params(format!("invalid query string: {e}")))?;
        let caller = parts.extensions.get::<Claims>().cloned();
        let rejection = parts.extensions.get::<TokenRejection>().copied();
        let request_id = parts
            .extensions
            .get::<RequestId>()
            .map(|r| r.0.clone())
            .unwrap_or_default();

        let bytes = axum::body::to_bytes(body, state.config.max_body_bytes)
            .await
            .map_err(|_| ApiError::bad_params("request body is too large or unreadable"))?;

        let mut params = if bytes.iter().all(u8::is_ascii_whitespace) {
            serde_json::Map::new()
        } else {
            match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(serde_json::Value::Object(map)) => map,
                Ok(_) => return Err(ApiError::bad_params("request body must be a JSON object")),
                Err(e) => return Err(ApiError::bad_params(format!("invalid JSON body: {e}"))),
            }
        };
        for (k, v) in query {
            params.entry(k).or_insert(serde_json::Value::String(v));
        }
        for (k, v) in path {
            params.insert(k, serde_json::Value::String(v));
        }

        Ok(Payload {
            request_id,
            caller,
            rejection,
            params: serde_json::Value::Object(params),
        })
    }
}
