use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, Instrument};
use uuid::Uuid;

use super::types::{AppState, RequestId, TokenRejection};
use crate::auth;

const MAX_REQUEST_ID_LEN: usize = 128;

pub(crate) async fn request_tracing_middleware(mut request: Request<Body>, next: Next) -> Response {
    let request_id = incoming_request_id(request.headers())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    request
        .extensions_mut()
        .insert(RequestId(request_id.clone()));

    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        method = %request.method(),
        route = %request.uri().path(),
    );

    let mut response = next.run(request).instrument(span.clone()).await;
    span.in_scope(|| debug!(status = response.status().as_u16(), "request finished"));
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

fn incoming_request_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get("x-request-id")?.to_str().ok()?.trim();
    let ok = !raw.is_empty()
        && raw.len() <= MAX_REQUEST_ID_LEN
        && raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    ok.then(|| raw.to_string())
}

pub(crate) async fn cors_middleware(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|o| state.config.cors_origins.iter().any(|x| x == o));

    if req.method() == Method::OPTIONS {
        let mut resp = StatusCode::NO_CONTENT.into_response();
        if let Some(origin_value) = origin {
            allow_origin(resp.headers_mut(), &origin_value);
            resp.headers_mut().insert(
                "access-control-allow-methods",
                HeaderValue::from_static("GET,POST,PUT,DELETE,OPTIONS"),
            );
            resp.headers_mut().insert(
                "access-control-allow-headers",
                HeaderValue::from_static("authorization,content-type,x-request-id"),
            );
            resp.headers_mut()
                .insert("access-control-max-age", HeaderValue::from_static("600"));
        }
        return resp;
    }

    let mut resp = next.run(req).await;
    if let Some(origin_value) = origin {
        allow_origin(resp.headers_mut(), &origin_value);
        resp.headers_mut().insert(
            "access-control-expose-headers",
            HeaderValue::from_static("x-request-id,content-disposition"),
        );
    }
    resp
}

fn allow_origin(headers: &mut HeaderMap, origin: &str) {
    if let Ok(v) = HeaderValue::from_str(origin) {
        headers.insert("access-control-allow-origin", v);
        headers.insert("access-control-allow-credentials", HeaderValue::from_static("true"));
        headers.insert(header::VARY, HeaderValue::from_static("origin"));
    }
}

/// Verifies a bearer token when one is sent and attaches its claims.
/// A missing or unusable token never fails the request here: the route
/// decides, and public routes ignore a stale token.
pub(crate) async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let Some(raw) = req.headers().get(header::AUTHORIZATION) else {
        return next.run(req).await;
    };
    let token = raw
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string);

    let outcome = match token {
        None => Err(TokenRejection("authorization header must be a bearer token")),
        Some(token) => auth::verify_token(&token, state.config.jwt_secret.as_bytes()).map_err(|e| {
            debug!(code = ?e.code, "rejected bearer token");
            TokenRejection(match e.code {
                auth::TokenErrorCode::Expired => "token expired",
                _ => "invalid token",
            })
        }),
    };
    match outcome {
        Ok(claims) => {
            req.extensions_mut().insert(claims);
        }
        Err(rejection) => {
            req.extensions_mut().insert(rejection);
        }
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incoming_request_ids_are_sanitized() {
        let mut h = HeaderMap::new();
        assert_eq!(incoming_request_id(&h), None);
        h.insert("x-request-id", HeaderValue::from_static("abc-123_x.y"));
        assert_eq!(incoming_request_id(&h).as_deref(), Some("abc-123_x.y"));
        h.insert("x-request-id", HeaderValue::from_static("has space"));
        assert_eq!(incoming_request_id(&h), None);
    }
}
