use rusqlite::OptionalExtension;
use serde_json::json;

use super::users::{insert_user, load_user, StudentProfile};
use crate::api::error::{created, ok, ApiError, Reply};
use crate::api::helpers::{
    caller, check_password, has_key, normalize_email, optional_str, required_password, required_str,
    Patch,
};
use crate::api::types::{Ctx, Request};
use crate::auth::{self, Role};
use crate::db::now_timestamp;

const BAD_CREDENTIALS: &str = "invalid email or password";

fn token_reply(ctx: &Ctx<'_>, user_id: i64, email: &str, role: Role) -> Result<serde_json::Value, ApiError> {
    let (token, claims) = auth::issue_token(
        user_id,
        email,
        role,
        ctx.config.jwt_secret.as_bytes(),
        ctx.config.jwt_expires_in,
    )
    .map_err(|e| ApiError::internal(format!("failed to issue token: {e}")))?;
    let user = load_user(ctx.conn, user_id)?.ok_or_else(|| ApiError::unauthorized(BAD_CREDENTIALS))?;
    Ok(json!({
        "token": token,
        "token_type": "Bearer",
        "expires_at": claims.exp,
        "user": user,
    }))
}

fn handle_login(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let email = required_str(req, "email")?.to_ascii_lowercase();
    let password = required_password(req, "password")?;

    let row: Option<(i64, String, String, String)> = ctx
        .conn
        .query_row(
            "SELECT id, password_hash, role, status FROM users WHERE email = ? AND is_deleted = 0",
            [&email],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;

    // Unknown email and wrong password are indistinguishable to the caller.
    let Some((user_id, hash, role, status)) = row else {
        auth::verify_dummy_password(&password);
        return Err(ApiError::unauthorized(BAD_CREDENTIALS));
    };
    if !auth::verify_password(&password, &hash) {
        return Err(ApiError::unauthorized(BAD_CREDENTIALS));
    }
    if status != "active" {
        return Err(ApiError::forbidden("account is inactive"));
    }
    let role = Role::parse(&role).ok_or_else(|| ApiError::internal("stored role is invalid"))?;

    ctx.conn.execute(
        "UPDATE users SET last_login_at = ? WHERE id = ?",
        (now_timestamp(), user_id),
    )?;
    tracing::info!(user_id, role = role.as_str(), "login");
    Ok(ok("login successful", token_reply(ctx, user_id, &email, role)?))
}

fn handle_register(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let email = normalize_email(&required_str(req, "email")?)?;
    let password = required_password(req, "password")?;
    check_password("password", &password)?;
    let full_name = required_str(req, "full_name")?;
    let phone = optional_str(req, "phone")?;
    let profile = StudentProfile::from_request(req)?;

    let tx = ctx.conn.unchecked_transaction()?;
    let user_id = insert_user(
        &tx,
        &email,
        &password,
        &full_name,
        Role::Student,
        phone.as_deref(),
        "active",
    )?;
    profile.insert(&tx, user_id)?;
    tx.commit()?;

    tracing::info!(user_id, "student self-registered");
    Ok(created(
        "registration successful",
        token_reply(ctx, user_id, &email, Role::Student)?,
    ))
}

fn handle_me(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let me = caller(req)?;
    let user = load_user(ctx.conn, me.id)?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    Ok(ok("profile loaded", json!({ "user": user })))
}

fn handle_me_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let me = caller(req)?;
    let mut patch = Patch::new();
    if has_key(req, "full_name") {
        patch.set("full_name", required_str(req, "full_name")?);
    }
    if has_key(req, "phone") {
        patch.set("phone", optional_str(req, "phone")?);
    }
    if patch.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }
    if load_user(ctx.conn, me.id)?.is_none() {
        return Err(ApiError::unauthorized("account no longer exists"));
    }
    patch.set("updated_at", now_timestamp());
    patch.execute(ctx.conn, "users", me.id)?;
    let user = load_user(ctx.conn, me.id)?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    Ok(ok("profile updated", json!({ "user": user })))
}

fn handle_password(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let me = caller(req)?;
    let current = required_password(req, "current_password")?;
    let new_password = required_password(req, "new_password")?;
    check_password("new_password", &new_password)?;

    let hash: Option<String> = ctx
        .conn
        .query_row(
            "SELECT password_hash FROM users WHERE id = ? AND is_deleted = 0",
            [me.id],
            |r| r.get(0),
        )
        .optional()?;
    let hash = hash.ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    if !auth::verify_password(&current, &hash) {
        return Err(ApiError::bad_params("current password is incorrect"));
    }

    let new_hash = auth::hash_password(&new_password)?;
    ctx.conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        (&new_hash, now_timestamp(), me.id),
    )?;
    Ok(ok("password changed", json!({ "id": me.id })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "auth.login" => Some(handle_login(ctx, req)),
        "auth.register" => Some(handle_register(ctx, req)),
        "auth.me" => Some(handle_me(ctx, req)),
        "auth.me.update" => Some(handle_me_update(ctx, req)),
        "auth.password" => Some(handle_password(ctx, req)),
        _ => None,
    }
}
