use serde_json::json;

use super::users::load_user;
use crate::api::error::{ok, ApiError, Reply};
use crate::api::helpers::{caller, has_key, optional_str, student_for, Patch};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;

fn handle_profile(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let me = caller(req)?;
    student_for(ctx.conn, me.id)?;
    let user = load_user(ctx.conn, me.id)?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    Ok(ok("profile loaded", json!({ "profile": user })))
}

/// Students may only change their contact details.
fn handle_profile_update(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    let me = caller(req)?;
    let student = student_for(ctx.conn, me.id)?;

    let mut user = Patch::new();
    if has_key(req, "phone") {
        user.set("phone", optional_str(req, "phone")?);
    }
    let mut profile = Patch::new();
    if has_key(req, "address") {
        profile.set("address", optional_str(req, "address")?);
    }
    if user.is_empty() && profile.is_empty() {
        return Err(ApiError::bad_params("no fields to update"));
    }

    let tx = ctx.conn.unchecked_transaction()?;
    user.set("updated_at", now_timestamp());
    user.execute(&tx, "users", me.id)?;
    profile.execute(&tx, "students", student.id)?;
    tx.commit()?;

    let updated = load_user(ctx.conn, me.id)?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    Ok(ok("profile updated", json!({ "profile": updated })))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "student.profile" => Some(handle_profile(ctx, req)),
        "student.profile.update" => Some(handle_profile_update(ctx, req)),
        _ => None,
    }
}
