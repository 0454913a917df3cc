use crate::api::error::{ok, ApiError, Reply};
use crate::api::types::{Ctx, Request};
use crate::db::now_timestamp;
use serde_json::json;

fn handle_health(ctx: &Ctx<'_>, _req: &Request) -> Result<Reply, ApiError> {
    let one: i64 = ctx.conn.query_row("SELECT 1", [], |r| r.get(0))?;
    Ok(ok(
        "service is healthy",
        json!({
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if one == 1 { "ok" } else { "degraded" },
            "time": now_timestamp(),
        }),
    ))
}

pub fn try_handle(ctx: &Ctx<'_>, req: &Request) -> Option<Result<Reply, ApiError>> {
    match req.method {
        "health" => Some(handle_health(ctx, req)),
        _ => None,
    }
}
