mod error;
mod handlers;
mod helpers;
mod middleware;
mod router;
mod types;

pub use error::{ApiError, ApiErrorCode, Reply};
pub use router::{authorize, build_router, Access};
pub use types::{AppState, Ctx, Request};
