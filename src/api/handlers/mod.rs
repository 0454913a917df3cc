use super::error::{ApiError, Reply};
use super::types::{Ctx, Request};

pub mod auth;
pub mod catalog;
pub mod classes;
pub mod core;
pub mod enrollments;
pub mod grades;
pub mod notifications;
pub mod reports;
pub mod reviews;
pub mod schedules;
pub mod semesters;
pub mod students;
pub mod teachers;
pub mod users;

type Family = fn(&Ctx<'_>, &Request) -> Option<Result<Reply, ApiError>>;

const FAMILIES: &[Family] = &[
    self::core::try_handle,
    auth::try_handle,
    catalog::try_handle,
    classes::try_handle,
    semesters::try_handle,
    users::try_handle,
    enrollments::try_handle,
    schedules::try_handle,
    grades::try_handle,
    reports::try_handle,
    notifications::try_handle,
    reviews::try_handle,
    teachers::try_handle,
    students::try_handle,
];

pub fn handle_request(ctx: &Ctx<'_>, req: &Request) -> Result<Reply, ApiError> {
    for family in FAMILIES {
        if let Some(resp) = family(ctx, req) {
            return resp;
        }
    }
    Err(ApiError::internal(format!("unknown method: {}", req.method)))
}
