pub mod api;
pub mod auth;
pub mod calc;
pub mod config;
pub mod db;
pub mod pool;
pub mod seed;

pub use api::{build_router, AppState};
pub use config::Config;
