use anyhow::{anyhow, Context};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const DEV_JWT_SECRET: &str = "sims-development-secret-change-me";

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: PathBuf,
    pub db_pool_size: usize,
    pub db_acquire_timeout: Duration,
    pub jwt_secret: String,
    pub jwt_expires_in: Duration,
    pub cors_origins: Vec<String>,
    pub auto_migrate: bool,
    pub seed_on_start: bool,
    pub seed_admin_email: String,
    pub seed_admin_password: String,
    pub max_body_bytes: usize,
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            database_path: PathBuf::from("data/sims.sqlite3"),
            db_pool_size: 10,
            db_acquire_timeout: Duration::from_millis(10_000),
            jwt_secret: DEV_JWT_SECRET.to_string(),
            jwt_expires_in: Duration::from_secs(24 * 3600),
            cors_origins: vec!["http://localhost:3000".to_string()],
            auto_migrate: true,
            seed_on_start: false,
            seed_admin_email: "admin@sims.local".to_string(),
            seed_admin_password: "admin123".to_string(),
            max_body_bytes: 1024 * 1024,
            log_json: false,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let d = Config::default();
        let cfg = Config {
            host: env::var("HOST").unwrap_or(d.host),
            port: env_parse("PORT", d.port)?,
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or(d.database_path),
            db_pool_size: env_parse("DB_POOL_SIZE", d.db_pool_size)?,
            db_acquire_timeout: Duration::from_millis(env_parse(
                "DB_ACQUIRE_TIMEOUT_MS",
                d.db_acquire_timeout.as_millis() as u64,
            )?),
            jwt_secret: env::var("JWT_SECRET").unwrap_or(d.jwt_secret),
            jwt_expires_in: match env::var("JWT_EXPIRES_IN") {
                Ok(raw) => parse_duration(&raw).context("invalid JWT_EXPIRES_IN")?,
                Err(_) => d.jwt_expires_in,
            },
            cors_origins: match env::var("CORS_ORIGIN") {
                Ok(raw) => split_list(&raw),
                Err(_) => d.cors_origins,
            },
            auto_migrate: env_bool("AUTO_MIGRATE", d.auto_migrate)?,
            seed_on_start: env_bool("SEED_ON_START", d.seed_on_start)?,
            seed_admin_email: env::var("SEED_ADMIN_EMAIL").unwrap_or(d.seed_admin_email),
            seed_admin_password: env::var("SEED_ADMIN_PASSWORD").unwrap_or(d.seed_admin_password),
            max_body_bytes: env_parse("MAX_BODY_BYTES", d.max_body_bytes)?,
            log_json: env_bool("LOG_JSON", d.log_json)?,
        };
        if cfg.db_pool_size == 0 {
            return Err(anyhow!("DB_POOL_SIZE must be at least 1"));
        }
        if cfg.jwt_secret.is_empty() {
            return Err(anyhow!("JWT_SECRET must not be empty"));
        }
        Ok(cfg)
    }

    /// Defaults pointed at a specific database file.
    pub fn for_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Config::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("invalid {name}={raw:?}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> anyhow::Result<bool> {
    match env::var(name) {
        Ok(raw) => parse_bool(&raw).ok_or_else(|| anyhow!("invalid {name}={raw:?}: expected a boolean")),
        Err(_) => Ok(default),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses `90`, `90s`, `15m`, `24h`, `7d`. A bare number is seconds.
const MAX_DURATION_SECS: u64 = 10 * 366 * 86_400;

pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(anyhow!("empty duration"));
    }
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let n: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration number in {s:?}"))?;
    let scale: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => return Err(anyhow!("unknown duration unit {other:?} in {s:?}")),
    };
    let secs = n
        .checked_mul(scale)
        .filter(|secs| *secs <= MAX_DURATION_SECS)
        .ok_or_else(|| anyhow!("duration {s:?} exceeds 10 years"))?;
    if secs == 0 {
        return Err(anyhow!("duration must be positive"));
    }
    Ok(Duration::from_secs(secs))
}
