use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sims::{build_router, db, seed, AppState, Config};

fn init_tracing(log_json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {}
                    _ = sigint.recv() => {}
                }
            }
            _ => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Schema and bootstrap rows, on a connection of its own before serving.
fn prepare_database(config: &Config) -> anyhow::Result<()> {
    let conn = db::open_connection(&config.database_path)
        .with_context(|| format!("failed to open {}", config.database_path.display()))?;
    if config.auto_migrate {
        db::migrate(&conn).context("schema migration failed")?;
        info!(path = %config.database_path.display(), "database migrated");
    }
    seed::ensure_admin(&conn, &config.seed_admin_email, &config.seed_admin_password)
        .context("failed to create bootstrap admin")?;
    if config.seed_on_start {
        seed::seed_demo(&conn).context("failed to seed demo data")?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;
    init_tracing(config.log_json);

    if config.uses_dev_secret() {
        warn!("JWT_SECRET is not set; using the development secret");
    }

    let blocking_config = config.clone();
    tokio::task::spawn_blocking(move || prepare_database(&blocking_config))
        .await
        .context("database setup task failed")??;

    let bind_addr = config.bind_addr();
    let state = AppState::new(config);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %bind_addr, version = env!("CARGO_PKG_VERSION"), "sims listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown_signal())
        .await
        .context("server failed")?;
    info!("shutdown complete");
    Ok(())
}
