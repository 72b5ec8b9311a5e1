// Main entry point for API server

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use extraction::{FetcherConfig, HttpFetcher, UrlValidator};
use server_core::kernel::ServerDeps;
use server_core::server::{build_app, AppState};
use server_core::{Config, StorageBackend};
use sqlx::postgres::PgPoolOptions;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,server_core=debug,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Page Analyser API");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    tracing::info!(backend = ?config.storage_backend, "Configuration loaded");

    let fetcher = HttpFetcher::new(
        FetcherConfig {
            timeout: config.fetch_timeout,
            resolve_redirects: config.dns_check,
            ..FetcherConfig::default()
        },
        UrlValidator::new(),
    )
    .context("Failed to build HTTP fetcher")?;
    let fetcher = Arc::new(fetcher);

    let (deps, pool) = match config.storage_backend {
        StorageBackend::Postgres => {
            let database_url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required for the postgres backend")?;

            // Connect to database
            tracing::info!("Connecting to database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(database_url)
                .await
                .context("Failed to connect to database")?;
            tracing::info!("Database connected");

            // Run migrations
            tracing::info!("Running database migrations...");
            sqlx::migrate!("./migrations")
                .run(&pool)
                .await
                .context("Failed to run migrations")?;
            tracing::info!("Migrations complete");

            (ServerDeps::postgres(pool.clone(), fetcher, &config), Some(pool))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory storage; jobs will not survive a restart");
            (ServerDeps::in_memory(fetcher, &config), None)
        }
    };

    let shutdown = CancellationToken::new();

    // Background services
    let worker = deps.worker(&config);
    let worker_task = tokio::spawn(worker.run(shutdown.clone()));
    let sweeper = deps.sweeper.clone();
    let sweeper_shutdown = shutdown.clone();
    let sweeper_task = tokio::spawn(async move { sweeper.run(sweeper_shutdown).await });

    // Build application
    let app = build_app(AppState::from(&deps), &config.allowed_origins);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("Starting server on {}", addr);
    tracing::info!("Health check: http://localhost:{}/health", config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    let signal_token = shutdown.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                signal_token.cancel();
            })
            .await
    });

    // Wait for a shutdown signal, or for the server to stop on its own
    let served = tokio::select! {
        joined = &mut server => Some(joined),
        _ = shutdown.cancelled() => None,
    };
    shutdown.cancel();

    // One grace period, counted from the signal, covers open connections and
    // background work together
    let deadline = Instant::now() + config.shutdown_grace;
    let served = drain_until(
        deadline,
        async move {
            match served {
                Some(joined) => joined,
                None => server.await,
            }
        },
        vec![("queue worker", worker_task), ("cleanup sweeper", sweeper_task)],
    )
    .await;
    if served.is_none() {
        tracing::warn!(
            grace_secs = config.shutdown_grace.as_secs(),
            "Shutdown did not finish within the grace period"
        );
    }

    if let Some(pool) = pool {
        pool.close().await;
    }
    if let Some(served) = served {
        served.context("Server task failed")?.context("Server error")?;
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

/// Wait for the server and the background tasks, all under one deadline.
/// `None` when the deadline passed first.
async fn drain_until<T>(
    deadline: Instant,
    server: impl Future<Output = T>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
) -> Option<T> {
    tokio::time::timeout_at(deadline, async {
        let served = server.await;
        for (name, task) in tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, task = name, "Background task failed");
            }
        }
        served
    })
    .await
    .ok()
}

/// Completes on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!(signal = "SIGINT", "shutdown signal"),
        _ = terminate => tracing::info!(signal = "SIGTERM", "shutdown signal"),
    }
}
