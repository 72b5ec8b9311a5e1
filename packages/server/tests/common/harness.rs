//! Test harness with testcontainers for PostgreSQL integration testing.
//!
//! One Postgres container is shared across all tests. Each harness gets its
//! own freshly migrated database inside it, so tests that claim work from
//! the queue never see each other's items.

use std::sync::Arc;

use anyhow::{Context, Result};
use extraction::MockFetcher;
use server_core::kernel::ServerDeps;
use sqlx::PgPool;
use test_context::AsyncTestContext;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

use super::{test_config, ApiClient};

/// Shared test infrastructure that persists across all tests.
struct SharedTestInfra {
    admin_url: String,
    host: String,
    port: u16,
    // Keep the container alive for the entire test run
    _postgres: ContainerAsync<Postgres>,
}

/// Global shared infrastructure - initialized once, reused by all tests.
static SHARED_INFRA: OnceCell<SharedTestInfra> = OnceCell::const_new();

impl SharedTestInfra {
    async fn init() -> Result<Self> {
        // Run tests with: RUST_LOG=debug cargo test -- --ignored --nocapture
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = Postgres::default()
            .with_tag("16")
            .with_cmd(["-c", "max_connections=200"])
            .start()
            .await
            .context("Failed to start Postgres container")?;

        let host = postgres.get_host().await?.to_string();
        let port = postgres.get_host_port_ipv4(5432).await?;
        let admin_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        Ok(Self {
            admin_url,
            host,
            port,
            _postgres: postgres,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async {
                Self::init()
                    .await
                    .expect("Failed to initialize shared test infrastructure")
            })
            .await
    }

    /// Create and migrate a database for one test.
    async fn fresh_database(&self) -> Result<PgPool> {
        let name = format!("test_{}", Uuid::new_v4().simple());
        let admin = PgPool::connect(&self.admin_url)
            .await
            .context("Failed to connect to Postgres")?;
        sqlx::query(&format!("CREATE DATABASE {name}"))
            .execute(&admin)
            .await
            .context("Failed to create test database")?;
        admin.close().await;

        let url = format!(
            "postgresql://postgres:postgres@{}:{}/{name}",
            self.host, self.port
        );
        let pool = PgPool::connect(&url)
            .await
            .context("Failed to connect to test database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;
        Ok(pool)
    }
}

/// Test harness backed by a private PostgreSQL database.
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// #[ignore = "requires docker"]
/// async fn my_test(ctx: &mut TestHarness) {
///     let (deps, api) = ctx.app(MockFetcher::new());
///     // ... test code
/// }
/// ```
pub struct TestHarness {
    pub db_pool: PgPool,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        self.db_pool.close().await;
    }
}

impl TestHarness {
    pub async fn new() -> Result<Self> {
        let infra = SharedTestInfra::get().await;
        let db_pool = infra.fresh_database().await?;
        Ok(Self { db_pool })
    }

    /// Postgres-backed dependencies and an API client over them.
    pub fn app(&self, fetcher: MockFetcher) -> (ServerDeps, ApiClient) {
        let deps = ServerDeps::postgres(self.db_pool.clone(), Arc::new(fetcher), &test_config());
        let api = ApiClient::new(&deps);
        (deps, api)
    }
}
