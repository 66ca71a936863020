//! Metadata database connection pool and migration management.
//!
//! Pools for the *target* databases that procedures run against are managed
//! separately by [`crate::services::pool_registry`].

use sqlx::{Pool, Postgres};

/// Type alias for PostgreSQL connection pool.
pub type DbPool = Pool<Postgres>;

/// Create the metadata store connection pool.
///
/// # Errors
///
/// Returns an error if the connection string is invalid or the server cannot be
/// reached.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
}

/// Run migrations from the `migrations/` directory.
///
/// Applied migrations are tracked in `_sqlx_migrations`, so each runs once.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
