use karigo_common::{AppError, DatabaseConfig};
use sqlx::{migrate::MigrateDatabase, postgres::PgPoolOptions, Pool, Postgres};

pub type DbPool = Pool<Postgres>;

pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool, AppError> {
    let connection_string = config.connection_string();

    if !Postgres::database_exists(&connection_string).await.unwrap_or(false) {
        tracing::info!(database = %config.database, "Creating database");
        Postgres::create_database(&connection_string).await?;
    }

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&connection_string)
        .await?;

    sqlx::query("SELECT 1").execute(&pool).await?;

    tracing::info!(database = %config.database, "Database connection established");
    Ok(pool)
}

pub async fn run_migrations(pool: &DbPool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| AppError::Database(e.into()))?;

    tracing::info!("Database migrations completed");
    Ok(())
}

pub async fn health_check(pool: &DbPool) -> Result<(), AppError> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}
