use karigo_common::AppError;
use sqlx::PgPool;

use crate::connection::run_migrations;

/// Tables in creation order; `reset` drops them in reverse.
const TABLES: [&str; 9] = [
    "payment_intents",
    "idempotency_records",
    "payment_events",
    "outbox",
    "rides",
    "seat_locks",
    "bookings",
    "wallet_holds",
    "ride_search_index",
];

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_all_migrations(&self) -> Result<(), AppError> {
        tracing::info!("Starting database migrations...");
        run_migrations(&self.pool).await
    }

    pub async fn check_migration_status(&self) -> Result<MigrationStatus, AppError> {
        let migrator = sqlx::migrate!("./migrations");
        let total = migrator.migrations.len();

        let has_table: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = '_sqlx_migrations')",
        )
        .fetch_one(&self.pool)
        .await?;

        let applied = if has_table {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success")
                .fetch_one(&self.pool)
                .await?;
            usize::try_from(count).unwrap_or_default()
        } else {
            0
        };

        let pending = total.saturating_sub(applied);
        Ok(MigrationStatus {
            total,
            applied,
            pending,
            is_up_to_date: pending == 0,
        })
    }

    /// Drops every table and the migration history, then migrates again.
    pub async fn reset(&self) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;
        for table in TABLES.iter().rev() {
            sqlx::query(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("DROP TABLE IF EXISTS _sqlx_migrations")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::warn!("Dropped all tables");
        self.run_all_migrations().await
    }

    pub async fn pending_outbox(&self) -> Result<i64, AppError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox WHERE status <> 'published'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[derive(Debug)]
pub struct MigrationStatus {
    pub total: usize,
    pub applied: usize,
    pub pending: usize,
    pub is_up_to_date: bool,
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Migrations: {}/{} applied, {} pending",
            self.applied, self.total, self.pending
        )
    }
}
