use std::sync::Arc;

use karigo_common::events::{DomainEvent, EventEnvelope, RideUpdated};
use karigo_common::{DatabaseConfig, InMemoryEventBus, OutboxConfig};
use karigo_database::{create_pool, enqueue, MigrationRunner, OutboxRelay, OutboxStore, PgOutboxStore};
use uuid::Uuid;

#[tokio::test]
async fn migrations_and_outbox_relay_against_postgres() {
    // Skip test if no database is available
    if std::env::var("DATABASE_URL").is_err() {
        println!("Skipping database test - DATABASE_URL not set");
        return;
    }

    let config = DatabaseConfig {
        database: "karigo_test".to_string(),
        ..DatabaseConfig::from_env()
    };
    let admin_config = DatabaseConfig {
        database: "postgres".to_string(),
        ..config.clone()
    };

    let admin_pool = create_pool(&admin_config).await.expect("Failed to connect to admin database");
    sqlx::query(&format!("DROP DATABASE IF EXISTS {}", config.database))
        .execute(&admin_pool)
        .await
        .expect("Failed to drop test database");

    let pool = create_pool(&config).await.expect("Failed to connect to test database");
    let runner = MigrationRunner::new(pool.clone());
    runner.run_all_migrations().await.expect("Failed to run migrations");
    assert!(runner.check_migration_status().await.unwrap().is_up_to_date);

    let ride_id = Uuid::new_v4();
    let mut tx = pool.begin().await.unwrap();
    for seats in [2, 1] {
        let envelope = EventEnvelope::new(
            "ride-service",
            DomainEvent::RideUpdated(RideUpdated {
                ride_id,
                seats_available: seats,
                status: "published".to_string(),
            }),
        );
        enqueue(&mut tx, &envelope).await.unwrap();
    }
    tx.commit().await.unwrap();
    assert_eq!(runner.pending_outbox().await.unwrap(), 2);

    let store: Arc<dyn OutboxStore> = Arc::new(PgOutboxStore::new(pool.clone()));
    let bus = Arc::new(InMemoryEventBus::new());
    let relay = OutboxRelay::new(
        store.clone(),
        bus.clone(),
        OutboxConfig {
            poll_interval_ms: 50,
            batch_size: 10,
        },
    );
    let report = relay.process_batch().await.unwrap();

    assert_eq!(report.published, 2);
    assert_eq!(runner.pending_outbox().await.unwrap(), 0);
    assert_eq!(bus.count("ride.updated"), 2);

    assert_eq!(store.prune_published(std::time::Duration::from_secs(3600)).await.unwrap(), 0);
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert_eq!(store.prune_published(std::time::Duration::from_millis(1)).await.unwrap(), 2);

    drop(pool);
    sqlx::query(&format!("DROP DATABASE {} WITH (FORCE)", config.database))
        .execute(&admin_pool)
        .await
        .expect("Failed to cleanup test database");
}
