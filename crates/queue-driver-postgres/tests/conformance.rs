//! Runs the conformance suite against a real Postgres instance.
//!
//! Ignored by default since it requires a running database. Point
//! `DATABASE_URL` at a scratch database and run with
//! `cargo test -p queue-driver-postgres --test conformance -- --ignored`.

use std::sync::Arc;

use queue_core::Driver;
use queue_driver_postgres::PostgresDriver;
use sqlx::postgres::PgPoolOptions;

#[tokio::test]
#[ignore]
async fn conformance() {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set for this test");
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("connect");

    let migrated = PostgresDriver::new(pool.clone(), "conformance-setup");
    migrated.migrate().await.expect("migrate");

    queue_testing::run_conformance_suite(|| {
        let pool = pool.clone();
        async move {
            let queue_name = format!("conformance-{}", uuid::Uuid::new_v4());
            Arc::new(PostgresDriver::new(pool, queue_name)) as Arc<dyn Driver>
        }
    })
    .await;
}
