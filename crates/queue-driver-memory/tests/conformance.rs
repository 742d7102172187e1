use std::sync::Arc;

use queue_core::Driver;
use queue_driver_memory::MemoryDriver;

#[tokio::test]
async fn conformance() {
    queue_testing::run_conformance_suite(|| async {
        Arc::new(MemoryDriver::new()) as Arc<dyn Driver>
    })
    .await;
}
