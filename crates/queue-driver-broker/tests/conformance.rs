use std::sync::Arc;

use queue_core::Driver;
use queue_driver_broker::{BrokerDriver, MockTransport};

#[tokio::test]
async fn conformance() {
    queue_testing::run_conformance_suite(|| async {
        Arc::new(BrokerDriver::new(MockTransport::new())) as Arc<dyn Driver>
    })
    .await;
}
