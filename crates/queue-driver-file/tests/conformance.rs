use std::sync::Arc;

use queue_core::Driver;
use queue_driver_file::FileDriver;
use tempfile::TempDir;

#[tokio::test]
async fn conformance() {
    // Leaked on purpose: each case needs its own directory for the lifetime
    // of the test process, and the suite only runs once per `cargo test`.
    queue_testing::run_conformance_suite(|| async {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().to_path_buf();
        std::mem::forget(dir);
        Arc::new(FileDriver::open(root).await.expect("open")) as Arc<dyn Driver>
    })
    .await;
}
