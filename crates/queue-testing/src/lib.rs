//! Conformance suite exercising a [`Driver`] against the testable properties
//! every backend is expected to uphold, regardless of storage.
//!
//! Call [`run_conformance_suite`] from a driver crate's own test (usually an
//! integration test under `tests/`), passing a factory that builds a fresh,
//! empty driver instance per case. Properties that only apply to certain
//! capabilities (priority ordering, blocking reserve) are skipped — not
//! failed — when the driver doesn't declare support for them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use queue_core::{AddJobOptions, Driver, JobStatus, LeaseToken};

/// Run every applicable property against a freshly built driver.
///
/// `make_driver` is called once per property/scenario so each case starts
/// from an empty backend; it must not share state across calls.
pub async fn run_conformance_suite<F, Fut>(make_driver: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = Arc<dyn Driver>>,
{
    round_trip(make_driver().await).await;
    uniqueness(make_driver().await).await;
    eligibility_respects_delay(make_driver().await).await;

    let probe = make_driver().await;
    if probe.capabilities().supports_priority {
        priority_order(make_driver().await).await;
    } else {
        fifo_fallback(make_driver().await).await;
    }

    ttr_recovery(make_driver().await).await;
    lease_isolation(make_driver().await).await;
    lease_lost_idempotence(make_driver().await).await;
}

/// Property 1: a pushed payload decodes unchanged after reserve.
pub async fn round_trip(driver: Arc<dyn Driver>) {
    let payload = br#"{"m":"hello"}"#.to_vec();
    let id = driver
        .push(payload.clone(), "job", &AddJobOptions::new())
        .await
        .expect("push");

    let reserved = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("a job should be ready");

    assert_eq!(reserved.id, id);
    assert_eq!(reserved.payload, payload);
}

/// Property 2: concurrent pushes never collide on id.
pub async fn uniqueness(driver: Arc<dyn Driver>) {
    let mut ids = Vec::new();
    for i in 0..16 {
        let id = driver
            .push(
                format!("{{\"n\":{i}}}").into_bytes(),
                "job",
                &AddJobOptions::new(),
            )
            .await
            .expect("push");
        ids.push(id);
    }
    let mut dedup = ids.clone();
    dedup.sort();
    dedup.dedup();
    assert_eq!(dedup.len(), ids.len(), "push produced duplicate ids");
}

/// Property 3: a delayed job is invisible to reserve until its delay elapses.
pub async fn eligibility_respects_delay(driver: Arc<dyn Driver>) {
    let id = driver
        .push(
            b"x".to_vec(),
            "job",
            &AddJobOptions::new().with_delay(1),
        )
        .await
        .expect("push");

    let immediate = driver
        .reserve(Duration::from_millis(50))
        .await
        .expect("reserve");
    assert!(immediate.is_none(), "delayed job reserved before its time");

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let later = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("job should be eligible once the delay has elapsed");
    assert_eq!(later.id, id);
}

/// Property 4 / Scenario S1: higher-priority job reserved first.
pub async fn priority_order(driver: Arc<dyn Driver>) {
    let low = driver
        .push(
            br#"{"m":"lo"}"#.to_vec(),
            "p",
            &AddJobOptions::new().with_priority(1),
        )
        .await
        .expect("push low");
    let high = driver
        .push(
            br#"{"m":"hi"}"#.to_vec(),
            "p",
            &AddJobOptions::new().with_priority(10),
        )
        .await
        .expect("push high");

    let first = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("first reserve");
    let second = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("second reserve");

    assert_eq!(first.id, high, "higher priority job must be reserved first");
    assert_eq!(second.id, low);
}

/// Property 5: without priority support, reserves return in push order.
pub async fn fifo_fallback(driver: Arc<dyn Driver>) {
    let first_pushed = driver
        .push(b"a".to_vec(), "job", &AddJobOptions::new())
        .await
        .expect("push a");
    let second_pushed = driver
        .push(b"b".to_vec(), "job", &AddJobOptions::new())
        .await
        .expect("push b");

    let first = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("first reserve");
    let second = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("second reserve");

    assert_eq!(first.id, first_pushed);
    assert_eq!(second.id, second_pushed);
}

/// Property 6 / Scenario S4: an un-completed lease is recovered once its TTR
/// elapses, re-delivering the same job with a bumped attempt count.
pub async fn ttr_recovery(driver: Arc<dyn Driver>) {
    let id = driver
        .push(
            b"x".to_vec(),
            "job",
            &AddJobOptions::new().with_ttr(1).with_max_attempts(3),
        )
        .await
        .expect("push");

    let first = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("first reserve");
    assert_eq!(first.id, id);
    assert_eq!(first.meta.attempt, 0);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    driver
        .recover_expired_leases(Utc::now())
        .await
        .expect("recover");

    let second = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("job must be redelivered after its lease expires");
    assert_eq!(second.id, id);
    assert_eq!(second.meta.attempt, 1);
}

/// Property 7: two reserves against a single-job queue, exactly one wins.
pub async fn lease_isolation(driver: Arc<dyn Driver>) {
    driver
        .push(b"x".to_vec(), "job", &AddJobOptions::new())
        .await
        .expect("push");

    let (a, b) = tokio::join!(
        driver.reserve(Duration::from_millis(200)),
        driver.reserve(Duration::from_millis(200)),
    );
    let a = a.expect("reserve a");
    let b = b.expect("reserve b");

    let won = [a.is_some(), b.is_some()].iter().filter(|x| **x).count();
    assert_eq!(won, 1, "exactly one concurrent reserve must succeed");
}

/// Property 9: completing a job after its lease was stolen by a second
/// reserve is a no-op, not an error or a double-complete.
pub async fn lease_lost_idempotence(driver: Arc<dyn Driver>) {
    let id = driver
        .push(
            b"x".to_vec(),
            "job",
            &AddJobOptions::new().with_ttr(1).with_max_attempts(2),
        )
        .await
        .expect("push");

    let first = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("first reserve");

    tokio::time::sleep(Duration::from_millis(1200)).await;
    driver
        .recover_expired_leases(Utc::now())
        .await
        .expect("recover");

    let second = driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve")
        .expect("second reserve after recovery");
    assert_eq!(second.id, id);

    let stale_complete = driver
        .complete(id, first.lease_token)
        .await
        .expect("complete with stale token must not error");
    assert!(!stale_complete, "a stale lease token must not complete the job");

    let fresh_complete = driver
        .complete(id, second.lease_token)
        .await
        .expect("complete with current token");
    assert!(fresh_complete);
    assert_eq!(driver.status(id).await.unwrap(), Some(JobStatus::Done));
}

/// Helper for drivers whose lease token is never zero: asserts the contract
/// that `LeaseToken::NONE` never validates a `complete`/`fail`/`retry` call.
pub async fn none_token_never_validates(driver: Arc<dyn Driver>) {
    let id = driver
        .push(b"x".to_vec(), "job", &AddJobOptions::new())
        .await
        .expect("push");
    driver
        .reserve(Duration::from_millis(200))
        .await
        .expect("reserve");

    let ok = driver.complete(id, LeaseToken::NONE).await.expect("complete");
    assert!(!ok);
}
