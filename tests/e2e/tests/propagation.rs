//! Cross-mirror propagation and idle reaping.

use std::time::Duration;

use termite_e2e::harness::{work_request, TestCase, TestConfig};

#[tokio::test(flavor = "multi_thread")]
async fn test_cross_mirror_propagation() {
    let tc = TestCase::new(TestConfig {
        workers: 2,
        max_jobs: 2,
        ..Default::default()
    })
    .await
    .unwrap();

    // Force both mirrors open by holding two slots at once.
    let pool = tc.master.pool();
    let first = pool.pick().await.unwrap();
    let second = pool.pick().await.unwrap();
    assert_ne!(first.worker_addr(), second.worker_addr());
    pool.job_done(&first).await;
    pool.job_done(&second).await;

    tc.run_success(work_request(&["mkdir", "-p", "a/b/c"])).await;
    assert!(tc.wd.join("a/b/c").is_dir());

    // The producing mirror is skipped; the other one holds the pending
    // queue until its next dispatch.
    let pendings = [first.pending_len(), second.pending_len()];
    assert_eq!(
        pendings.iter().filter(|p| **p > 0).count(),
        1,
        "exactly one mirror should have queued changes: {pendings:?}"
    );

    // Whichever mirror runs the next job sees the directory.
    tc.run_success(work_request(&["sh", "-c", "test -d a/b/c"]))
        .await;
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_idle_reap() {
    let tc = TestCase::new(TestConfig {
        keep_alive_ms: 500,
        period_ms: 500,
        ..Default::default()
    })
    .await
    .unwrap();

    tc.run_success(work_request(&["touch", "file.txt"])).await;
    assert_eq!(tc.master.pool().mirror_count().await, 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;

    assert_eq!(tc.master.pool().total_max_jobs().await, 0);
    assert_eq!(tc.master.pool().mirror_count().await, 0);
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_jobs_share_one_mirror() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    for i in 0..3 {
        tc.run_success(work_request(&["sh", "-c", &format!("echo {i} > out-{i}.txt")]))
            .await;
    }
    assert_eq!(tc.master.pool().mirror_count().await, 1);
    for i in 0..3 {
        assert!(tc.wd.join(format!("out-{i}.txt")).exists());
    }
    tc.clean().await;
}
