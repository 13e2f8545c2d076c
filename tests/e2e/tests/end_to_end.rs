//! End-to-end scenarios: one master, one worker, real sockets.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use termite_e2e::harness::{find_bin, test_env, work_request, TestCase, TestConfig};
use termite_attr::{FileAttr, FileSet};
use termite_proto::{connection_id, WorkRequest};

#[tokio::test(flavor = "multi_thread")]
async fn test_write_read_delete() {
    let tc = TestCase::new(TestConfig {
        keep_alive_ms: 500,
        period_ms: 500,
        ..Default::default()
    })
    .await
    .unwrap();

    // Write: tee copies stdin into a file inside the view.
    let stdin_id = connection_id();
    let req = WorkRequest {
        stdin_id: Some(stdin_id),
        ..work_request(&["tee", "output.txt"])
    };
    let tc_stdin = tc.send_stdin(stdin_id, b"hello");
    let (sent, resp) = tokio::join!(tc_stdin, tc.run(req));
    sent.unwrap();
    let resp = resp.unwrap();
    assert_eq!(resp.exit, 0);
    assert_eq!(resp.stdout, b"hello");

    // The master replayed the produced file into its root.
    assert_eq!(fs::read(tc.wd.join("output.txt")).unwrap(), b"hello");

    // Delete.
    tc.run_success(work_request(&["rm", "output.txt"])).await;
    assert!(!tc.wd.join("output.txt").exists());

    // Keepalive: with a 500ms window the pool reaps its mirrors and the
    // worker sees the sessions close.
    tokio::time::sleep(Duration::from_secs(2)).await;
    for worker in &tc.workers {
        assert!(worker.status().mirrors.is_empty(), "mirror still alive");
    }
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_negative_lookup_then_replay() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    // The file does not exist yet.
    tc.run_fail(work_request(&["cat", "output.txt"])).await;

    // Ingest a file set directly, the way a replayed job would.
    let content = b"new content";
    let digest = tc.master.store().save(content).unwrap();
    let fset = FileSet::new(vec![FileAttr::regular(
        "output.txt",
        0o644,
        content.len() as u64,
        digest,
    )]);
    tc.master.replay(&fset).await.unwrap();
    assert_eq!(fs::read(tc.wd.join("output.txt")).unwrap(), content);

    // The worker sees the update on its next job.
    let resp = tc.run_success(work_request(&["cat", "output.txt"])).await;
    assert_eq!(resp.stdout, content);
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exec_true() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();
    tc.run_success(work_request(&["true"])).await;
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stdout_roundtrip() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    let payload = vec![b'a'; 1500];
    fs::write(tc.wd.join("file.txt"), &payload).unwrap();

    let resp = tc.run_success(work_request(&["cat", "file.txt"])).await;
    assert_eq!(resp.stdout, payload);
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_file() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    fs::write(tc.wd.join("e2e-move.txt"), [42u8]).unwrap();

    tc.run_success(work_request(&["mv", "e2e-move.txt", "e2e-new.txt"]))
        .await;

    let moved = fs::read(tc.wd.join("e2e-new.txt")).unwrap();
    assert_eq!(moved, [42u8]);
    assert!(!tc.wd.join("e2e-move.txt").exists());
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_move_directory_tree() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    tc.run_success(work_request(&["mkdir", "-p", "a/b/c"])).await;
    tc.run_success(work_request(&["mv", "a", "q"])).await;

    assert!(tc.wd.join("q/b/c").is_dir());
    assert!(!tc.wd.join("a").exists());
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mode_change() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    fs::write(tc.wd.join("file.txt"), [42u8]).unwrap();
    fs::set_permissions(tc.wd.join("file.txt"), fs::Permissions::from_mode(0o644)).unwrap();

    tc.run_success(work_request(&["chmod", "a+x", "file.txt"]))
        .await;

    let mode = fs::metadata(tc.wd.join("file.txt")).unwrap().permissions().mode();
    assert_ne!(mode & 0o111, 0, "file did not become executable: {mode:o}");
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_symlink_update() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    std::os::unix::fs::symlink("oldlink", tc.wd.join("symlink")).unwrap();

    tc.run_success(work_request(&["touch", "file.txt"])).await;
    let meta = fs::symlink_metadata(tc.wd.join("file.txt")).unwrap();
    assert!(meta.is_file());
    assert_eq!(meta.len(), 0);

    tc.run_success(work_request(&["ln", "-sf", "foo", "symlink"]))
        .await;
    assert_eq!(
        fs::read_link(tc.wd.join("symlink")).unwrap(),
        std::path::PathBuf::from("foo")
    );
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_environment_passes_through() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    let mut req = work_request(&["sh", "-c", "echo $MAGIC"]);
    req.env = test_env();
    req.env.push("MAGIC=777".to_owned());
    let resp = tc.run_success(req).await;

    let out = String::from_utf8_lossy(&resp.stdout);
    assert_eq!(out.trim_end(), "777", "environment got lost");
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hard_link_harvest() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    tc.run_success(work_request(&[
        "sh",
        "-c",
        "echo hello > file.txt ; ln file.txt foo.txt",
    ]))
    .await;

    let linked = fs::metadata(tc.wd.join("foo.txt")).unwrap();
    assert_eq!(linked.len(), 6, "foo.txt missing content");
    assert_eq!(fs::read(tc.wd.join("file.txt")).unwrap(), b"hello\n");
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refresh_picks_up_outside_writes() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    // Cache the old view of the root.
    tc.run_fail(work_request(&["cat", "late.txt"])).await;

    // A write behind termite's back, then a refresh.
    fs::write(tc.wd.join("late.txt"), b"here now").unwrap();
    tc.master.refresh_attribute_cache().await;

    let resp = tc.run_success(work_request(&["cat", "late.txt"])).await;
    assert_eq!(resp.stdout, b"here now");
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_find_bin_resolves() {
    // Harness self-check: the binaries the scenarios need exist.
    for bin in ["tee", "rm", "cat", "sh", "mkdir", "mv", "chmod", "touch", "ln", "true"] {
        find_bin(bin).unwrap();
    }
}
