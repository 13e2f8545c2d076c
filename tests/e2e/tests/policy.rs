//! Policy scenarios: absolute-path enforcement and private-path denial.

use std::fs;
use std::os::unix::fs::PermissionsExt;

use termite_e2e::harness::{test_env, work_request, TestCase, TestConfig};
use termite_proto::WorkRequest;

#[tokio::test(flavor = "multi_thread")]
async fn test_non_absolute_binary_rejected() {
    let tc = TestCase::new(TestConfig::default()).await.unwrap();

    let req = WorkRequest {
        binary: "true".to_owned(),
        argv: vec!["true".to_owned()],
        env: test_env(),
        dir: String::new(),
        ..Default::default()
    };
    let err = tc.run(req).await.unwrap_err();
    assert!(
        err.to_string().contains("absolute"),
        "master should demand an absolute path: {err}"
    );
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_private_paths_denied() {
    let tc = TestCase::new(TestConfig {
        expose_private: false,
        ..Default::default()
    })
    .await
    .unwrap();

    fs::write(tc.wd.join("file.txt"), [42u8]).unwrap();
    fs::set_permissions(tc.wd.join("file.txt"), fs::Permissions::from_mode(0o644)).unwrap();
    fs::write(tc.wd.join("forbidden.txt"), [42u8]).unwrap();
    fs::set_permissions(
        tc.wd.join("forbidden.txt"),
        fs::Permissions::from_mode(0o600),
    )
    .unwrap();

    // World-readable files flow to the worker; private ones do not exist
    // in its view.
    tc.run_success(work_request(&["cat", "file.txt"])).await;
    tc.run_fail(work_request(&["cat", "forbidden.txt"])).await;
    tc.clean().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_private_paths_exposed_when_configured() {
    let tc = TestCase::new(TestConfig {
        expose_private: true,
        ..Default::default()
    })
    .await
    .unwrap();

    fs::write(tc.wd.join("forbidden.txt"), b"visible").unwrap();
    fs::set_permissions(
        tc.wd.join("forbidden.txt"),
        fs::Permissions::from_mode(0o600),
    )
    .unwrap();

    let resp = tc.run_success(work_request(&["cat", "forbidden.txt"])).await;
    assert_eq!(resp.stdout, b"visible");
    tc.clean().await;
}
