mod common;

use std::time::Duration;

use common::{
    eventually, repository, serve_index, serve_index_with_auth, with_secret, TestHarness,
    INDEX_V1,
};
use helmsource::source::{AUTHENTICATION_FAILED_REASON, INDEXATION_SUCCEEDED_REASON};
use helmsource::Secret;
use httptest::Server;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_applied_repository_is_reconciled() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler();
    let events = scheduler.start();

    let server = Server::run();
    serve_index(&server, INDEX_V1);
    let key = harness
        .apply(repository(
            "podinfo",
            &server.url_str("/"),
            Duration::from_secs(600),
        ))
        .await;

    let ready = eventually(WAIT, || async {
        harness
            .get(&key)
            .await
            .is_some_and(|r| r.status.is_ready())
    })
    .await;

    scheduler.shutdown();
    events.await.unwrap();
    assert!(ready, "repository never became ready");
}

#[tokio::test]
async fn test_fixing_secret_recovers_repository() {
    // A long retry interval so only the secret event can bring it back.
    let harness = TestHarness::with_retry(Duration::from_secs(3600));
    let scheduler = harness.scheduler();
    let events = scheduler.start();

    let server = Server::run();
    serve_index_with_auth(&server, INDEX_V1, "Basic dXNlcjpwYXNz");

    harness
        .cluster
        .apply_secret(Secret::new("default", "auth").with_field("username", "user"))
        .await
        .unwrap();
    let key = harness
        .apply(with_secret(
            repository("private", &server.url_str("/"), Duration::from_secs(3600)),
            "auth",
        ))
        .await;

    let failed = eventually(WAIT, || async {
        harness
            .get(&key)
            .await
            .is_some_and(|r| r.status.reason() == Some(AUTHENTICATION_FAILED_REASON))
    })
    .await;
    assert!(failed, "missing password was not reported");
    let status = harness.get(&key).await.unwrap().status;
    assert!(!status.is_ready());
    assert!(status.ready.unwrap().message.contains("password"));

    harness
        .cluster
        .apply_secret(
            Secret::new("default", "auth")
                .with_field("username", "user")
                .with_field("password", "pass"),
        )
        .await
        .unwrap();

    let recovered = eventually(WAIT, || async {
        harness
            .get(&key)
            .await
            .is_some_and(|r| r.status.reason() == Some(INDEXATION_SUCCEEDED_REASON))
    })
    .await;

    scheduler.shutdown();
    events.await.unwrap();
    assert!(recovered, "repository did not recover after the secret was fixed");
}

#[tokio::test]
async fn test_secret_in_other_namespace_is_ignored() {
    let harness = TestHarness::with_retry(Duration::from_secs(3600));
    let scheduler = harness.scheduler();
    let events = scheduler.start();

    let key = harness
        .apply(with_secret(
            repository("private", "http://127.0.0.1:1", Duration::from_secs(3600)),
            "auth",
        ))
        .await;
    let failed = eventually(WAIT, || async {
        harness
            .get(&key)
            .await
            .is_some_and(|r| r.status.reason() == Some(AUTHENTICATION_FAILED_REASON))
    })
    .await;
    assert!(failed);
    let before = harness.get(&key).await.unwrap().status.ready.unwrap();

    harness
        .cluster
        .apply_secret(
            Secret::new("other", "auth")
                .with_field("username", "user")
                .with_field("password", "pass"),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.wait_idle(Duration::from_millis(10)).await;

    let after = harness.get(&key).await.unwrap().status.ready.unwrap();
    scheduler.shutdown();
    events.await.unwrap();
    assert_eq!(before.last_transition_time, after.last_transition_time);
}

#[tokio::test]
async fn test_deletion_through_scheduler_cleans_up() {
    let harness = TestHarness::new();
    let scheduler = harness.scheduler();
    let events = scheduler.start();

    let server = Server::run();
    serve_index(&server, INDEX_V1);
    let key = harness
        .apply(repository(
            "podinfo",
            &server.url_str("/"),
            Duration::from_secs(600),
        ))
        .await;
    assert!(
        eventually(WAIT, || async {
            harness
                .get(&key)
                .await
                .is_some_and(|r| r.status.is_ready())
        })
        .await
    );

    harness.cluster.delete(&key).await.unwrap();
    let removed = eventually(WAIT, || async { harness.get(&key).await.is_none() }).await;

    scheduler.shutdown();
    events.await.unwrap();
    assert!(removed, "resource record was not released");
    assert!(harness.stored_files(&key).is_empty());
}
