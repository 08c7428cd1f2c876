mod common;

use std::time::Duration;

use common::{repository, serve_index, TestHarness, INDEX_V1, INDEX_V2};
use helmsource::source::{ReconcileOutcome, INDEXATION_SUCCEEDED_REASON};
use helmsource::storage::checksum;
use httptest::{matchers::*, responders::*, Expectation, Server};

#[tokio::test]
async fn test_anonymous_repository_becomes_ready() {
    let harness = TestHarness::new();
    let server = Server::run();
    serve_index(&server, INDEX_V1);

    let key = harness
        .apply(repository(
            "podinfo",
            &server.url_str("/"),
            Duration::from_secs(600),
        ))
        .await;
    let outcome = harness.reconciler.reconcile(&key).await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Requeue(Duration::from_secs(600))
    );

    let stored = harness.get(&key).await.unwrap();
    let status = stored.status;
    assert!(status.is_ready());
    assert_eq!(status.reason(), Some(INDEXATION_SUCCEEDED_REASON));

    let revision = checksum(INDEX_V1.as_bytes());
    assert_eq!(
        status.ready_message(),
        Some(format!("Fetched revision: {}", revision).as_str())
    );

    let artifact = status.artifact.unwrap();
    assert_eq!(artifact.revision, revision);
    assert!(artifact
        .url
        .starts_with("http://source-controller.local/helmrepository/default/podinfo/"));
    assert_eq!(
        std::fs::read_to_string(harness.storage.local_path(&artifact)).unwrap(),
        INDEX_V1
    );
    assert_eq!(harness.stored_files(&key).len(), 1);
}

#[tokio::test]
async fn test_index_update_replaces_artifact() {
    let harness = TestHarness::new();
    let mut server = Server::run();
    serve_index(&server, INDEX_V1);

    let key = harness
        .apply(repository(
            "podinfo",
            &server.url_str("/"),
            Duration::from_secs(600),
        ))
        .await;
    harness.reconciler.reconcile(&key).await.unwrap();
    let first = harness.get(&key).await.unwrap().status.artifact.unwrap();

    server.verify_and_clear();
    serve_index(&server, INDEX_V2);

    harness.reconciler.reconcile(&key).await.unwrap();
    let second = harness.get(&key).await.unwrap().status.artifact.unwrap();

    assert_ne!(first.revision, second.revision);
    assert_eq!(second.revision, checksum(INDEX_V2.as_bytes()));
    assert!(harness.storage.exists(&second));
    assert!(!harness.storage.local_path(&first).exists());
    assert_eq!(harness.stored_files(&key).len(), 1);
}

#[tokio::test]
async fn test_failure_after_success_keeps_artifact() {
    let harness = TestHarness::with_retry(Duration::from_secs(15));
    let mut server = Server::run();
    serve_index(&server, INDEX_V1);

    let key = harness
        .apply(repository(
            "podinfo",
            &server.url_str("/"),
            Duration::from_secs(600),
        ))
        .await;
    harness.reconciler.reconcile(&key).await.unwrap();
    let published = harness.get(&key).await.unwrap().status.artifact.unwrap();

    server.verify_and_clear();
    server.expect(
        Expectation::matching(request::method_path("GET", "/index.yaml"))
            .respond_with(status_code(502)),
    );

    let outcome = harness.reconciler.reconcile(&key).await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Requeue(Duration::from_secs(15)));

    let status = harness.get(&key).await.unwrap().status;
    assert!(!status.is_ready());
    assert_eq!(status.artifact, Some(published.clone()));
    assert!(harness.storage.exists(&published));
}

#[tokio::test]
async fn test_deleted_repository_leaves_no_files() {
    let harness = TestHarness::new();
    let server = Server::run();
    serve_index(&server, INDEX_V1);

    let key = harness
        .apply(repository(
            "podinfo",
            &server.url_str("/"),
            Duration::from_secs(600),
        ))
        .await;
    harness.reconciler.reconcile(&key).await.unwrap();
    assert_eq!(harness.stored_files(&key).len(), 1);

    assert!(harness.cluster.delete(&key).await.unwrap());
    let outcome = harness.reconciler.reconcile(&key).await.unwrap();

    assert_eq!(outcome, ReconcileOutcome::Done);
    assert!(harness.get(&key).await.is_none());
    assert!(harness.stored_files(&key).is_empty());
}
