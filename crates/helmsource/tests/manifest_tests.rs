mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, serve_index_with_auth, TestHarness, INDEX_V1};
use helmsource::{ManifestLoader, ManifestSync, NamespacedName};
use httptest::Server;

const WAIT: Duration = Duration::from_secs(10);

fn manifests(url: &str) -> String {
    format!(
        r#"
apiVersion: v1
kind: Secret
metadata:
  name: chart-auth
  namespace: apps
data:
  username: dXNlcg==
stringData:
  password: pass
---
apiVersion: source.helmsource.io/v1alpha1
kind: HelmRepository
metadata:
  name: internal
  namespace: apps
spec:
  url: {}
  interval: 10m
  secretRef:
    name: chart-auth
"#,
        url
    )
}

#[tokio::test]
async fn test_declared_repository_is_published_and_removed() {
    let harness = TestHarness::new();
    let manifest_dir = harness.dir.path().join("manifests");
    std::fs::create_dir_all(&manifest_dir).unwrap();

    let server = Server::run();
    serve_index_with_auth(&server, INDEX_V1, "Basic dXNlcjpwYXNz");
    std::fs::write(
        manifest_dir.join("internal.yaml"),
        manifests(&server.url_str("/")),
    )
    .unwrap();

    let sync = Arc::new(ManifestSync::new(
        ManifestLoader::new(&manifest_dir),
        harness.cluster.clone(),
    ));
    let summary = sync.sync().await.unwrap();
    assert_eq!(summary.repositories_applied, 1);
    assert_eq!(summary.secrets_applied, 1);

    let scheduler = harness.scheduler();
    let events = scheduler.start();

    let key = NamespacedName::new("apps", "internal");
    let ready = eventually(WAIT, || async {
        harness
            .get(&key)
            .await
            .is_some_and(|r| r.status.is_ready())
    })
    .await;
    assert!(ready, "declared repository never became ready");
    assert_eq!(harness.stored_files(&key).len(), 1);

    std::fs::remove_file(manifest_dir.join("internal.yaml")).unwrap();
    let summary = sync.sync().await.unwrap();
    assert_eq!(summary.repositories_deleted, 1);
    assert_eq!(summary.secrets_deleted, 1);

    let removed = eventually(WAIT, || async { harness.get(&key).await.is_none() }).await;

    scheduler.shutdown();
    events.await.unwrap();
    assert!(removed, "undeclared repository was not finalized");
    assert!(harness.stored_files(&key).is_empty());
}
