//! Resource builders and canned index servers.

#![allow(dead_code)]

use std::time::Duration;

use helmsource::source::{HelmRepositorySpec, Interval, LocalObjectReference};
use helmsource::HelmRepository;
use httptest::{matchers::*, responders::*, Expectation, Server};

pub const INDEX_V1: &str = "apiVersion: v1\nentries:\n  nginx:\n    - version: 1.0.0\n";
pub const INDEX_V2: &str = "apiVersion: v1\nentries:\n  nginx:\n    - version: 1.0.0\n    - version: 1.1.0\n";

pub fn repository(name: &str, url: &str, interval: Duration) -> HelmRepository {
    HelmRepository::new(
        "default",
        name,
        HelmRepositorySpec {
            url: url.to_string(),
            secret_ref: None,
            interval: Interval(interval),
        },
    )
}

pub fn with_secret(mut repository: HelmRepository, secret: &str) -> HelmRepository {
    repository.spec.secret_ref = Some(LocalObjectReference {
        name: secret.to_string(),
    });
    repository
}

/// Serves `body` at `/index.yaml` any number of times.
pub fn serve_index(server: &Server, body: &'static str) {
    server.expect(
        Expectation::matching(request::method_path("GET", "/index.yaml"))
            .times(1..)
            .respond_with(status_code(200).body(body)),
    );
}

/// Serves `body` only to requests carrying the given basic credentials.
pub fn serve_index_with_auth(server: &Server, body: &'static str, authorization: &'static str) {
    server.expect(
        Expectation::matching(all_of![
            request::method_path("GET", "/index.yaml"),
            request::headers(contains(("authorization", authorization))),
        ])
        .times(1..)
        .respond_with(status_code(200).body(body)),
    );
}
