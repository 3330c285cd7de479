// Commit lookup and GitHub App tokens against a mocked API

mod common;

use common::{dataset, fixture_path};
use httpmock::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use waffle_core::config::GithubConfig;
use waffle_registry::{CommitLookup, GithubAuth, GithubCommitLookup, RegistryError};

fn config(server: &MockServer) -> GithubConfig {
    GithubConfig {
        api_base: server.base_url(),
        commit_lookup_timeout_secs: 2,
        ..GithubConfig::default()
    }
}

#[tokio::test]
async fn test_latest_commit() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/acme/ds1/commits/master");
            then.status(200)
                .json_body(json!({"sha": "abcdef1234567890", "commit": {}}));
        })
        .await;

    let config = config(&server);
    let lookup =
        GithubCommitLookup::new(&config, Arc::new(GithubAuth::from_config(&config).unwrap()))
            .unwrap();
    let sha = lookup
        .latest_commit(&dataset("ds1", "acme/ds1", &["master"]), "master")
        .await
        .unwrap();
    mock.assert_async().await;
    assert_eq!(sha, "abcdef1234567890");
}

#[tokio::test]
async fn test_latest_commit_upstream_error() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/acme/ds1/commits/gone");
            then.status(404).json_body(json!({"message": "No commit found"}));
        })
        .await;

    let config = config(&server);
    let lookup =
        GithubCommitLookup::new(&config, Arc::new(GithubAuth::anonymous())).unwrap();
    let err = lookup
        .latest_commit(&dataset("ds1", "acme/ds1", &["gone"]), "gone")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Upstream { status: 404, .. }));
}

#[tokio::test]
async fn test_latest_commit_times_out() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/repos/acme/slow/commits/master");
            then.status(200)
                .delay(Duration::from_secs(5))
                .json_body(json!({"sha": "late"}));
        })
        .await;

    let mut config = config(&server);
    config.commit_lookup_timeout_secs = 1;
    let lookup =
        GithubCommitLookup::new(&config, Arc::new(GithubAuth::anonymous())).unwrap();
    let err = lookup
        .latest_commit(&dataset("slow", "acme/slow", &["master"]), "master")
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::Timeout(_)));
}

#[tokio::test]
async fn test_installation_token_is_cached() {
    let server = MockServer::start_async().await;
    let token_mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/app/installations/4242/access_tokens")
                .header_exists("authorization");
            then.status(201).json_body(json!({
                "token": "ghs_installation",
                "expires_at": "2099-01-01T00:00:00Z"
            }));
        })
        .await;
    let commit_mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/repos/acme/private/commits/main")
                .header("authorization", "Bearer ghs_installation");
            then.status(200).json_body(json!({"sha": "0123456789abcdef"}));
        })
        .await;

    let config = GithubConfig {
        app_id: Some("12345".to_string()),
        app_private_key_path: Some(fixture_path("test-app-key.pem")),
        ..config(&server)
    };
    let auth = Arc::new(GithubAuth::from_config(&config).unwrap());
    let lookup = GithubCommitLookup::new(&config, auth.clone()).unwrap();

    let mut private = dataset("private", "acme/private", &["main"]);
    private.fetcher_identity = Some("4242".to_string());

    for _ in 0..3 {
        let sha = lookup.latest_commit(&private, "main").await.unwrap();
        assert_eq!(sha, "0123456789abcdef");
    }
    token_mock.assert_hits_async(1).await;
    commit_mock.assert_hits_async(3).await;
}

#[tokio::test]
async fn test_no_installation_means_public() {
    let server = MockServer::start_async().await;
    let config = GithubConfig {
        app_id: Some("12345".to_string()),
        app_private_key_path: Some(fixture_path("test-app-key.pem")),
        ..config(&server)
    };
    let auth = GithubAuth::from_config(&config).unwrap();
    assert_eq!(auth.token_for(None).await.unwrap(), None);
}
