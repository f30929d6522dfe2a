#![allow(clippy::unwrap_used)]
// Integration tests for `CloudClient` using wiremock.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nocturne_api::client::{CloudClient, SessionEvent};
use nocturne_api::error::Error;
use nocturne_api::transport::TransportConfig;

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, CloudClient) {
    let server = MockServer::start().await;
    let base = Url::parse(&server.uri()).unwrap();
    let client = CloudClient::new(base, &TransportConfig::default(), 300).unwrap();
    (server, client)
}

fn password() -> SecretString {
    SecretString::from("hunter2".to_owned())
}

/// A three-segment token whose payload carries the given `exp`.
fn token_with_exp(exp: i64) -> String {
    let payload = URL_SAFE_NO_PAD.encode(format!("{{\"exp\":{exp}}}"));
    format!("hdr.{payload}.sig")
}

fn far_future_token() -> String {
    token_with_exp(Utc::now().timestamp() + 86_400)
}

// ── Login ───────────────────────────────────────────────────────────

#[tokio::test]
async fn login_success_adopts_tokens() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "access_token": far_future_token(),
            "refresh_token": "refresh-1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut events = client.session_events();
    client
        .authenticate("a@b.com", &password(), None)
        .await
        .unwrap();

    assert!(client.bearer_token().await.is_some());
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::TokenRotated(t) if t == "refresh-1"
    ));

    // Fresh token: no further network I/O.
    assert!(client.ensure_authenticated().await);
}

#[tokio::test]
async fn login_failure_is_an_authentication_error() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(401).set_body_string("nope"))
        .expect(1)
        .mount(&server)
        .await;

    let result = client.authenticate("a@b.com", &password(), None).await;
    assert!(matches!(result, Err(Error::Authentication { .. })));
    assert!(client.bearer_token().await.is_none());
}

#[tokio::test]
async fn backoff_rejects_retry_without_network_io() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let result = client.authenticate("a@b.com", &password(), None).await;
    assert!(matches!(result, Err(Error::Authentication { .. })));

    // Immediately after a failure the backoff window gates the retry;
    // the login mock's expect(1) verifies no second request went out.
    assert!(!client.ensure_authenticated().await);
}

// ── Token refresh ───────────────────────────────────────────────────

#[tokio::test]
async fn supplied_refresh_token_skips_password_login() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/tokens/refresh"))
        .and(body_partial_json(json!({ "refresh_token": "seed" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": far_future_token(),
            "refresh_token": "rotated",
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    client
        .authenticate("a@b.com", &password(), Some("seed".into()))
        .await
        .unwrap();
    assert!(client.bearer_token().await.is_some());
}

#[tokio::test]
async fn dead_refresh_token_falls_back_to_password_login() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/tokens/refresh"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "access_token": far_future_token(),
        })))
        .expect(1)
        .mount(&server)
        .await;

    client
        .authenticate("a@b.com", &password(), Some("dead".into()))
        .await
        .unwrap();
    assert!(client.bearer_token().await.is_some());
}

#[tokio::test]
async fn expiring_token_triggers_refresh_inside_buffer() {
    let (server, client) = setup().await;

    // Initial login hands out a token expiring inside the 300s buffer.
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "access_token": token_with_exp(Utc::now().timestamp() + 299),
            "refresh_token": "r1",
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/tokens/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": far_future_token(),
        })))
        .expect(1)
        .mount(&server)
        .await;

    client
        .authenticate("a@b.com", &password(), None)
        .await
        .unwrap();
    assert!(client.ensure_authenticated().await);
}

#[tokio::test]
async fn fresh_token_outside_buffer_skips_refresh() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "access_token": token_with_exp(Utc::now().timestamp() + 301),
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/tokens/refresh"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    client
        .authenticate("a@b.com", &password(), None)
        .await
        .unwrap();
    assert!(client.ensure_authenticated().await);
}

// ── MFA ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn mfa_challenge_suspends_session_until_code_accepted() {
    let (server, client) = setup().await;

    // MFA completion: same endpoint, distinguished by the mfa fields.
    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({
            "mfa_token": "T",
            "mfa_code": "123456",
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "access_token": far_future_token(),
            "refresh_token": "Y",
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(482).set_body_json(json!({
            "mfa_token": "T",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let result = client.authenticate("a@b.com", &password(), None).await;
    assert!(matches!(result, Err(Error::MfaRequired)));
    assert!(client.is_mfa_pending().await);

    // Suspended: no login attempt, no backoff accounting.
    assert!(!client.ensure_authenticated().await);

    let mut events = client.session_events();
    client.complete_mfa("\"123456\"").await.unwrap();

    assert!(!client.is_mfa_pending().await);
    assert!(matches!(
        events.try_recv().unwrap(),
        SessionEvent::TokenRotated(t) if t == "Y"
    ));
    // Token adopted from the MFA response: no further network I/O.
    assert!(client.ensure_authenticated().await);
}

#[tokio::test]
async fn rejected_mfa_code_keeps_challenge_pending() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .and(body_partial_json(json!({ "mfa_token": "T" })))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(482).set_body_json(json!({
            "mfa_token": "T",
        })))
        .mount(&server)
        .await;

    let _ = client.authenticate("a@b.com", &password(), None).await;
    assert!(client.is_mfa_pending().await);

    let result = client.complete_mfa("000000").await;
    assert!(matches!(result, Err(Error::Authentication { .. })));
    // A corrected code can still be retried.
    assert!(client.is_mfa_pending().await);
}

// ── Device directory ────────────────────────────────────────────────

#[tokio::test]
async fn lists_speaker_devices() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "access_token": far_future_token(),
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/babies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "babies": [
                {
                    "uid": "baby-1",
                    "name": "Nursery",
                    "speaker": {
                        "attached_to_speaker": true,
                        "speaker": { "uid": "spk-1", "name": "Sound + Light" }
                    }
                },
                { "uid": "baby-2", "name": "Camera only" }
            ]
        })))
        .mount(&server)
        .await;

    client
        .authenticate("a@b.com", &password(), None)
        .await
        .unwrap();

    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].device_id, "baby-1");
    assert_eq!(devices[0].connection_id, "spk-1");
}

#[tokio::test]
async fn device_listing_retries_once_through_refresh_on_401() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "access_token": far_future_token(),
            "refresh_token": "r1",
        })))
        .mount(&server)
        .await;

    // First directory hit: token rejected. Second (after refresh): data.
    Mock::given(method("GET"))
        .and(path("/babies"))
        .respond_with(ResponseTemplate::new(401))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/tokens/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": far_future_token(),
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/babies"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "babies": [{
                "uid": "baby-1",
                "speaker": {
                    "attached_to_speaker": true,
                    "speaker": { "uid": "spk-1" }
                }
            }]
        })))
        .mount(&server)
        .await;

    client
        .authenticate("a@b.com", &password(), None)
        .await
        .unwrap();

    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 1);
}
