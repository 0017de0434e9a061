use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::redirect::Policy;
use reqwest::StatusCode;
use serde_json::json;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gmconnect::config::ConnectConfig;
use gmconnect::connection::GmailConnection;
use gmconnect::error::ConnectError;
use gmconnect::handshake::{CallbackListener, CallbackOutcome, HandshakePhase};
use gmconnect::identity::{LocalIdentity, Session};

fn signed_in_identity() -> Arc<LocalIdentity> {
    let identity = Arc::new(LocalIdentity::new());
    identity.sign_in(
        Session {
            user_id: "user-42".to_string(),
            email: Some("seeker@example.com".to_string()),
            email_verified: true,
        },
        "id-token-1",
    );
    identity
}

fn connection_for(server: &MockServer) -> GmailConnection {
    let mut config = ConnectConfig::default();
    config.api_base = server.uri().parse().expect("server uri");
    config.ingestion_host = server.uri().parse().expect("server uri");
    GmailConnection::over_http(config, signed_in_identity()).expect("build connection")
}

fn browser() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .build()
        .expect("build client")
}

async fn listener() -> (CallbackListener, SocketAddr) {
    let listener = CallbackListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    (listener, addr)
}

#[tokio::test]
async fn temp_token_callback_finalizes_backfills_and_redirects_to_settings() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/gmail/finalize-tokens"))
        .and(header("authorization", "Bearer id-token-1"))
        .and(body_json(json!({ "temp_token_id": "tok1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": "success" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/gmail/status"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "connected": true, "email": "seeker@gmail.com" })),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fetch"))
        .and(query_param("uid", "user-42"))
        .and(query_param("backfill", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "status": "complete",
            "users_processed": 1,
            "backfill": true
        })))
        .expect(1)
        .mount(&server)
        .await;

    let connection = connection_for(&server);
    let (listener, addr) = listener().await;
    let browser = browser();

    let (outcome, response) = tokio::join!(listener.receive(connection.coordinator()), async {
        // Unrelated requests are answered without consuming the listener.
        let favicon = browser
            .get(format!("http://{addr}/favicon.ico"))
            .send()
            .await
            .expect("favicon request");
        assert_eq!(favicon.status(), StatusCode::NOT_FOUND);

        browser
            .get(format!("http://{addr}/gmail/callback?temp_token_id=tok1"))
            .send()
            .await
            .expect("callback request")
    });

    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response
            .headers()
            .get("location")
            .and_then(|value| value.to_str().ok()),
        Some("http://localhost:3000/settings?success=gmail-connected")
    );

    let CallbackOutcome::Connected(report) = outcome.expect("callback handled") else {
        panic!("expected a connected outcome");
    };
    assert_eq!(report.status.account_email.as_deref(), Some("seeker@gmail.com"));
    assert_eq!(
        report.backfill.and_then(|backfill| backfill.users_processed),
        Some(1)
    );
    assert!(connection.coordinator().state().is_connected());
}

#[tokio::test]
async fn provider_error_redirects_with_error_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let connection = connection_for(&server);
    let (listener, addr) = listener().await;
    let browser = browser();

    let (outcome, response) = tokio::join!(
        listener.receive(connection.coordinator()),
        browser
            .get(format!("http://{addr}/gmail/callback?error=access_denied"))
            .send()
    );

    assert_eq!(
        outcome,
        Err(ConnectError::ProviderError("access_denied".to_string()))
    );
    let response = response.expect("callback request");
    assert_eq!(response.status(), StatusCode::SEE_OTHER);
    assert_eq!(
        response
            .headers()
            .get("location")
            .and_then(|value| value.to_str().ok()),
        Some("http://localhost:3000/settings?error=OAuth+error%3A+access_denied")
    );
    assert_eq!(connection.coordinator().state().phase, HandshakePhase::Failed);
}

#[tokio::test]
async fn silent_connection_does_not_block_the_callback() {
    let server = MockServer::start().await;
    let connection = connection_for(&server);
    let (listener, addr) = listener().await;
    let listener = listener.with_read_timeout(Duration::from_millis(200));
    let browser = browser();

    // Connected first, so it is accepted first, but never sends a byte.
    let _idle = tokio::net::TcpStream::connect(addr)
        .await
        .expect("idle connection");

    let served = tokio::time::timeout(Duration::from_secs(3), async {
        tokio::join!(
            listener.receive(connection.coordinator()),
            browser
                .get(format!("http://{addr}/gmail/callback?error=access_denied"))
                .send()
        )
    })
    .await;

    let (outcome, response) = served.expect("callback served despite the idle connection");
    assert_eq!(
        outcome,
        Err(ConnectError::ProviderError("access_denied".to_string()))
    );
    assert_eq!(
        response.expect("callback request").status(),
        StatusCode::SEE_OTHER
    );
}

#[tokio::test]
async fn rejected_code_redirects_with_server_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/gmail/callback"))
        .and(body_json(json!({ "code": "abc123" })))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "Invalid grant" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fetch"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let connection = connection_for(&server);
    let (listener, addr) = listener().await;
    let browser = browser();

    let (outcome, response) = tokio::join!(
        listener.receive(connection.coordinator()),
        browser
            .get(format!("http://{addr}/gmail/callback?code=abc123"))
            .send()
    );

    assert_eq!(
        outcome,
        Err(ConnectError::ExchangeFailed("Invalid grant".to_string()))
    );
    let location = response
        .expect("callback request")
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    assert_eq!(
        location.as_deref(),
        Some("http://localhost:3000/settings?error=Gmail+token+exchange+failed%3A+Invalid+grant")
    );
}
