//! Shared fixtures for the unit tests.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{
    Form, Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use base64::{Engine, prelude::BASE64_STANDARD};
use clap::Parser;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;

use crate::{
    Db,
    config::{Args, ClientSettings, ServerConfiguration},
    keys::{KeyRing, SigningService, fixtures},
};

pub async fn db() -> Db {
    // every connection to :memory: is its own database, so there must only ever be one
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    Db { pool }
}

fn args(extra: &[&str]) -> Args {
    let required = [
        "rp",
        "--client-id",
        "abc",
        "--client-secret",
        "s3cret",
        "--issuer",
        "https://idp",
        "--base-url",
        "https://rp.example",
        "--scope",
        "openid profile",
    ];
    Args::try_parse_from(required.iter().chain(extra)).unwrap()
}

pub fn server_configuration(authorization_endpoint: &str, token_endpoint: &str) -> ServerConfiguration {
    let args = args(&[
        "--authorization-endpoint",
        authorization_endpoint,
        "--token-endpoint",
        token_endpoint,
    ]);
    ServerConfiguration::from_args(&args).unwrap()
}

pub fn client_settings() -> ClientSettings {
    ClientSettings::from_args(&args(&[])).unwrap()
}

pub fn signing_service(kids: &[&str]) -> SigningService {
    SigningService::new(KeyRing::new(
        kids.iter().map(|kid| fixtures::signer(kid)),
        None,
    ))
}

/// A token endpoint that counts its calls and either issues tokens or rejects every code.
#[derive(Clone, Default)]
pub struct FakeTokenEndpoint {
    pub calls: Arc<AtomicUsize>,
    pub codes: Arc<Mutex<Vec<String>>>,
    pub fail: bool,
    /// Held before answering.
    pub delay: Option<Duration>,
}

impl FakeTokenEndpoint {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn token(
    State(endpoint): State<FakeTokenEndpoint>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    endpoint.calls.fetch_add(1, Ordering::SeqCst);
    endpoint.codes.lock().unwrap().push(form["code"].clone());

    if let Some(delay) = endpoint.delay {
        tokio::time::sleep(delay).await;
    }

    if endpoint.fail {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "invalid_grant" })),
        )
            .into_response();
    }

    let expected = format!("Basic {}", BASE64_STANDARD.encode("abc:s3cret"));
    assert_eq!(headers[header::AUTHORIZATION], expected.as_str());
    assert_eq!(form["grant_type"], "authorization_code");
    assert_eq!(form["redirect_uri"], "https://rp.example/openid_connect_login");

    Json(json!({
        "access_token": "access",
        "token_type": "Bearer",
        "expires_in": 3600,
        "id_token": "header.body.signature",
        "scope": ["openid"],
    }))
    .into_response()
}

pub async fn spawn_token_endpoint(endpoint: FakeTokenEndpoint) -> String {
    let app = Router::new()
        .route("/token", post(token))
        .with_state(endpoint);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{addr}/token")
}

/// An address nothing listens on.
pub async fn unreachable_token_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/token")
}
