mod config;
mod error;
mod flow;
mod keys;
mod nonce;
mod publish;
mod request;
mod session;
#[cfg(test)]
mod testing;
mod view;

use std::{str::FromStr, sync::Arc};

use askama::Template;
use axum::{
    Router,
    extract::{FromRef, OriginalUri, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    routing::{get, post},
};
use axum_extra::extract::CookieJar;
use clap::Parser;
use color_eyre::Result;
use color_eyre::eyre::Context;
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions};
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

use crate::{
    config::{Args, ClientSettings, KeyPublicationConfig, ServerConfiguration},
    flow::{
        ACCESS_TOKEN_SESSION_KEY, CallbackParams, FlowController, FlowOutcome,
        ID_TOKEN_NONCE_SESSION_KEY, ID_TOKEN_SESSION_KEY,
    },
    keys::{KeySource, SigningService},
    publish::KeyPublication,
    request::RequestContext,
    session::{BrowserSession, ExistingSession},
    view::ViewChain,
};

#[derive(Clone)]
struct Db {
    pool: sqlx::Pool<sqlx::Sqlite>,
}

#[derive(Clone)]
struct AppState {
    db: Db,
    flow: Arc<FlowController>,
    config: Arc<ServerConfiguration>,
    settings: Arc<ClientSettings>,
    publication: Option<KeyPublicationConfig>,
}

impl FromRef<AppState> for Db {
    fn from_ref(state: &AppState) -> Self {
        state.db.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .init();

    let config = Args::parse()
        .into_config()
        .wrap_err("invalid configuration")?;

    let opts = SqliteConnectOptions::from_str(&config.database)
        .wrap_err("parsing database path")?
        .create_if_missing(true);

    let pool = SqlitePool::connect_with(opts)
        .await
        .wrap_err("connecting to db")?;

    sqlx::migrate!()
        .run(&pool)
        .await
        .wrap_err("running migrations")?;

    let key_source = KeySource {
        dir: config.keys_dir.clone(),
        algorithm: config.signing_algorithm,
        active: config.active_kid.clone(),
    };
    let ring = key_source.load().wrap_err("loading signing keys")?;
    info!(keys = ring.len(), active = ?ring.active_kid(), "Loaded signing keys");
    let signing = Arc::new(SigningService::new(ring));

    #[cfg(unix)]
    tokio::spawn(reload_keys_on_hangup(key_source, signing.clone()));

    let server = Arc::new(config.server);
    let settings = Arc::new(config.client);
    let flow = FlowController::new(server.clone(), settings.clone(), signing.clone())?;

    let state = AppState {
        db: Db { pool },
        flow: Arc::new(flow),
        config: server,
        settings,
        publication: config.publication,
    };
    let app = app(state, signing);

    let listener = tokio::net::TcpListener::bind(config.listen)
        .await
        .wrap_err("binding listener")?;
    info!(addr = ?config.listen, "Starting server");
    axum::serve(listener, app).await.wrap_err("serving app")
}

/// Reloads the key directory on SIGHUP. A directory that fails to load leaves the
/// current keys in place.
#[cfg(unix)]
async fn reload_keys_on_hangup(source: KeySource, signing: Arc<SigningService>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(err) => {
            error!(?err, "Failed to install SIGHUP handler, keys will not be reloaded");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        match source.load() {
            Ok(ring) => {
                info!(keys = ring.len(), active = ?ring.active_kid(), "Reloaded signing keys");
                signing.rotate(ring);
            }
            Err(err) => error!(?err, "Failed to reload signing keys"),
        }
    }
}

fn app(state: AppState, signing: Arc<SigningService>) -> Router {
    let mut app = Router::<AppState>::new()
        .route("/style.css", get(style_css))
        .route("/", get(root))
        .route("/logout", post(logout))
        .route(&state.settings.login_path, get(login));

    if let Some(publication) = &state.publication {
        let views = ViewChain::new(Vec::new());
        app = app.merge(publish::routes(
            publication,
            Arc::new(KeyPublication::new(signing, views)),
        ));
    }

    app.with_state(state)
}

async fn style_css() -> impl IntoResponse {
    let header = [(
        axum::http::header::CONTENT_TYPE,
        axum::http::HeaderValue::from_static("text/css; charset=utf-8"),
    )];
    (header, include_str!("../templates/style.css"))
}

async fn root(
    State(state): State<AppState>,
    ExistingSession(session): ExistingSession,
) -> Result<Response, Response> {
    #[derive(askama::Template)]
    #[template(path = "index.html")]
    struct Data<'a> {
        signed_in: bool,
        login_path: &'a str,
        client_id: &'a str,
        authorization_endpoint: &'a str,
        token_endpoint: &'a str,
        provider_urls: Vec<(&'static str, String)>,
        jwk_path: Option<&'a str>,
        x509_path: Option<&'a str>,
    }

    let id_token = match &session {
        Some(session) => session::get_attribute(&state.db, session, ID_TOKEN_SESSION_KEY)
            .await
            .map_err(|err| {
                error!(?err, "Error fetching session attribute");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })?,
        None => None,
    };

    let page = Data {
        signed_in: id_token.is_some(),
        login_path: &state.settings.login_path,
        client_id: state.config.client_id(),
        authorization_endpoint: state.config.authorization_endpoint_url().as_str(),
        token_endpoint: state.config.token_endpoint_url().as_str(),
        provider_urls: state.config.provider_key_urls(),
        jwk_path: state.publication.as_ref().map(|p| p.jwk_path.as_str()),
        x509_path: state.publication.as_ref().map(|p| p.x509_path.as_str()),
    }
    .render()
    .map_err(|err| {
        error!(?err, "Failed to render index page");
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })?;

    Ok(Html(page).into_response())
}

async fn login(
    State(state): State<AppState>,
    session: BrowserSession,
    jar: CookieJar,
    OriginalUri(uri): OriginalUri,
    Query(params): Query<CallbackParams>,
) -> Response {
    let (session, jar) = session.attach(jar);
    let ctx = RequestContext::from_uri(&uri);

    match state
        .flow
        .attempt_authentication(&state.db, &session, &ctx, &params)
        .await
    {
        Ok(FlowOutcome::Redirect(url)) => (jar, Redirect::to(url.as_str())).into_response(),
        Ok(FlowOutcome::Authenticated(authentication)) => {
            info!(
                expires_in = ?authentication.tokens.expires_in,
                "User signed in"
            );
            (jar, Redirect::to("/")).into_response()
        }
        Err(err) => {
            warn!(kind = err.kind(), %err, "Authentication attempt failed");
            (jar, err).into_response()
        }
    }
}

async fn logout(
    State(state): State<AppState>,
    ExistingSession(session): ExistingSession,
) -> Result<Response, Response> {
    let Some(session) = session else {
        return Ok(Redirect::to("/").into_response());
    };

    for name in [
        ID_TOKEN_SESSION_KEY,
        ID_TOKEN_NONCE_SESSION_KEY,
        ACCESS_TOKEN_SESSION_KEY,
    ] {
        session::remove_attribute(&state.db, &session, name)
            .await
            .map_err(|err| {
                error!(?err, "Error clearing session for logout");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            })?;
    }

    Ok(Redirect::to("/").into_response())
}
