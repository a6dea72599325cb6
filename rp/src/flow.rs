//! The authorization code flow from the relying party's side.
//!
//! Each inbound request to the login path is exactly one of three shapes, see
//! [`classify`]. Initiation redirects to the provider with a signed request object,
//! a callback consumes the pending binding and exchanges the code, and a provider
//! error ends the attempt.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};
use serde::Deserialize;
use tracing::{debug, info};
use url::Url;

use crate::{
    Db,
    config::{ClientSettings, ServerConfiguration},
    error::{AuthError, TokenExchangeError},
    keys::SigningService,
    nonce,
    request::{RequestBuilder, RequestContext},
    session::{AttributeBatch, SessionId},
};

pub const ID_TOKEN_SESSION_KEY: &str = "oidc_id_token";
pub const ACCESS_TOKEN_SESSION_KEY: &str = "oidc_access_token";
/// The nonce the stored ID token has to carry, for whoever validates it.
pub const ID_TOKEN_NONCE_SESSION_KEY: &str = "oidc_id_token_nonce";

#[derive(Debug, Default, Deserialize)]
pub struct CallbackParams {
    pub error: Option<String>,
    pub error_description: Option<String>,
    pub code: Option<String>,
    pub state: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    ProviderError {
        error: &'a str,
        description: Option<&'a str>,
    },
    Callback {
        code: &'a str,
        state: Option<&'a str>,
    },
    Initiation,
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.trim().is_empty())
}

/// `error` wins over `code`, anything else starts a new attempt.
pub fn classify(params: &CallbackParams) -> Inbound<'_> {
    if let Some(error) = non_blank(&params.error) {
        Inbound::ProviderError {
            error,
            description: non_blank(&params.error_description),
        }
    } else if let Some(code) = non_blank(&params.code) {
        Inbound::Callback {
            code,
            state: non_blank(&params.state),
        }
    } else {
        Inbound::Initiation
    }
}

// https://datatracker.ietf.org/doc/html/rfc6749#section-5.1
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug)]
pub struct Authentication {
    pub tokens: TokenResponse,
}

#[derive(Debug)]
pub enum FlowOutcome {
    Redirect(Url),
    Authenticated(Authentication),
}

pub struct FlowController {
    config: Arc<ServerConfiguration>,
    builder: RequestBuilder,
    http: reqwest::Client,
}

impl FlowController {
    pub fn new(
        config: Arc<ServerConfiguration>,
        settings: Arc<ClientSettings>,
        signing: Arc<SigningService>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.token_timeout)
            .build()
            .wrap_err("building HTTP client")?;

        Ok(Self {
            builder: RequestBuilder::new(config.clone(), settings, signing),
            config,
            http,
        })
    }

    pub async fn attempt_authentication(
        &self,
        db: &Db,
        session: &SessionId,
        ctx: &RequestContext,
        params: &CallbackParams,
    ) -> Result<FlowOutcome, AuthError> {
        match classify(params) {
            Inbound::ProviderError { error, description } => {
                nonce::take_pending_binding(db, session).await?;
                Err(AuthError::ProviderError {
                    error: error.to_owned(),
                    description: description.map(str::to_owned),
                })
            }
            Inbound::Callback { code, state } => self
                .handle_authorization_grant(db, session, code, state)
                .await
                .map(FlowOutcome::Authenticated),
            Inbound::Initiation => self
                .handle_authorization_request(db, session, ctx)
                .await
                .map(FlowOutcome::Redirect),
        }
    }

    async fn handle_authorization_request(
        &self,
        db: &Db,
        session: &SessionId,
        ctx: &RequestContext,
    ) -> Result<Url, AuthError> {
        let request = self.builder.build(db, session, ctx).await?;

        let mut auth_request = self.config.authorization_endpoint_url().clone();
        auth_request
            .query_pairs_mut()
            .append_pair("request", request.as_str());

        debug!(jti = %request.claims().jti, "Redirecting to authorization endpoint");
        Ok(auth_request)
    }

    async fn handle_authorization_grant(
        &self,
        db: &Db,
        session: &SessionId,
        code: &str,
        state: Option<&str>,
    ) -> Result<Authentication, AuthError> {
        // Taken before anything else so a replayed callback finds nothing.
        let Some(binding) = nonce::take_pending_binding(db, session).await? else {
            return Err(AuthError::InvalidState);
        };
        if state != Some(binding.state.as_str()) {
            return Err(AuthError::InvalidState);
        }

        let tokens = self.exchange_code(code, &binding.redirect_uri).await?;

        let mut signed_in = AttributeBatch::begin(db, session).await?;
        signed_in
            .set(ACCESS_TOKEN_SESSION_KEY, &tokens.access_token)
            .await?;
        if let Some(id_token) = &tokens.id_token {
            signed_in.set(ID_TOKEN_SESSION_KEY, id_token).await?;
            signed_in
                .set(ID_TOKEN_NONCE_SESSION_KEY, &binding.nonce)
                .await?;
        }
        signed_in.commit().await?;

        info!(
            token_type = %tokens.token_type,
            refresh_token = tokens.refresh_token.is_some(),
            "Authorization code exchanged"
        );
        Ok(Authentication { tokens })
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, TokenExchangeError> {
        let response = self
            .http
            .post(self.config.token_endpoint_url().clone())
            .basic_auth(self.config.client_id(), Some(self.config.client_secret()))
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", redirect_uri),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<TokenErrorResponse>(&body) {
                Ok(rejection) => TokenExchangeError::Rejected {
                    error: rejection.error,
                    description: rejection.error_description,
                },
                Err(_) => TokenExchangeError::Status { status },
            });
        }

        Ok(serde_json::from_slice(&body)?)
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
    use serde_json::json;

    use super::{
        ACCESS_TOKEN_SESSION_KEY, CallbackParams, FlowController, FlowOutcome,
        ID_TOKEN_NONCE_SESSION_KEY, ID_TOKEN_SESSION_KEY, Inbound, classify,
    };
    use crate::{
        error::{AuthError, TokenExchangeError},
        nonce,
        request::{RequestClaims, RequestContext},
        session,
        testing::{self, FakeTokenEndpoint, spawn_token_endpoint, unreachable_token_endpoint},
    };

    fn params(pairs: &[(&str, &str)]) -> CallbackParams {
        let query = serde_json::Map::from_iter(
            pairs
                .iter()
                .map(|(name, value)| ((*name).to_owned(), json!(value))),
        );
        serde_json::from_value(query.into()).unwrap()
    }

    fn controller(token_endpoint: &str) -> FlowController {
        FlowController::new(
            Arc::new(testing::server_configuration(
                "https://idp/auth",
                token_endpoint,
            )),
            Arc::new(testing::client_settings()),
            Arc::new(testing::signing_service(&["k1"])),
        )
        .unwrap()
    }

    fn ctx() -> RequestContext {
        RequestContext::from_uri(&"/openid_connect_login".parse().unwrap())
    }

    /// Runs an initiation and returns the state the provider would echo back.
    async fn initiate(
        flow: &FlowController,
        db: &crate::Db,
        session: &session::SessionId,
    ) -> String {
        let outcome = flow
            .attempt_authentication(db, session, &ctx(), &CallbackParams::default())
            .await
            .unwrap();
        let url = match outcome {
            FlowOutcome::Redirect(url) => url,
            other => panic!("expected a redirect, got {other:?}"),
        };
        let request = url
            .query_pairs()
            .find(|(name, _)| name == "request")
            .unwrap()
            .1
            .into_owned();
        let payload = request.split('.').nth(1).unwrap();
        let claims: RequestClaims =
            serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        claims.state
    }

    #[test]
    fn classification_partitions_the_input() {
        assert_eq!(classify(&params(&[])), Inbound::Initiation);
        assert_eq!(classify(&params(&[("code", "  ")])), Inbound::Initiation);
        assert_eq!(
            classify(&params(&[("code", "xyz"), ("state", "s")])),
            Inbound::Callback {
                code: "xyz",
                state: Some("s")
            }
        );
        assert_eq!(
            classify(&params(&[("error", "access_denied"), ("code", "xyz")])),
            Inbound::ProviderError {
                error: "access_denied",
                description: None
            }
        );
        assert_eq!(
            classify(&params(&[("error", ""), ("code", "xyz")])),
            Inbound::Callback {
                code: "xyz",
                state: None
            }
        );
    }

    #[tokio::test]
    async fn initiation_redirects_with_single_request_parameter() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let flow = controller(&unreachable_token_endpoint().await);

        let outcome = flow
            .attempt_authentication(&db, &session, &ctx(), &CallbackParams::default())
            .await
            .unwrap();
        let url = match outcome {
            FlowOutcome::Redirect(url) => url,
            other => panic!("expected a redirect, got {other:?}"),
        };

        assert_eq!(url.origin().ascii_serialization(), "https://idp");
        assert_eq!(url.path(), "/auth");
        let pairs = url.query_pairs().collect::<Vec<_>>();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "request");

        let payload = pairs[0].1.split('.').nth(1).unwrap().to_owned();
        let claims: RequestClaims =
            serde_json::from_slice(&BASE64_URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        assert_eq!(claims.client_id, "abc");
        assert_eq!(claims.response_type, "code");
        assert_eq!(claims.scope, "openid profile");
    }

    #[tokio::test]
    async fn initiation_without_signer_fails() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let flow = FlowController::new(
            Arc::new(testing::server_configuration(
                "https://idp/auth",
                "https://idp/token",
            )),
            Arc::new(testing::client_settings()),
            Arc::new(testing::signing_service(&[])),
        )
        .unwrap();

        let err = flow
            .attempt_authentication(&db, &session, &ctx(), &CallbackParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::SigningUnavailable));
    }

    #[tokio::test]
    async fn callback_exchanges_code_once() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint::default();
        let flow = controller(&spawn_token_endpoint(endpoint.clone()).await);

        let state = initiate(&flow, &db, &session).await;
        let expected_nonce = session::get_attribute(&db, &session, nonce::NONCE_SESSION_KEY)
            .await
            .unwrap()
            .unwrap();
        let outcome = flow
            .attempt_authentication(
                &db,
                &session,
                &ctx(),
                &params(&[("code", "xyz"), ("state", state.as_str())]),
            )
            .await
            .unwrap();

        let authentication = match outcome {
            FlowOutcome::Authenticated(authentication) => authentication,
            other => panic!("expected authentication, got {other:?}"),
        };
        assert_eq!(authentication.tokens.access_token, "access");
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(*endpoint.codes.lock().unwrap(), ["xyz"]);

        assert_eq!(
            session::get_attribute(&db, &session, ID_TOKEN_SESSION_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("header.body.signature")
        );
        assert_eq!(
            session::get_attribute(&db, &session, ACCESS_TOKEN_SESSION_KEY)
                .await
                .unwrap()
                .as_deref(),
            Some("access")
        );
        assert_eq!(
            session::get_attribute(&db, &session, ID_TOKEN_NONCE_SESSION_KEY)
                .await
                .unwrap(),
            Some(expected_nonce)
        );
    }

    #[tokio::test]
    async fn replayed_callback_is_rejected() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint::default();
        let flow = controller(&spawn_token_endpoint(endpoint.clone()).await);

        let state = initiate(&flow, &db, &session).await;
        let callback = params(&[("code", "xyz"), ("state", state.as_str())]);
        flow.attempt_authentication(&db, &session, &ctx(), &callback)
            .await
            .unwrap();

        let err = flow
            .attempt_authentication(&db, &session, &ctx(), &callback)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidState));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn callback_without_pending_binding_is_rejected() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint::default();
        let flow = controller(&spawn_token_endpoint(endpoint.clone()).await);

        let err = flow
            .attempt_authentication(
                &db,
                &session,
                &ctx(),
                &params(&[("code", "xyz"), ("state", "forged")]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidState));
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn callback_with_wrong_state_is_rejected() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint::default();
        let flow = controller(&spawn_token_endpoint(endpoint.clone()).await);

        initiate(&flow, &db, &session).await;
        let err = flow
            .attempt_authentication(
                &db,
                &session,
                &ctx(),
                &params(&[("code", "xyz"), ("state", "forged")]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidState));
        assert_eq!(endpoint.calls(), 0);
        // the attempt is burnt, the real state no longer works either
        assert_eq!(nonce::take_pending_binding(&db, &session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn state_from_another_session_is_rejected() {
        let db = testing::db().await;
        let victim = session::create_session(&db).await.unwrap();
        let attacker = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint::default();
        let flow = controller(&spawn_token_endpoint(endpoint.clone()).await);

        let state = initiate(&flow, &db, &attacker).await;
        let err = flow
            .attempt_authentication(
                &db,
                &victim,
                &ctx(),
                &params(&[("code", "xyz"), ("state", state.as_str())]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AuthError::InvalidState));
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn provider_error_skips_token_exchange() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint::default();
        let flow = controller(&spawn_token_endpoint(endpoint.clone()).await);

        initiate(&flow, &db, &session).await;
        let err = flow
            .attempt_authentication(
                &db,
                &session,
                &ctx(),
                &params(&[("error", "access_denied"), ("code", "xyz")]),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AuthError::ProviderError { ref error, .. } if error == "access_denied"
        ));
        assert_eq!(endpoint.calls(), 0);
        assert_eq!(nonce::take_pending_binding(&db, &session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unreachable_token_endpoint_fails_and_clears_binding() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let flow = controller(&unreachable_token_endpoint().await);

        let state = initiate(&flow, &db, &session).await;
        let err = flow
            .attempt_authentication(
                &db,
                &session,
                &ctx(),
                &params(&[("code", "xyz"), ("state", state.as_str())]),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AuthError::TokenExchange(TokenExchangeError::Transport(_))
        ));
        assert_eq!(nonce::take_pending_binding(&db, &session).await.unwrap(), None);
        assert_eq!(
            session::get_attribute(&db, &session, ACCESS_TOKEN_SESSION_KEY)
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn rejected_code_is_reported_once() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint {
            fail: true,
            ..Default::default()
        };
        let flow = controller(&spawn_token_endpoint(endpoint.clone()).await);

        let state = initiate(&flow, &db, &session).await;
        let err = flow
            .attempt_authentication(
                &db,
                &session,
                &ctx(),
                &params(&[("code", "xyz"), ("state", state.as_str())]),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AuthError::TokenExchange(TokenExchangeError::Rejected { ref error, .. })
                if error == "invalid_grant"
        ));
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn slow_token_endpoint_times_out() {
        let db = testing::db().await;
        let session = session::create_session(&db).await.unwrap();
        let endpoint = FakeTokenEndpoint {
            delay: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        let mut settings = testing::client_settings();
        settings.token_timeout = Duration::from_secs(1);
        let flow = FlowController::new(
            Arc::new(testing::server_configuration(
                "https://idp/auth",
                &spawn_token_endpoint(endpoint.clone()).await,
            )),
            Arc::new(settings),
            Arc::new(testing::signing_service(&["k1"])),
        )
        .unwrap();

        let state = initiate(&flow, &db, &session).await;
        let started = std::time::Instant::now();
        let err = flow
            .attempt_authentication(
                &db,
                &session,
                &ctx(),
                &params(&[("code", "xyz"), ("state", state.as_str())]),
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(4));
        match err {
            AuthError::TokenExchange(TokenExchangeError::Transport(err)) => {
                assert!(err.is_timeout(), "{err:?}");
            }
            other => panic!("expected a timeout, got {other:?}"),
        }
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(nonce::take_pending_binding(&db, &session).await.unwrap(), None);
    }
}
