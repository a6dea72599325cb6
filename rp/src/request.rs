use std::sync::Arc;

use axum::http::Uri;
use color_eyre::eyre::Context;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    Db,
    config::{ClientSettings, ServerConfiguration},
    error::AuthError,
    keys::{SignedJwt, SigningService},
    nonce::{self, REDIRECT_URI_SESSION_KEY},
    session::{AttributeBatch, SessionId},
};

/// The part of the incoming request the redirect URI is derived from.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub path: String,
}

impl RequestContext {
    pub fn from_uri(uri: &Uri) -> Self {
        Self {
            path: uri.path().to_owned(),
        }
    }
}

/// Claims of the request object, serialized in declaration order.
// https://datatracker.ietf.org/doc/html/rfc9101#section-4
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestClaims {
    pub response_type: String,
    pub client_id: String,
    pub scope: String,
    pub redirect_uri: String,
    pub nonce: String,
    pub state: String,
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
}

#[derive(Debug, Clone)]
pub struct SignedRequestObject {
    jwt: SignedJwt,
    claims: RequestClaims,
}

impl SignedRequestObject {
    pub fn as_str(&self) -> &str {
        self.jwt.as_str()
    }

    pub fn claims(&self) -> &RequestClaims {
        &self.claims
    }
}

pub struct RequestBuilder {
    config: Arc<ServerConfiguration>,
    settings: Arc<ClientSettings>,
    signing: Arc<SigningService>,
}

impl RequestBuilder {
    pub fn new(
        config: Arc<ServerConfiguration>,
        settings: Arc<ClientSettings>,
        signing: Arc<SigningService>,
    ) -> Self {
        Self {
            config,
            settings,
            signing,
        }
    }

    pub fn redirect_uri(&self, ctx: &RequestContext) -> Result<Url, AuthError> {
        let mut redirect_uri = self
            .settings
            .base_url
            .join(&ctx.path)
            .wrap_err("building redirect URI")?;
        redirect_uri.set_query(None);
        redirect_uri.set_fragment(None);
        Ok(redirect_uri)
    }

    /// Builds and signs a request object, binding its nonce, state and redirect URI
    /// to the session.
    ///
    /// When signing is impossible the binding is removed again and
    /// [`AuthError::SigningUnavailable`] is returned.
    pub async fn build(
        &self,
        db: &Db,
        session: &SessionId,
        ctx: &RequestContext,
    ) -> Result<SignedRequestObject, AuthError> {
        let redirect_uri = self.redirect_uri(ctx)?;

        let mut binding = AttributeBatch::begin(db, session).await?;
        binding
            .set(REDIRECT_URI_SESSION_KEY, redirect_uri.as_str())
            .await?;
        let nonce = nonce::create_nonce(&mut binding).await?;
        let state = nonce::create_state(&mut binding).await?;
        binding.commit().await?;

        let now = jiff::Timestamp::now().as_second();
        let lifetime = i64::try_from(self.settings.request_object_lifetime.as_secs())
            .unwrap_or(i64::MAX);

        let claims = RequestClaims {
            response_type: "code".to_owned(),
            client_id: self.config.client_id().to_owned(),
            scope: self.settings.scope.clone(),
            redirect_uri: redirect_uri.into(),
            nonce,
            state,
            iss: self.config.client_id().to_owned(),
            aud: self.config.issuer().map(str::to_owned),
            iat: now,
            exp: now.saturating_add(lifetime),
            jti: nonce::generate_token(),
        };

        let jwt = match self.signing.sign_jwt(&claims) {
            Ok(jwt) => jwt,
            Err(err) => {
                nonce::take_pending_binding(db, session).await?;
                return Err(err);
            }
        };

        Ok(SignedRequestObject { jwt, claims })
    }
}
