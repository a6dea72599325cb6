use askama::Template;
use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use tracing::error;

/// Startup-time configuration problems. These never surface per request.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be supplied")]
    Missing(&'static str),
    #[error("{name} is not a valid URL")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
    #[error("{name} must be an absolute path starting with '/' without '{{' or '}}', got {value:?}")]
    InvalidPath { name: &'static str, value: String },
    #[error("{name} {path:?} is already used by the {other}")]
    PathConflict {
        name: &'static str,
        other: &'static str,
        path: String,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum TokenExchangeError {
    #[error("token endpoint could not be reached")]
    Transport(#[from] reqwest::Error),
    #[error("token endpoint rejected the code: {error}")]
    Rejected {
        error: String,
        description: Option<String>,
    },
    #[error("token endpoint answered with status {status}")]
    Status { status: reqwest::StatusCode },
    #[error("token endpoint response is not a token response")]
    Decode(#[from] serde_json::Error),
}

/// Per-attempt failures of the authorization flow.
///
/// Every variant ends the attempt and is rendered as an authentication failure page.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("no signing key is available to sign the request object")]
    SigningUnavailable,
    #[error("callback does not match a pending authorization request")]
    InvalidState,
    #[error(transparent)]
    TokenExchange(#[from] TokenExchangeError),
    #[error("identity provider returned error {error:?}")]
    ProviderError {
        error: String,
        description: Option<String>,
    },
    #[error("internal error: {0:#}")]
    Internal(color_eyre::Report),
}

impl From<color_eyre::Report> for AuthError {
    fn from(report: color_eyre::Report) -> Self {
        AuthError::Internal(report)
    }
}

impl AuthError {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::SigningUnavailable => "signing_unavailable",
            AuthError::InvalidState => "invalid_state",
            AuthError::TokenExchange(_) => "token_exchange_failed",
            AuthError::ProviderError { .. } => "provider_error",
            AuthError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::InvalidState | AuthError::ProviderError { .. } => StatusCode::UNAUTHORIZED,
            AuthError::TokenExchange(_) => StatusCode::BAD_GATEWAY,
            AuthError::SigningUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AuthError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(askama::Template)]
#[template(path = "auth-failure.html")]
struct AuthFailureTemplate {
    kind: &'static str,
    provider_error: Option<String>,
    provider_description: Option<String>,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (provider_error, provider_description) = match &self {
            AuthError::ProviderError { error, description } => {
                (Some(error.clone()), description.clone())
            }
            _ => (None, None),
        };

        let page = AuthFailureTemplate {
            kind: self.kind(),
            provider_error,
            provider_description,
        }
        .render();

        match page {
            Ok(page) => (status, Html(page)).into_response(),
            Err(err) => {
                error!(?err, "Failed to render authentication failure page");
                status.into_response()
            }
        }
    }
}
