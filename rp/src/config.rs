use std::{fmt, net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use url::Url;

use crate::{error::ConfigError, keys::SigningAlgorithm};

#[derive(Debug, Parser)]
#[command(version, about = "OpenID Connect relying party using signed request objects")]
pub struct Args {
    #[arg(long, env = "RP_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    #[arg(long, env = "RP_DATABASE", default_value = "rp.sqlite")]
    pub database: String,

    /// Externally visible URL of this service, redirect URIs are built from it.
    #[arg(long, env = "RP_BASE_URL", default_value = "http://localhost:3000")]
    pub base_url: Url,

    #[arg(long, env = "RP_LOGIN_PATH", default_value = "/openid_connect_login")]
    pub login_path: String,

    #[arg(long, env = "RP_SCOPE", default_value = "openid")]
    pub scope: String,

    #[arg(long, env = "RP_AUTHORIZATION_ENDPOINT")]
    pub authorization_endpoint: Option<String>,

    #[arg(long, env = "RP_TOKEN_ENDPOINT")]
    pub token_endpoint: Option<String>,

    #[arg(long, env = "RP_CLIENT_ID")]
    pub client_id: Option<String>,

    #[arg(long, env = "RP_CLIENT_SECRET", hide_env_values = true)]
    pub client_secret: Option<String>,

    /// Issuer identifier of the provider, used as the request object audience.
    #[arg(long, env = "RP_ISSUER")]
    pub issuer: Option<String>,

    #[arg(long, env = "RP_X509_SIGNING_URL")]
    pub x509_signing_url: Option<String>,

    #[arg(long, env = "RP_X509_ENCRYPT_URL")]
    pub x509_encrypt_url: Option<String>,

    #[arg(long, env = "RP_JWK_SIGNING_URL")]
    pub jwk_signing_url: Option<String>,

    #[arg(long, env = "RP_JWK_ENCRYPT_URL")]
    pub jwk_encrypt_url: Option<String>,

    #[arg(long, env = "RP_USERINFO_URL")]
    pub userinfo_url: Option<String>,

    /// Directory holding `<kid>.key.pem` / `<kid>.cert.pem` pairs.
    #[arg(long, env = "RP_KEYS_DIR", default_value = "keys")]
    pub keys_dir: PathBuf,

    /// Key used for signing request objects. Defaults to the first key id in sort order.
    #[arg(long, env = "RP_ACTIVE_KID")]
    pub active_kid: Option<String>,

    #[arg(long, env = "RP_SIGNING_ALGORITHM", default_value = "RS256")]
    pub signing_algorithm: SigningAlgorithm,

    /// Path on which the public keys are published as a JWK Set. Unset disables publication.
    #[arg(long, env = "RP_JWK_PUBLISH_URL")]
    pub jwk_publish_url: Option<String>,

    /// Path for the X.509 certificate form, defaults to `<jwk-publish-url>/x509`.
    #[arg(long, env = "RP_X509_PUBLISH_URL")]
    pub x509_publish_url: Option<String>,

    #[arg(
        long,
        env = "RP_TOKEN_TIMEOUT_SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub token_timeout_secs: u64,

    #[arg(long, env = "RP_REQUEST_OBJECT_LIFETIME_SECS", default_value_t = 300)]
    pub request_object_lifetime_secs: u64,
}

pub struct Config {
    pub listen: SocketAddr,
    pub database: String,
    pub keys_dir: PathBuf,
    pub active_kid: Option<String>,
    pub signing_algorithm: SigningAlgorithm,
    pub server: ServerConfiguration,
    pub client: ClientSettings,
    pub publication: Option<KeyPublicationConfig>,
}

impl Args {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let server = ServerConfiguration::from_args(&self)?;
        let client = ClientSettings::from_args(&self)?;
        let publication = KeyPublicationConfig::from_args(&self)?;
        check_routes(&client, publication.as_ref())?;

        Ok(Config {
            listen: self.listen,
            database: self.database,
            keys_dir: self.keys_dir,
            active_kid: self.active_kid.filter(|kid| !kid.trim().is_empty()),
            signing_algorithm: self.signing_algorithm,
            server,
            client,
            publication,
        })
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|value| !value.is_empty())
}

fn required(value: &Option<String>, name: &'static str) -> Result<String, ConfigError> {
    non_blank(value)
        .map(str::to_owned)
        .ok_or(ConfigError::Missing(name))
}

fn parse_url(value: &str, name: &'static str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|source| ConfigError::InvalidUrl { name, source })
}

fn absolute_path(value: &str, name: &'static str) -> Result<String, ConfigError> {
    if !value.starts_with('/') || value.contains(['{', '}']) {
        return Err(ConfigError::InvalidPath {
            name,
            value: value.to_owned(),
        });
    }
    match value.trim_end_matches('/') {
        "" => Ok("/".to_owned()),
        path => Ok(path.to_owned()),
    }
}

/// Routes the service always serves, whatever the configuration says.
pub const FIXED_ROUTES: [&str; 3] = ["/", "/logout", "/style.css"];

/// Every configurable path has to be a route of its own.
fn check_routes(
    client: &ClientSettings,
    publication: Option<&KeyPublicationConfig>,
) -> Result<(), ConfigError> {
    let mut taken = FIXED_ROUTES
        .iter()
        .map(|path| ("built-in route", *path))
        .collect::<Vec<_>>();

    let mut configured = vec![("login path", client.login_path.as_str())];
    if let Some(publication) = publication {
        configured.push(("key publish path", publication.jwk_path.as_str()));
        configured.push(("X.509 publish path", publication.x509_path.as_str()));
    }

    for (name, path) in configured {
        if let Some(&(other, _)) = taken.iter().find(|(_, used)| *used == path) {
            return Err(ConfigError::PathConflict {
                name,
                other,
                path: path.to_owned(),
            });
        }
        taken.push((name, path));
    }
    Ok(())
}

/// The identity provider this relying party talks to.
///
/// Validated once at startup and shared read-only afterwards.
#[derive(Clone)]
pub struct ServerConfiguration {
    authorization_endpoint_url: Url,
    token_endpoint_url: Url,
    client_id: String,
    client_secret: String,
    issuer: Option<String>,
    x509_signing_url: Option<String>,
    x509_encrypt_url: Option<String>,
    jwk_signing_url: Option<String>,
    jwk_encrypt_url: Option<String>,
    user_info_url: Option<String>,
}

impl ServerConfiguration {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let authorization_endpoint_url = parse_url(
            &required(&args.authorization_endpoint, "an authorization endpoint URL")?,
            "authorization endpoint URL",
        )?;
        let token_endpoint_url = parse_url(
            &required(&args.token_endpoint, "a token endpoint URL")?,
            "token endpoint URL",
        )?;
        let client_id = required(&args.client_id, "a client ID")?;
        let client_secret = required(&args.client_secret, "a client secret")?;

        let optional = |value: &Option<String>| non_blank(value).map(str::to_owned);

        Ok(Self {
            authorization_endpoint_url,
            token_endpoint_url,
            client_id,
            client_secret,
            issuer: optional(&args.issuer),
            x509_signing_url: optional(&args.x509_signing_url),
            x509_encrypt_url: optional(&args.x509_encrypt_url),
            jwk_signing_url: optional(&args.jwk_signing_url),
            jwk_encrypt_url: optional(&args.jwk_encrypt_url),
            user_info_url: optional(&args.userinfo_url),
        })
    }

    pub fn authorization_endpoint_url(&self) -> &Url {
        &self.authorization_endpoint_url
    }

    pub fn token_endpoint_url(&self) -> &Url {
        &self.token_endpoint_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    /// The provider's published key locations, for display.
    pub fn provider_key_urls(&self) -> Vec<(&'static str, String)> {
        [
            ("Issuer", &self.issuer),
            ("X.509 signing certificate", &self.x509_signing_url),
            ("X.509 encryption certificate", &self.x509_encrypt_url),
            ("JWK signing keys", &self.jwk_signing_url),
            ("JWK encryption keys", &self.jwk_encrypt_url),
            ("User info endpoint", &self.user_info_url),
        ]
        .into_iter()
        .filter_map(|(name, url)| url.clone().map(|url| (name, url)))
        .collect()
    }
}

impl fmt::Debug for ServerConfiguration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfiguration")
            .field("authorization_endpoint_url", &self.authorization_endpoint_url.as_str())
            .field("token_endpoint_url", &self.token_endpoint_url.as_str())
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("issuer", &self.issuer)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub base_url: Url,
    pub login_path: String,
    pub scope: String,
    pub token_timeout: Duration,
    pub request_object_lifetime: Duration,
}

impl ClientSettings {
    pub fn from_args(args: &Args) -> Result<Self, ConfigError> {
        let scope = args.scope.trim();
        if scope.is_empty() {
            return Err(ConfigError::Missing("a scope"));
        }

        Ok(Self {
            base_url: args.base_url.clone(),
            login_path: absolute_path(&args.login_path, "login path")?,
            scope: scope.to_owned(),
            token_timeout: Duration::from_secs(args.token_timeout_secs),
            request_object_lifetime: Duration::from_secs(args.request_object_lifetime_secs),
        })
    }
}

/// Present only when key publication is switched on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPublicationConfig {
    pub jwk_path: String,
    pub x509_path: String,
}

impl KeyPublicationConfig {
    pub fn from_args(args: &Args) -> Result<Option<Self>, ConfigError> {
        let Some(jwk_path) = non_blank(&args.jwk_publish_url) else {
            return Ok(None);
        };
        let jwk_path = absolute_path(jwk_path, "key publish path")?;

        let x509_path = match non_blank(&args.x509_publish_url) {
            Some(path) => absolute_path(path, "X.509 publish path")?,
            None => format!("{}/x509", jwk_path.trim_end_matches('/')),
        };

        Ok(Some(Self {
            jwk_path,
            x509_path,
        }))
    }
}
