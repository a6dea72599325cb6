//! Publication of the relying party's public keys.
//!
//! Every request reads the signer registry as it is right now, so a rotated key shows
//! up on the next fetch. An empty registry publishes an empty document.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Router,
    extract::State,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use base64::{
    Engine,
    prelude::{BASE64_STANDARD, BASE64_URL_SAFE_NO_PAD},
};
use color_eyre::Result;
use rsa::{RsaPublicKey, sha2::Sha256, traits::PublicKeyParts};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{error, warn};

use crate::{
    config::KeyPublicationConfig,
    keys::{self, Signer, SigningAlgorithm, SigningService},
    view::{JWK_KEY_LIST_VIEW, JwkViewResolver, ViewChain, X509_CERTS_VIEW},
};

#[derive(Debug, Clone)]
pub struct PublicKeyMaterial {
    pub kid: String,
    pub algorithm: SigningAlgorithm,
    pub public_key: RsaPublicKey,
    pub certificate_chain: Vec<Vec<u8>>,
}

impl PublicKeyMaterial {
    fn from_signer(signer: &Signer) -> Self {
        Self {
            kid: signer.kid().to_owned(),
            algorithm: signer.algorithm(),
            public_key: signer.public_key(),
            certificate_chain: signer.certificate_chain().to_vec(),
        }
    }

    // https://datatracker.ietf.org/doc/html/rfc7517#section-4
    pub fn to_jwk(&self) -> Jwk {
        let leaf = self.certificate_chain.first();

        Jwk {
            kty: "RSA".to_owned(),
            key_use: "sig".to_owned(),
            alg: self.algorithm.name().to_owned(),
            kid: self.kid.clone(),
            n: BASE64_URL_SAFE_NO_PAD.encode(self.public_key.n().to_bytes_be()),
            e: BASE64_URL_SAFE_NO_PAD.encode(self.public_key.e().to_bytes_be()),
            x5c: self
                .certificate_chain
                .iter()
                .map(|der| BASE64_STANDARD.encode(der))
                .collect(),
            x5t: leaf.map(|der| BASE64_URL_SAFE_NO_PAD.encode(Sha1::digest(der))),
            x5t_s256: leaf.map(|der| BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(der))),
        }
    }

    /// The certificate chain as PEM, preceded by a line naming the key.
    pub fn to_pem(&self) -> Result<String> {
        let mut pem = format!("kid: {}\n", self.kid);
        for der in &self.certificate_chain {
            pem.push_str(&keys::encode_certificate(der)?);
        }
        Ok(pem)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub kid: String,
    pub n: String,
    pub e: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub x5c: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x5t: Option<String>,
    #[serde(rename = "x5t#S256", default, skip_serializing_if = "Option::is_none")]
    pub x5t_s256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

/// Snapshot of the published keys, by key id.
#[derive(Debug, Clone, Default)]
pub struct PublishedKeys {
    pub keys: BTreeMap<String, PublicKeyMaterial>,
}

impl PublishedKeys {
    pub fn jwk_set(&self) -> JwkSet {
        JwkSet {
            keys: self.keys.values().map(PublicKeyMaterial::to_jwk).collect(),
        }
    }

    pub fn pem_bundle(&self) -> Result<String> {
        self.keys.values().map(PublicKeyMaterial::to_pem).collect()
    }
}

pub struct KeyPublisher {
    signing: Arc<SigningService>,
}

impl KeyPublisher {
    pub fn new(signing: Arc<SigningService>) -> Self {
        Self { signing }
    }

    pub fn publish_keys(&self) -> PublishedKeys {
        let ring = self.signing.all_signers();
        PublishedKeys {
            keys: ring
                .signers()
                .iter()
                .map(|(kid, signer)| (kid.clone(), PublicKeyMaterial::from_signer(signer)))
                .collect(),
        }
    }
}

/// The publication endpoint together with the views it renders through.
pub struct KeyPublication {
    publisher: KeyPublisher,
    views: ViewChain,
}

impl KeyPublication {
    /// Installs the key views ahead of everything already in `views`.
    pub fn new(signing: Arc<SigningService>, views: ViewChain) -> Self {
        Self {
            publisher: KeyPublisher::new(signing),
            views: views.with_highest_precedence(Arc::new(JwkViewResolver::new())),
        }
    }

    pub fn render(&self, view_name: &str) -> Response {
        let Some(view) = self.views.resolve(view_name) else {
            warn!(view_name, "No view registered for key publication");
            return StatusCode::NOT_FOUND.into_response();
        };

        let keys = self.publisher.publish_keys();
        match view.render(&keys) {
            Ok(body) => (
                [(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(view.content_type()),
                )],
                body,
            )
                .into_response(),
            Err(err) => {
                error!(?err, view_name, "Failed to render published keys");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        }
    }
}

pub fn routes<S>(config: &KeyPublicationConfig, publication: Arc<KeyPublication>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new()
        .route(&config.jwk_path, get(publish_jwk))
        .route(&config.x509_path, get(publish_x509))
        .with_state(publication)
}

async fn publish_jwk(State(publication): State<Arc<KeyPublication>>) -> Response {
    publication.render(JWK_KEY_LIST_VIEW)
}

async fn publish_x509(State(publication): State<Arc<KeyPublication>>) -> Response {
    publication.render(X509_CERTS_VIEW)
}
