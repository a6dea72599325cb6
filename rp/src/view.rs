//! Named views for the published keys.
//!
//! Resolution walks an explicit priority list. The key views sit at the head of it,
//! so the two names they own are never answered by a catch-all further down.

use std::sync::Arc;

use color_eyre::{Result, eyre::Context};

use crate::publish::PublishedKeys;

pub const JWK_KEY_LIST_VIEW: &str = "jwkKeyList";
pub const X509_CERTS_VIEW: &str = "x509certs";

pub trait KeyView: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn render(&self, keys: &PublishedKeys) -> Result<String>;
}

pub trait ViewResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn KeyView>>;
}

// https://datatracker.ietf.org/doc/html/rfc7517#section-8.5.1
pub struct JwkSetView;

impl KeyView for JwkSetView {
    fn content_type(&self) -> &'static str {
        "application/jwk-set+json"
    }

    fn render(&self, keys: &PublishedKeys) -> Result<String> {
        serde_json::to_string_pretty(&keys.jwk_set()).wrap_err("serializing JWK set")
    }
}

pub struct X509ChainView;

impl KeyView for X509ChainView {
    fn content_type(&self) -> &'static str {
        "application/x-pem-file"
    }

    fn render(&self, keys: &PublishedKeys) -> Result<String> {
        keys.pem_bundle()
    }
}

/// Knows `jwkKeyList` and `x509certs`, nothing else.
pub struct JwkViewResolver {
    jwk: Arc<dyn KeyView>,
    x509: Arc<dyn KeyView>,
}

impl JwkViewResolver {
    pub fn new() -> Self {
        Self {
            jwk: Arc::new(JwkSetView),
            x509: Arc::new(X509ChainView),
        }
    }
}

impl Default for JwkViewResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ViewResolver for JwkViewResolver {
    fn resolve(&self, name: &str) -> Option<Arc<dyn KeyView>> {
        match name {
            JWK_KEY_LIST_VIEW => Some(self.jwk.clone()),
            X509_CERTS_VIEW => Some(self.x509.clone()),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct ViewChain {
    resolvers: Vec<Arc<dyn ViewResolver>>,
}

impl ViewChain {
    /// `resolvers` are consulted in order.
    pub fn new(resolvers: Vec<Arc<dyn ViewResolver>>) -> Self {
        Self { resolvers }
    }

    pub fn with_highest_precedence(mut self, resolver: Arc<dyn ViewResolver>) -> Self {
        self.resolvers.insert(0, resolver);
        self
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn KeyView>> {
        self.resolvers
            .iter()
            .find_map(|resolver| resolver.resolve(name))
    }
}
