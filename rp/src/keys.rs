use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use arc_swap::ArcSwap;
use base64::{Engine, prelude::BASE64_URL_SAFE_NO_PAD};
use color_eyre::{
    Result,
    eyre::{Context, bail, eyre},
};
use pem_rfc7468::LineEnding;
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::DecodePrivateKey,
    signature::{RandomizedSigner, SignatureEncoding},
};
use serde::Serialize;
use serde_json::json;
use tracing::warn;

use crate::error::AuthError;

const CERTIFICATE_LABEL: &str = "CERTIFICATE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SigningAlgorithm {
    Rs256,
    Rs384,
    Rs512,
}

impl SigningAlgorithm {
    pub fn name(self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
            SigningAlgorithm::Rs384 => "RS384",
            SigningAlgorithm::Rs512 => "RS512",
        }
    }
}

impl FromStr for SigningAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RS256" => Ok(SigningAlgorithm::Rs256),
            "RS384" => Ok(SigningAlgorithm::Rs384),
            "RS512" => Ok(SigningAlgorithm::Rs512),
            other => Err(format!(
                "unsupported signing algorithm {other:?}, expected RS256, RS384 or RS512"
            )),
        }
    }
}

/// A private key together with the certificate chain that vouches for it.
pub struct Signer {
    kid: String,
    algorithm: SigningAlgorithm,
    key: RsaPrivateKey,
    /// DER encoded, leaf first.
    certificate_chain: Vec<Vec<u8>>,
}

impl Signer {
    pub fn new(
        kid: impl Into<String>,
        algorithm: SigningAlgorithm,
        key: RsaPrivateKey,
        certificate_chain: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            kid: kid.into(),
            algorithm,
            key,
            certificate_chain,
        }
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.key.to_public_key()
    }

    pub fn certificate_chain(&self) -> &[Vec<u8>] {
        &self.certificate_chain
    }

    fn sign(&self, payload: &[u8]) -> Vec<u8> {
        use rsa::pkcs1v15::SigningKey;
        use rsa::sha2::{Sha256, Sha384, Sha512};

        let mut rng = rand_core::OsRng;
        match self.algorithm {
            SigningAlgorithm::Rs256 => SigningKey::<Sha256>::new(self.key.clone())
                .sign_with_rng(&mut rng, payload)
                .to_bytes()
                .to_vec(),
            SigningAlgorithm::Rs384 => SigningKey::<Sha384>::new(self.key.clone())
                .sign_with_rng(&mut rng, payload)
                .to_bytes()
                .to_vec(),
            SigningAlgorithm::Rs512 => SigningKey::<Sha512>::new(self.key.clone())
                .sign_with_rng(&mut rng, payload)
                .to_bytes()
                .to_vec(),
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("kid", &self.kid)
            .field("algorithm", &self.algorithm)
            .field("certificates", &self.certificate_chain.len())
            .finish_non_exhaustive()
    }
}

/// One committed version of the signer registry.
#[derive(Debug, Default)]
pub struct KeyRing {
    active: Option<String>,
    signers: BTreeMap<String, Arc<Signer>>,
}

impl KeyRing {
    /// Without an explicit `active` key id the first key id in sort order signs.
    pub fn new(signers: impl IntoIterator<Item = Signer>, active: Option<String>) -> Self {
        let signers = signers
            .into_iter()
            .map(|signer| (signer.kid.clone(), Arc::new(signer)))
            .collect::<BTreeMap<_, _>>();
        let active = active.or_else(|| signers.keys().next().cloned());
        Self { active, signers }
    }

    pub fn active_kid(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_signer(&self) -> Option<&Arc<Signer>> {
        self.signers.get(self.active.as_deref()?)
    }

    pub fn signers(&self) -> &BTreeMap<String, Arc<Signer>> {
        &self.signers
    }

    pub fn len(&self) -> usize {
        self.signers.len()
    }
}

/// A compact JWS. Only [`SigningService::sign_jwt`] creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedJwt(String);

impl SignedJwt {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Holds the relying party's signing keys.
///
/// Readers get the snapshot that was current when they asked, rotation swaps in a
/// whole new [`KeyRing`] without waiting for readers.
pub struct SigningService {
    ring: ArcSwap<KeyRing>,
}

impl SigningService {
    pub fn new(ring: KeyRing) -> Self {
        Self {
            ring: ArcSwap::from_pointee(ring),
        }
    }

    pub fn all_signers(&self) -> Arc<KeyRing> {
        self.ring.load_full()
    }

    pub fn rotate(&self, ring: KeyRing) {
        self.ring.store(Arc::new(ring));
    }

    pub fn sign_jwt<T: Serialize>(&self, claims: &T) -> Result<SignedJwt, AuthError> {
        let ring = self.ring.load();
        let Some(signer) = ring.active_signer() else {
            return Err(AuthError::SigningUnavailable);
        };

        // https://datatracker.ietf.org/doc/html/rfc7515#section-7.1
        let header = BASE64_URL_SAFE_NO_PAD.encode(
            serde_json::to_string(&json!({
                "typ": "JWT",
                "alg": signer.algorithm.name(),
                "kid": signer.kid(),
            }))
            .wrap_err("serializing JWT header")?,
        );
        let body = BASE64_URL_SAFE_NO_PAD
            .encode(serde_json::to_string(claims).wrap_err("serializing JWT claims")?);

        let payload = format!("{header}.{body}");
        let signature = BASE64_URL_SAFE_NO_PAD.encode(signer.sign(payload.as_bytes()));

        Ok(SignedJwt(format!("{payload}.{signature}")))
    }
}

/// Where signing keys are read from, kept around so they can be reloaded.
#[derive(Debug, Clone)]
pub struct KeySource {
    pub dir: PathBuf,
    pub algorithm: SigningAlgorithm,
    pub active: Option<String>,
}

impl KeySource {
    pub fn load(&self) -> Result<KeyRing> {
        if !self.dir.exists() {
            warn!(dir = ?self.dir, "Key directory does not exist, no signing keys loaded");
            return Ok(KeyRing::default());
        }

        let mut signers = Vec::new();
        let entries = std::fs::read_dir(&self.dir)
            .wrap_err_with(|| format!("reading key directory {}", self.dir.display()))?;
        for entry in entries {
            let path = entry.wrap_err("reading key directory entry")?.path();
            let Some(kid) = path
                .file_name()
                .and_then(|name| name.to_str())
                .and_then(|name| name.strip_suffix(".key.pem"))
            else {
                continue;
            };
            let certificate = self.dir.join(format!("{kid}.cert.pem"));
            signers.push(load_signer(kid, self.algorithm, &path, &certificate)?);
        }

        if let Some(active) = &self.active {
            if !signers.iter().any(|signer| &signer.kid == active) {
                bail!("active key {active:?} not found in {}", self.dir.display());
            }
        }

        Ok(KeyRing::new(signers, self.active.clone()))
    }
}

fn load_signer(
    kid: &str,
    algorithm: SigningAlgorithm,
    key_path: &Path,
    certificate_path: &Path,
) -> Result<Signer> {
    let key_pem = std::fs::read_to_string(key_path)
        .wrap_err_with(|| format!("reading private key {}", key_path.display()))?;
    let key = RsaPrivateKey::from_pkcs8_pem(&key_pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&key_pem))
        .wrap_err_with(|| format!("parsing private key {}", key_path.display()))?;

    let certificate_pem = std::fs::read_to_string(certificate_path)
        .wrap_err_with(|| format!("reading certificate {}", certificate_path.display()))?;
    let certificate_chain = decode_certificate_chain(&certificate_pem)
        .wrap_err_with(|| format!("parsing certificate {}", certificate_path.display()))?;

    Ok(Signer::new(kid, algorithm, key, certificate_chain))
}

/// Every `CERTIFICATE` block in `pem`, in file order.
pub fn decode_certificate_chain(pem: &str) -> Result<Vec<Vec<u8>>> {
    let chain = rustls_pemfile::certs(&mut pem.as_bytes())
        .map(|certificate| certificate.map(|der| der.as_ref().to_vec()))
        .collect::<Result<Vec<_>, _>>()
        .wrap_err("decoding certificate PEM")?;

    if chain.is_empty() {
        bail!("no certificate found");
    }
    Ok(chain)
}

// https://datatracker.ietf.org/doc/html/rfc7468#section-5.1
pub fn encode_certificate(der: &[u8]) -> Result<String> {
    let mut pem = pem_rfc7468::encode_string(CERTIFICATE_LABEL, LineEnding::LF, der)
        .map_err(|err| eyre!("encoding certificate PEM: {err}"))?;
    if !pem.ends_with('\n') {
        pem.push('\n');
    }
    Ok(pem)
}
