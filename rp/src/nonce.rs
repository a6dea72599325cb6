//! Nonce and state values and the pending authorization they belong to.

use color_eyre::Result;
use rand_core::RngCore;

use crate::{
    Db,
    session::{self, AttributeBatch, SessionId},
};

pub const NONCE_SESSION_KEY: &str = "oidc_nonce";
pub const STATE_SESSION_KEY: &str = "oidc_state";
pub const REDIRECT_URI_SESSION_KEY: &str = "oidc_redirect_uri";

const TOKEN_BYTES: usize = 32;

pub fn generate_token() -> String {
    let mut bytes = [0_u8; TOKEN_BYTES];
    rand_core::OsRng.fill_bytes(&mut bytes);
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
}

/// Generates a fresh nonce and binds it to the batch's session.
///
/// An unconsumed nonce from an earlier attempt is overwritten, which voids that attempt.
pub async fn create_nonce(batch: &mut AttributeBatch<'_>) -> Result<String> {
    let nonce = generate_token();
    batch.set(NONCE_SESSION_KEY, &nonce).await?;
    Ok(nonce)
}

/// Like [`create_nonce`], for the `state` parameter.
pub async fn create_state(batch: &mut AttributeBatch<'_>) -> Result<String> {
    let state = generate_token();
    batch.set(STATE_SESSION_KEY, &state).await?;
    Ok(state)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBinding {
    pub nonce: String,
    pub state: String,
    pub redirect_uri: String,
}

/// Removes the pending authorization from the session and returns it.
///
/// Returns `None` when no complete binding was pending. Either way nothing is left behind.
pub async fn take_pending_binding(db: &Db, session: &SessionId) -> Result<Option<PendingBinding>> {
    let mut taken = session::take_attributes(
        db,
        session,
        &[
            NONCE_SESSION_KEY,
            STATE_SESSION_KEY,
            REDIRECT_URI_SESSION_KEY,
        ],
    )
    .await?;

    let (Some(nonce), Some(state), Some(redirect_uri)) = (
        taken.remove(NONCE_SESSION_KEY),
        taken.remove(STATE_SESSION_KEY),
        taken.remove(REDIRECT_URI_SESSION_KEY),
    ) else {
        return Ok(None);
    };

    Ok(Some(PendingBinding {
        nonce,
        state,
        redirect_uri,
    }))
}
