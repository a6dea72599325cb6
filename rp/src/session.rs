//! Browser sessions and their attributes.
//!
//! Every statement is scoped by session id, so one session can never read or change
//! another session's attributes.

use std::collections::BTreeMap;

use axum::extract::{FromRef, FromRequestParts};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use axum_extra::extract::cookie::{Cookie, Expiration, SameSite};
use color_eyre::Result;
use color_eyre::eyre::Context;
use rand_core::RngCore;
use tracing::{debug, error};

use crate::Db;

pub const SESSION_ID_COOKIE_NAME: &str = "RP_SESSION_ID";
/// How long the cookie lives. Sessions older than this are deleted.
const SESSION_LIFETIME_DAYS: i64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionId(pub String);

pub async fn create_session(db: &Db) -> Result<SessionId> {
    let mut session_id = [0_u8; 32];
    rand_core::OsRng.fill_bytes(&mut session_id);
    let session_id = format!("rpsess_{}", hex::encode(session_id));
    let now = jiff::Timestamp::now().as_millisecond();

    let expired = sqlx::query("delete from sessions where created < ?")
        .bind(now - SESSION_LIFETIME_DAYS * 24 * 60 * 60 * 1000)
        .execute(&db.pool)
        .await
        .wrap_err("deleting expired sessions")?;
    if expired.rows_affected() > 0 {
        debug!(count = expired.rows_affected(), "Deleted expired sessions");
    }

    sqlx::query("insert into sessions (session_id, created) values (?, ?)")
        .bind(&session_id)
        .bind(now)
        .execute(&db.pool)
        .await
        .wrap_err("inserting new session")?;

    Ok(SessionId(session_id))
}

pub async fn session_exists(db: &Db, session_id: &str) -> Result<bool> {
    let result =
        sqlx::query_scalar::<_, String>("select session_id from sessions where session_id = ?")
            .bind(session_id)
            .fetch_optional(&db.pool)
            .await
            .wrap_err("failed to fetch session")?;
    Ok(result.is_some())
}

pub async fn get_attribute(db: &Db, session: &SessionId, name: &str) -> Result<Option<String>> {
    sqlx::query_scalar::<_, String>(
        "select value from session_attributes where session_id = ? and name = ?",
    )
    .bind(&session.0)
    .bind(name)
    .fetch_optional(&db.pool)
    .await
    .wrap_err("failed to fetch session attribute")
}

/// Attribute writes that become visible together on [`AttributeBatch::commit`].
///
/// Dropping the batch without committing discards every write.
pub struct AttributeBatch<'s> {
    tx: sqlx::Transaction<'static, sqlx::Sqlite>,
    session: &'s SessionId,
}

impl<'s> AttributeBatch<'s> {
    pub async fn begin(db: &Db, session: &'s SessionId) -> Result<Self> {
        let tx = db.pool.begin().await.wrap_err("starting transaction")?;
        Ok(Self { tx, session })
    }

    /// Replaces any previous value stored under `name`.
    pub async fn set(&mut self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "insert into session_attributes (session_id, name, value) values (?, ?, ?) \
            on conflict (session_id, name) do update set value = excluded.value",
        )
        .bind(&self.session.0)
        .bind(name)
        .bind(value)
        .execute(&mut *self.tx)
        .await
        .wrap_err("failed to store session attribute")?;
        Ok(())
    }

    pub async fn commit(self) -> Result<()> {
        self.tx.commit().await.wrap_err("committing session attributes")
    }
}

pub async fn remove_attribute(db: &Db, session: &SessionId, name: &str) -> Result<()> {
    sqlx::query("delete from session_attributes where session_id = ? and name = ?")
        .bind(&session.0)
        .bind(name)
        .execute(&db.pool)
        .await
        .wrap_err("failed to delete session attribute")?;
    Ok(())
}

/// Removes the named attributes and returns the ones that were present.
///
/// This happens in one transaction, two concurrent takers never both see a value.
pub async fn take_attributes(
    db: &Db,
    session: &SessionId,
    names: &[&str],
) -> Result<BTreeMap<String, String>> {
    let mut tx = db.pool.begin().await.wrap_err("starting transaction")?;
    let mut taken = BTreeMap::new();

    for name in names {
        let value = sqlx::query_scalar::<_, String>(
            "delete from session_attributes where session_id = ? and name = ? returning value",
        )
        .bind(&session.0)
        .bind(*name)
        .fetch_optional(&mut *tx)
        .await
        .wrap_err("failed to take session attribute")?;

        if let Some(value) = value {
            taken.insert((*name).to_owned(), value);
        }
    }

    tx.commit().await.wrap_err("committing transaction")?;
    Ok(taken)
}

fn session_cookie(session: &SessionId) -> Cookie<'static> {
    let expires = time::OffsetDateTime::now_utc()
        .checked_add(time::Duration::days(SESSION_LIFETIME_DAYS))
        .map(Expiration::DateTime)
        .unwrap_or(Expiration::Session);

    Cookie::build((SESSION_ID_COOKIE_NAME, session.0.clone()))
        .path("/")
        .secure(true)
        .http_only(true)
        // Lax so the cookie comes along on the provider's top level redirect back.
        .same_site(SameSite::Lax)
        .expires(expires)
        .build()
}

async fn session_from_cookie(db: &Db, jar: &CookieJar) -> Result<Option<SessionId>, Response> {
    let Some(cookie) = jar.get(SESSION_ID_COOKIE_NAME) else {
        return Ok(None);
    };

    match session_exists(db, cookie.value()).await {
        Ok(true) => Ok(Some(SessionId(cookie.value().to_owned()))),
        Ok(false) => Ok(None),
        Err(err) => {
            error!(?err, "Error fetching session");
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

/// The browser's session if it already has one. Never creates a session.
#[derive(Debug)]
pub struct ExistingSession(pub Option<SessionId>);

impl<S> FromRequestParts<S> for ExistingSession
where
    Db: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let db = Db::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);
        session_from_cookie(&db, &jar).await.map(ExistingSession)
    }
}

/// The browser's session, created when it has none. Only the login path uses this.
///
/// When `new_cookie` is set the handler has to send it back.
#[derive(Debug)]
pub struct BrowserSession {
    pub id: SessionId,
    pub new_cookie: Option<Cookie<'static>>,
}

impl BrowserSession {
    pub fn attach(self, jar: CookieJar) -> (SessionId, CookieJar) {
        match self.new_cookie {
            Some(cookie) => (self.id, jar.add(cookie)),
            None => (self.id, jar),
        }
    }
}

impl<S> FromRequestParts<S> for BrowserSession
where
    Db: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(
        parts: &mut axum::http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let db = Db::from_ref(state);
        let jar = CookieJar::from_headers(&parts.headers);

        if let Some(id) = session_from_cookie(&db, &jar).await? {
            return Ok(BrowserSession {
                id,
                new_cookie: None,
            });
        }

        let id = create_session(&db).await.map_err(|err| {
            error!(?err, "Failed to create session");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        })?;

        Ok(BrowserSession {
            new_cookie: Some(session_cookie(&id)),
            id,
        })
    }
}
