//! HTTP API.
pub mod status;
pub mod users;

use std::sync::LazyLock;

use axum::extract::{FromRequest, Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use regex_lite::Regex;
use serde::de::DeserializeOwned;
use validator::Validate;
use zeroize::Zeroizing;

use crate::directory::normalize_principal;
use crate::{AppState, ServerError};

const BASIC: &str = "Basic ";

/// `sAMAccountName`: up to 20 characters, none of the reserved ones.
static USERNAME: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r#"^[^"/\\\[\]:;|=,+*?<>@\x00-\x1f\x7f]{1,20}$"#).ok()
});

/// JSON body checked with [`Validate`] before reaching the handler.
pub struct Valid<T>(pub T);

impl<T, S> FromRequest<S> for Valid<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(
        req: Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(Valid(value))
    }
}

/// Authenticated admin, as seen by the directory.
#[derive(Debug, Clone)]
pub struct Principal(pub String);

/// Whether `name` looks like an account name.
pub fn validate_username(name: &str) -> bool {
    USERNAME.as_ref().is_some_and(|re| re.is_match(name))
}

/// Decode `Basic` credentials.
fn basic_credentials(value: &str) -> Option<(String, Zeroizing<String>)> {
    let encoded = value.strip_prefix(BASIC)?.trim();
    let decoded = Zeroizing::new(STANDARD.decode(encoded).ok()?);
    let decoded = std::str::from_utf8(&decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;

    Some((username.to_owned(), Zeroizing::new(password.to_owned())))
}

/// Check HTTP Basic credentials against the directory.
pub async fn authenticate(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ServerError> {
    let (username, password) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(basic_credentials)
        .ok_or(ServerError::Unauthorized)?;

    let username = normalize_principal(&username).to_owned();
    if !validate_username(&username) {
        return Err(ServerError::Unauthorized);
    }

    match state.directory.authenticate(&username, &password).await {
        Ok(true) => {
            tracing::info!(%username, "authenticated against directory")
        },
        Ok(false) => {
            tracing::warn!(%username, "invalid login attempt");
            return Err(ServerError::Unauthorized);
        },
        Err(err) => {
            tracing::error!(%username, %err, "cannot authenticate");
            return Err(ServerError::Unavailable);
        },
    }

    req.extensions_mut().insert(Principal(username));
    Ok(next.run(req).await)
}
