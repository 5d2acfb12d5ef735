//! Managed users HTTP API.
//!
//! Every route resolves the accounts the caller manages again, so a
//! membership removed in the directory applies to the next request.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Extension, Json, Router, middleware};
use serde::Deserialize;
use tracing::Instrument;
use validator::Validate;
use zeroize::{Zeroize, Zeroizing};

use crate::delegation::{ManagedUserSummary, PasswordResetRequest};
use crate::error::Result;
use crate::router::{Principal, Valid, authenticate, validate_username};
use crate::{AppState, ServerError};

/// Body of `POST /managed-users/{username}/password`.
#[derive(Deserialize, Validate)]
pub struct ResetBody {
    #[validate(length(
        min = 1,
        max = 256,
        message = "Password must be 1 to 256 characters long."
    ))]
    new_password: String,
    #[validate(must_match(
        other = "new_password",
        message = "Passwords do not match."
    ))]
    confirm_password: String,
    #[serde(default)]
    set_password_never_expires: bool,
    #[serde(default)]
    require_change_on_next_logon: bool,
}

impl Drop for ResetBody {
    fn drop(&mut self) {
        self.new_password.zeroize();
        self.confirm_password.zeroize();
    }
}

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        // `GET /managed-users` goes to `list`.
        .route("/", get(list))
        // `GET /managed-users/{username}` goes to `status`.
        .route("/{username}", get(status))
        // `POST /managed-users/{username}/password` goes to `reset`.
        .route("/{username}/password", post(reset))
        .route_layer(middleware::from_fn_with_state(state, authenticate))
}

/// Refuse targets the admin does not manage.
async fn ensure_managed(
    state: &AppState,
    admin: &str,
    username: &str,
) -> Result<()> {
    if validate_username(username)
        && state.delegation.can_manage(admin, username).await
    {
        Ok(())
    } else {
        tracing::warn!(%admin, %username, "target is not managed by admin");
        Err(ServerError::NotFound)
    }
}

async fn list(
    State(state): State<AppState>,
    Extension(Principal(admin)): Extension<Principal>,
) -> Json<Vec<ManagedUserSummary>> {
    Json(state.delegation.resolver.resolve_managed_users(&admin).await)
}

async fn status(
    State(state): State<AppState>,
    Extension(Principal(admin)): Extension<Principal>,
    Path(username): Path<String>,
) -> Result<Json<ManagedUserSummary>> {
    ensure_managed(&state, &admin, &username).await?;

    let summary = state
        .delegation
        .status
        .get_status(&username)
        .instrument(tracing::info_span!("delegated", %admin))
        .await;

    summary.map(Json).ok_or_else(|| {
        tracing::warn!(%admin, %username, "status of managed user unavailable");
        ServerError::NotFound
    })
}

async fn reset(
    State(state): State<AppState>,
    Extension(Principal(admin)): Extension<Principal>,
    Path(username): Path<String>,
    Valid(mut body): Valid<ResetBody>,
) -> Result<StatusCode> {
    ensure_managed(&state, &admin, &username).await?;

    let request = PasswordResetRequest {
        username: username.clone(),
        new_password: Zeroizing::new(std::mem::take(&mut body.new_password)),
        set_password_never_expires: body.set_password_never_expires,
        require_change_on_next_logon: body.require_change_on_next_logon,
    };

    let done = state
        .delegation
        .mutator
        .reset_password(request)
        .instrument(tracing::info_span!("delegated", %admin))
        .await;

    if done {
        tracing::info!(%admin, %username, "password reset by delegated admin");
        Ok(StatusCode::NO_CONTENT)
    } else {
        tracing::warn!(%admin, %username, "delegated password reset failed");
        Err(ServerError::ResetFailed)
    }
}
