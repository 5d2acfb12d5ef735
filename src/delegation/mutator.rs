use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{DelegationError, PasswordResetRequest};
use crate::directory::{AccountChanges, Directory};

/// Applies password resets.
#[derive(Clone)]
pub struct AccountMutator {
    directory: Arc<dyn Directory>,
}

impl AccountMutator {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Reset the password of `request.username`, set its expiry policy and
    /// unlock it.
    ///
    /// Every change is written at once. Returns `false`, with nothing
    /// written, when any step fails.
    pub async fn reset_password(&self, request: PasswordResetRequest) -> bool {
        let username = request.username.clone();
        info!(
            %username,
            set_never_expires = request.set_password_never_expires,
            require_change = request.require_change_on_next_logon,
            "attempting password reset"
        );

        let outcome = match self.apply(request).await {
            Ok(()) => {
                info!(%username, "saved all changes");
                "ok"
            },
            Err(DelegationError::PrincipalNotFound(_)) => {
                warn!(%username, "user not found, password reset failed");
                "not_found"
            },
            Err(err) => {
                error!(%username, %err, "failed to reset password");
                err.outcome()
            },
        };

        metrics::counter!("password_resets_total", "outcome" => outcome)
            .increment(1);
        outcome == "ok"
    }

    async fn apply(
        &self,
        request: PasswordResetRequest,
    ) -> Result<(), DelegationError> {
        let username = request.username.as_str();
        let mut session = self.directory.connect().await?;
        let user = session.find_user(username).await?.ok_or_else(|| {
            DelegationError::PrincipalNotFound(username.to_owned())
        })?;

        let mut changes = AccountChanges::new(&user);
        changes.set_password(&request.new_password)?;
        debug!(%username, "password staged");

        changes.set_password_never_expires(request.set_password_never_expires);
        debug!(
            %username,
            value = request.set_password_never_expires,
            "password never expires staged"
        );

        if request.require_change_on_next_logon {
            changes.expire_password_now();
            debug!(%username, "password expiry staged");
        }

        changes.unlock();
        debug!(%username, "unlock staged");

        session.commit(changes).await?;
        Ok(())
    }
}
