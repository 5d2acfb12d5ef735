//! Delegated account administration.
//!
//! An admin manages the users of every group mapped to one of the admin
//! groups they belong to. Nothing here is cached: each operation opens its
//! own directory session, so a revoked membership takes effect immediately.
mod mutator;
mod resolver;
mod status;

pub use mutator::AccountMutator;
pub use resolver::DelegationResolver;
pub use status::AccountStatusReader;

use std::sync::Arc;

use serde::Serialize;
use zeroize::Zeroizing;

use crate::config::{ConfigError, Configuration};
use crate::directory::{Directory, DirectoryError, DirectoryIdentity};

/// Errors raised inside delegation operations.
///
/// They are logged and collapsed at the operation boundary, never returned.
#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error("configuration is incomplete: {0}")]
    Configuration(#[from] ConfigError),
    #[error("principal {0} not found in directory")]
    PrincipalNotFound(String),
    #[error("group {0} not found in directory")]
    GroupNotFound(String),
    #[error(transparent)]
    Directory(#[from] DirectoryError),
}

impl DelegationError {
    /// Label used on outcome counters.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "unconfigured",
            Self::PrincipalNotFound(_) | Self::GroupNotFound(_) => "not_found",
            Self::Directory(DirectoryError::WriteRejected { .. }) => "rejected",
            Self::Directory(_) => "error",
        }
    }
}

/// Account as displayed to an admin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagedUserSummary {
    pub username: String,
    pub display_name: String,
    pub email_address: String,
    pub password_never_expires: bool,
    /// Set when the directory holds no last password change.
    pub password_change_required: bool,
}

impl From<&DirectoryIdentity> for ManagedUserSummary {
    fn from(identity: &DirectoryIdentity) -> Self {
        Self {
            username: identity.sam_account_name.clone(),
            display_name: identity.display_name.clone().unwrap_or_default(),
            email_address: identity.email_address.clone().unwrap_or_default(),
            password_never_expires: identity.password_never_expires(),
            password_change_required: identity.last_password_set.is_none(),
        }
    }
}

/// Password reset of one account.
pub struct PasswordResetRequest {
    pub username: String,
    pub new_password: Zeroizing<String>,
    pub set_password_never_expires: bool,
    pub require_change_on_next_logon: bool,
}

impl std::fmt::Debug for PasswordResetRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordResetRequest")
            .field("username", &self.username)
            .field(
                "set_password_never_expires",
                &self.set_password_never_expires,
            )
            .field(
                "require_change_on_next_logon",
                &self.require_change_on_next_logon,
            )
            .finish_non_exhaustive()
    }
}

/// Delegation operations sharing one configuration and directory.
#[derive(Clone)]
pub struct Delegation {
    pub resolver: DelegationResolver,
    pub status: AccountStatusReader,
    pub mutator: AccountMutator,
}

impl Delegation {
    pub fn new(
        config: Arc<Configuration>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            resolver: DelegationResolver::new(
                Arc::clone(&config),
                Arc::clone(&directory),
            ),
            status: AccountStatusReader::new(Arc::clone(&directory)),
            mutator: AccountMutator::new(directory),
        }
    }

    /// Whether `admin` currently manages `username`.
    pub async fn can_manage(&self, admin: &str, username: &str) -> bool {
        let key = username.to_lowercase();
        self.resolver
            .resolve_managed_users(admin)
            .await
            .iter()
            .any(|user| user.username.to_lowercase() == key)
    }
}
