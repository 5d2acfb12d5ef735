//! Directory gateway.
//!
//! A [`Directory`] opens short-lived [`DirectorySession`]s bound with the
//! service account. A session is owned by exactly one operation and is
//! released when dropped, whatever path the operation exits through.

mod changes;
mod ldap;
#[cfg(test)]
pub(crate) mod memory;

pub use changes::*;
pub use ldap::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// `userAccountControl` flag for a password that never expires.
pub const DONT_EXPIRE_PASSWORD: u32 = 0x10000;

/// Errors raised by the directory.
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// Connection, bind or transport failure.
    #[error("directory is unavailable: {0}")]
    Unavailable(String),
    /// Identity does not exist.
    #[error("{0} not found in directory")]
    NotFound(String),
    /// Directory refused a write, e.g. password policy violation.
    #[error("directory rejected the change (code {code}): {message}")]
    WriteRejected { code: u32, message: String },
    /// A staged change is unusable.
    #[error("invalid change: {0}")]
    InvalidChange(&'static str),
    #[error(transparent)]
    Ldap(#[from] ldap3::LdapError),
}

/// Kind of directory principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityKind {
    User,
    Group,
}

/// Directory principal as read during one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryIdentity {
    pub kind: IdentityKind,
    pub distinguished_name: String,
    /// Logon name. Unique and compared case-insensitively.
    pub sam_account_name: String,
    pub display_name: Option<String>,
    pub email_address: Option<String>,
    pub user_account_control: u32,
    /// `None` when the password was never set or must change at next logon.
    pub last_password_set: Option<DateTime<Utc>>,
    pub locked_out: bool,
}

impl DirectoryIdentity {
    pub fn is_user(&self) -> bool {
        self.kind == IdentityKind::User
    }

    pub fn password_never_expires(&self) -> bool {
        self.user_account_control & DONT_EXPIRE_PASSWORD != 0
    }

    /// Case-insensitive key of this identity.
    pub fn key(&self) -> String {
        self.sam_account_name.to_lowercase()
    }
}

/// Factory of service-account sessions.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Open a session bound with the service account.
    async fn connect(&self) -> Result<Box<dyn DirectorySession>>;

    /// Check a user's credentials with a bind of their own.
    ///
    /// Returns `Ok(false)` on rejected credentials.
    async fn authenticate(&self, username: &str, password: &str)
    -> Result<bool>;
}

/// Authenticated session to the directory.
#[async_trait]
pub trait DirectorySession: Send {
    /// Find a user by `sAMAccountName`.
    async fn find_user(
        &mut self,
        sam_account_name: &str,
    ) -> Result<Option<DirectoryIdentity>>;

    /// Find a group by `sAMAccountName`.
    async fn find_group(
        &mut self,
        sam_account_name: &str,
    ) -> Result<Option<DirectoryIdentity>>;

    /// Names of every security group `user` belongs to, directly, through
    /// nesting or as its primary group.
    async fn groups_of(&mut self, user: &DirectoryIdentity)
    -> Result<Vec<String>>;

    /// Users of `group`, nested groups expanded. Users whose primary group
    /// is `group` are included.
    async fn members_of(
        &mut self,
        group: &DirectoryIdentity,
    ) -> Result<Vec<DirectoryIdentity>>;

    /// Persist every staged change in a single write.
    async fn commit(&mut self, changes: AccountChanges) -> Result<()>;
}

/// Reduce `DOMAIN\user` and `user@domain` to `user`.
pub fn normalize_principal(name: &str) -> &str {
    let name = name.rsplit_once('\\').map_or(name, |(_, user)| user);
    name.split_once('@').map_or(name, |(user, _)| user)
}
