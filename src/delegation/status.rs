use std::sync::Arc;

use tracing::{debug, error, warn};

use super::{DelegationError, ManagedUserSummary};
use crate::directory::Directory;

/// Reads the status of one account.
#[derive(Clone)]
pub struct AccountStatusReader {
    directory: Arc<dyn Directory>,
}

impl AccountStatusReader {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Status of `username`, or `None` if it cannot be read.
    pub async fn get_status(
        &self,
        username: &str,
    ) -> Option<ManagedUserSummary> {
        debug!(%username, "getting account status");

        match self.read(username).await {
            Ok(summary) => Some(summary),
            Err(DelegationError::PrincipalNotFound(_)) => {
                warn!(%username, "user not found when getting status");
                None
            },
            Err(err) => {
                error!(%username, %err, "failed to get account status");
                None
            },
        }
    }

    async fn read(
        &self,
        username: &str,
    ) -> Result<ManagedUserSummary, DelegationError> {
        let mut session = self.directory.connect().await?;

        session
            .find_user(username)
            .await?
            .map(|user| ManagedUserSummary::from(&user))
            .ok_or_else(|| {
                DelegationError::PrincipalNotFound(username.to_owned())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegation::tests::directory;

    #[tokio::test]
    async fn test_get_status() {
        let directory = directory()
            .update("carol", |carol| carol.last_password_set = None);
        let reader = AccountStatusReader::new(Arc::new(directory.clone()));

        let bob = reader.get_status("BOB").await.unwrap();
        assert_eq!(bob.username, "bob");
        assert_eq!(bob.email_address, "bob@corp.example.com");
        assert!(bob.password_never_expires);
        assert!(!bob.password_change_required);

        let carol = reader.get_status("carol").await.unwrap();
        assert!(carol.password_change_required);
        assert_eq!(directory.sessions(), (2, 2));
    }

    #[tokio::test]
    async fn test_missing_user_has_no_status() {
        let directory = directory();
        let reader = AccountStatusReader::new(Arc::new(directory.clone()));

        assert!(reader.get_status("ghost").await.is_none());
        assert_eq!(directory.sessions(), (1, 1));
    }

    #[tokio::test]
    async fn test_unavailable_directory_has_no_status() {
        let reader = AccountStatusReader::new(Arc::new(directory().offline()));
        assert!(reader.get_status("bob").await.is_none());
    }
}
