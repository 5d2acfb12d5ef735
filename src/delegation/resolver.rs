use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::{DelegationError, ManagedUserSummary};
use crate::config::Configuration;
use crate::directory::{Directory, DirectoryIdentity};

/// Computes the accounts an admin may manage.
#[derive(Clone)]
pub struct DelegationResolver {
    config: Arc<Configuration>,
    directory: Arc<dyn Directory>,
}

impl DelegationResolver {
    pub fn new(
        config: Arc<Configuration>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self { config, directory }
    }

    /// Users `admin` may manage, sorted by username.
    ///
    /// Never fails: errors are logged and the users found so far are
    /// returned. Misconfiguration or an unknown admin yields nobody.
    pub async fn resolve_managed_users(
        &self,
        admin: &str,
    ) -> Vec<ManagedUserSummary> {
        info!(%admin, "fetching managed users");

        // Keyed by lowercased account name, which also orders the output.
        let mut users = BTreeMap::new();
        let outcome = match self.collect(admin, &mut users).await {
            Ok(()) => "ok",
            Err(err) => {
                match &err {
                    DelegationError::Configuration(reason)
                        if reason.is_incomplete() =>
                    {
                        warn!(%admin, %reason, "delegation is not configured")
                    },
                    DelegationError::Configuration(reason) => {
                        error!(%admin, %reason, "delegation is misconfigured")
                    },
                    DelegationError::PrincipalNotFound(_) => {
                        warn!(%admin, "admin not found in directory")
                    },
                    _ => error!(
                        %admin,
                        %err,
                        "failed to resolve managed users"
                    ),
                }
                err.outcome()
            },
        };

        metrics::counter!("delegation_resolutions_total", "outcome" => outcome)
            .increment(1);
        debug!(%admin, count = users.len(), "managed users resolved");

        users.values().map(ManagedUserSummary::from).collect()
    }

    async fn collect(
        &self,
        admin: &str,
        users: &mut BTreeMap<String, DirectoryIdentity>,
    ) -> Result<(), DelegationError> {
        self.config.ensure_delegation()?;

        let mut session = self.directory.connect().await?;
        let principal = session.find_user(admin).await?.ok_or_else(|| {
            DelegationError::PrincipalNotFound(admin.to_owned())
        })?;

        let memberships: HashSet<String> = session
            .groups_of(&principal)
            .await?
            .into_iter()
            .map(|group| group.to_lowercase())
            .collect();
        debug!(%admin, groups = ?memberships, "admin group memberships");

        let managed = self.config.delegation.managed_groups_for(&memberships);
        debug!(%admin, groups = ?managed.values(), "groups to manage");

        for name in managed.values() {
            let Some(group) = session.find_group(name).await? else {
                let err = DelegationError::GroupNotFound(name.clone());
                warn!(%admin, %err, "skipping managed group");
                continue;
            };

            for member in session.members_of(&group).await? {
                if member.is_user() {
                    users.entry(member.key()).or_insert(member);
                }
            }
        }

        Ok(())
    }
}
