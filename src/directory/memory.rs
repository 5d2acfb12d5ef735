//! In-memory directory used by tests.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::{
    AccountChanges, Directory, DirectoryError, DirectoryIdentity,
    DirectorySession, IdentityKind, Result,
};

const NORMAL_ACCOUNT: u32 = 0x200;
const RC_CONSTRAINT_VIOLATION: u32 = 19;

#[derive(Debug, Clone)]
enum Member {
    User(String),
    Group(String),
}

#[derive(Debug, Clone)]
struct Group {
    identity: DirectoryIdentity,
    members: Vec<Member>,
}

/// Staged flags of a commit, as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub username: String,
    pub password: Option<String>,
    pub password_never_expires: Option<bool>,
    pub expire_password: bool,
    pub unlock: bool,
}

#[derive(Debug, Default)]
struct State {
    users: BTreeMap<String, DirectoryIdentity>,
    passwords: BTreeMap<String, String>,
    groups: BTreeMap<String, Group>,
    commits: Vec<Commit>,
    opened: usize,
    released: usize,
    offline: bool,
    reject_passwords: bool,
    broken_groups: HashSet<String>,
}

/// Directory kept in memory, with failure injection.
#[derive(Clone, Debug, Default)]
pub struct MemoryDirectory {
    state: Arc<Mutex<State>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Add an unlocked user whose password was already set once.
    pub fn user(self, name: &str, password: &str) -> Self {
        {
            let mut state = self.state();
            state.users.insert(name.to_lowercase(), new_user(name));
            state
                .passwords
                .insert(name.to_lowercase(), password.to_owned());
        }
        self
    }

    /// Add a group with user members.
    pub fn group(self, name: &str, users: &[&str]) -> Self {
        self.nested_group(name, users, &[])
    }

    /// Add a group with user and group members.
    pub fn nested_group(
        self,
        name: &str,
        users: &[&str],
        groups: &[&str],
    ) -> Self {
        let members = users
            .iter()
            .map(|u| Member::User(u.to_lowercase()))
            .chain(groups.iter().map(|g| Member::Group(g.to_lowercase())))
            .collect();

        self.state().groups.insert(
            name.to_lowercase(),
            Group {
                identity: DirectoryIdentity {
                    kind: IdentityKind::Group,
                    distinguished_name: format!("CN={name},OU=Groups,DC=corp"),
                    sam_account_name: name.to_owned(),
                    display_name: None,
                    email_address: None,
                    user_account_control: 0,
                    last_password_set: None,
                    locked_out: false,
                },
                members,
            },
        );
        self
    }

    /// Change a stored user.
    pub fn update(
        self,
        name: &str,
        f: impl FnOnce(&mut DirectoryIdentity),
    ) -> Self {
        if let Some(user) = self.state().users.get_mut(&name.to_lowercase()) {
            f(user);
        }
        self
    }

    /// Every connection fails.
    pub fn offline(self) -> Self {
        self.state().offline = true;
        self
    }

    /// Every password write is refused by policy.
    pub fn reject_passwords(self) -> Self {
        self.state().reject_passwords = true;
        self
    }

    /// Expanding `group` fails with a transport error.
    pub fn break_group(self, group: &str) -> Self {
        self.state().broken_groups.insert(group.to_lowercase());
        self
    }

    pub fn get_user(&self, name: &str) -> Option<DirectoryIdentity> {
        self.state().users.get(&name.to_lowercase()).cloned()
    }

    pub fn password_of(&self, name: &str) -> Option<String> {
        self.state().passwords.get(&name.to_lowercase()).cloned()
    }

    pub fn commits(&self) -> Vec<Commit> {
        self.state().commits.clone()
    }

    /// Sessions opened and sessions released.
    pub fn sessions(&self) -> (usize, usize) {
        let state = self.state();
        (state.opened, state.released)
    }
}

fn new_user(name: &str) -> DirectoryIdentity {
    DirectoryIdentity {
        kind: IdentityKind::User,
        distinguished_name: format!("CN={name},OU=Users,DC=corp"),
        sam_account_name: name.to_owned(),
        display_name: Some(name.to_uppercase()),
        email_address: Some(format!(
            "{}@corp.example.com",
            name.to_lowercase()
        )),
        user_account_control: NORMAL_ACCOUNT,
        last_password_set: Some(Utc::now()),
        locked_out: false,
    }
}

fn refused() -> DirectoryError {
    DirectoryError::Unavailable("connection refused".into())
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>> {
        let mut state = self.state();
        if state.offline {
            return Err(refused());
        }
        state.opened += 1;

        Ok(Box::new(MemorySession {
            directory: self.clone(),
        }))
    }

    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool> {
        let state = self.state();
        if state.offline {
            return Err(refused());
        }

        Ok(!password.is_empty()
            && state.passwords.get(&username.to_lowercase()).map(String::as_str)
                == Some(password))
    }
}

struct MemorySession {
    directory: MemoryDirectory,
}

#[async_trait]
impl DirectorySession for MemorySession {
    async fn find_user(
        &mut self,
        sam_account_name: &str,
    ) -> Result<Option<DirectoryIdentity>> {
        Ok(self.directory.get_user(sam_account_name))
    }

    async fn find_group(
        &mut self,
        sam_account_name: &str,
    ) -> Result<Option<DirectoryIdentity>> {
        let state = self.directory.state();
        Ok(state
            .groups
            .get(&sam_account_name.to_lowercase())
            .map(|g| g.identity.clone()))
    }

    async fn groups_of(
        &mut self,
        user: &DirectoryIdentity,
    ) -> Result<Vec<String>> {
        let state = self.directory.state();
        let mut found: BTreeMap<String, String> = BTreeMap::new();
        let mut queue = VecDeque::from([Member::User(user.key())]);

        while let Some(member) = queue.pop_front() {
            for (key, group) in &state.groups {
                let contains = group.members.iter().any(|m| match (m, &member) {
                    (Member::User(a), Member::User(b)) => a == b,
                    (Member::Group(a), Member::Group(b)) => a == b,
                    _ => false,
                });
                if contains && !found.contains_key(key) {
                    let name = group.identity.sam_account_name.clone();
                    found.insert(key.clone(), name);
                    queue.push_back(Member::Group(key.clone()));
                }
            }
        }

        Ok(found.into_values().collect())
    }

    async fn members_of(
        &mut self,
        group: &DirectoryIdentity,
    ) -> Result<Vec<DirectoryIdentity>> {
        let state = self.directory.state();
        let mut visited = HashSet::new();
        let mut seen = HashSet::new();
        let mut members = Vec::new();
        let mut queue = VecDeque::from([group.key()]);

        while let Some(key) = queue.pop_front() {
            if state.broken_groups.contains(&key) {
                let reason = "connection reset".to_owned();
                return Err(DirectoryError::Unavailable(reason));
            }
            if !visited.insert(key.clone()) {
                continue;
            }
            let Some(group) = state.groups.get(&key) else {
                continue;
            };

            for member in &group.members {
                match member {
                    Member::User(user) => {
                        if let Some(identity) = state.users.get(user) {
                            if seen.insert(user.clone()) {
                                members.push(identity.clone());
                            }
                        }
                    },
                    Member::Group(sub) => queue.push_back(sub.clone()),
                }
            }
        }

        Ok(members)
    }

    async fn commit(&mut self, changes: AccountChanges) -> Result<()> {
        let mut state = self.directory.state();
        let key = changes.sam_account_name().to_lowercase();

        if !state.users.contains_key(&key) {
            return Err(DirectoryError::NotFound(key));
        }
        if changes.password().is_some() && state.reject_passwords {
            return Err(DirectoryError::WriteRejected {
                code: RC_CONSTRAINT_VIOLATION,
                message: "password does not meet policy".into(),
            });
        }

        state.commits.push(Commit {
            username: changes.sam_account_name().to_owned(),
            password: changes.password().map(str::to_owned),
            password_never_expires: changes.password_never_expires(),
            expire_password: changes.expires_password(),
            unlock: changes.unlocks(),
        });

        if let Some(password) = changes.password() {
            state.passwords.insert(key.clone(), password.to_owned());
        }
        if let Some(user) = state.users.get_mut(&key) {
            user.user_account_control = changes.user_account_control();
            if changes.password().is_some() {
                user.last_password_set = Some(Utc::now());
            }
            if changes.expires_password() {
                user.last_password_set = None;
            }
            if changes.unlocks() {
                user.locked_out = false;
            }
        }

        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        self.directory.state().released += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DONT_EXPIRE_PASSWORD;

    #[tokio::test]
    async fn test_nested_membership_with_cycle() {
        let directory = MemoryDirectory::new()
            .user("alice", "pw")
            .user("bob", "pw")
            .nested_group("A", &["alice"], &["B"])
            .nested_group("B", &["bob"], &["A"]);

        let mut session = directory.connect().await.unwrap();
        let a = session.find_group("a").await.unwrap().unwrap();
        let members = session.members_of(&a).await.unwrap();
        assert_eq!(members.len(), 2);

        let alice = session.find_user("ALICE").await.unwrap().unwrap();
        let groups = session.groups_of(&alice).await.unwrap();
        assert_eq!(groups, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_never_expires_flag_round_trip() {
        let directory = MemoryDirectory::new().user("bob", "pw");
        let mut session = directory.connect().await.unwrap();
        let bob = session.find_user("bob").await.unwrap().unwrap();

        let mut changes = AccountChanges::new(&bob);
        changes.set_password_never_expires(true);
        session.commit(changes).await.unwrap();

        let bob = directory.get_user("bob").unwrap();
        assert!(bob.user_account_control & DONT_EXPIRE_PASSWORD != 0);
    }
}
