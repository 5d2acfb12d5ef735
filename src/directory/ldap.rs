//! LDAP support.

use std::collections::HashMap;
use std::fmt::Write;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ldap3::adapters::{Adapter, EntriesOnly, PagedResults};
use ldap3::{
    Ldap as Ldap3, LdapConnAsync, LdapConnSettings, LdapError, Scope,
    SearchEntry,
};
use tracing::{debug, trace};

use super::{
    AccountChanges, Directory, DirectoryError, DirectoryIdentity,
    DirectorySession, IdentityKind, Result,
};
use crate::config;

const PAGE_SIZE: i32 = 500;
/// SIDs per `objectSid` filter when naming token groups.
const SID_BATCH: usize = 64;
/// LDAP_MATCHING_RULE_IN_CHAIN, walks nested membership server-side.
const IN_CHAIN: &str = "1.2.840.113556.1.4.1941";
const RC_SUCCESS: u32 = 0;
const RC_INVALID_CREDENTIALS: u32 = 49;
/// 100-nanosecond intervals between 1601-01-01 and the Unix epoch.
const FILETIME_UNIX_OFFSET: i64 = 116_444_736_000_000_000;

const USER_FILTER: &str = "(&(objectCategory=person)(objectClass=user))";
const ATTRIBUTES: [&str; 8] = [
    "objectClass",
    "sAMAccountName",
    "displayName",
    "mail",
    "userAccountControl",
    "pwdLastSet",
    "lockoutTime",
    "distinguishedName",
];

/// Directory reached over LDAP with the configured service account.
#[derive(Clone, Debug, Default)]
pub struct LdapDirectory {
    config: config::Directory,
}

impl LdapDirectory {
    /// Create a new [`LdapDirectory`].
    ///
    /// No connection is made until a session is requested.
    pub fn new(config: config::Directory) -> Self {
        Self { config }
    }

    /// Open a connection and bind as `bind_name`.
    async fn bind(&self, bind_name: &str, password: &str) -> Result<Ldap3> {
        let url = self
            .config
            .url()
            .map_err(|err| DirectoryError::Unavailable(err.to_string()))?;

        let settings = LdapConnSettings::new()
            .set_conn_timeout(self.config.timeout())
            .set_starttls(self.config.starttls && url.scheme() == "ldap");

        let (handle, mut conn) =
            LdapConnAsync::with_settings(settings, url.as_str())
                .await
                .map_err(unavailable)?;
        ldap3::drive!(handle);

        conn.simple_bind(bind_name, password)
            .await
            .map_err(unavailable)?
            .success()?;

        Ok(conn)
    }
}

#[async_trait]
impl Directory for LdapDirectory {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>> {
        if self.config.service_user.is_empty()
            || self.config.service_password.is_empty()
        {
            return Err(DirectoryError::Unavailable(
                "service account is not configured".into(),
            ));
        }

        let bind_name = self.config.bind_name(&self.config.service_user);
        let conn = self
            .bind(&bind_name, &self.config.service_password)
            .await
            .map_err(|err| match err {
                DirectoryError::Ldap(err) => unavailable(err),
                err => err,
            })?;
        debug!(bind_name, "directory session opened");

        Ok(Box::new(LdapSession {
            conn,
            base_dn: self.config.base_dn(),
        }))
    }

    async fn authenticate(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool> {
        // An empty password would be an unauthenticated bind, which
        // succeeds.
        if username.is_empty() || password.is_empty() {
            return Ok(false);
        }

        match self.bind(&self.config.bind_name(username), password).await {
            Ok(mut conn) => {
                let _ = conn.unbind().await;
                Ok(true)
            },
            Err(DirectoryError::Ldap(LdapError::LdapResult { result }))
                if result.rc == RC_INVALID_CREDENTIALS =>
            {
                Ok(false)
            },
            Err(DirectoryError::Ldap(err)) => Err(unavailable(err)),
            Err(err) => Err(err),
        }
    }
}

/// Session bound with the service account.
///
/// Dropping the session unbinds it.
pub struct LdapSession {
    conn: Ldap3,
    base_dn: String,
}

impl LdapSession {
    /// Paged subtree search returning every matching entry.
    async fn search(&mut self, filter: &str) -> Result<Vec<SearchEntry>> {
        let adapters: Vec<Box<dyn Adapter<_, _>>> = vec![
            Box::new(EntriesOnly::new()),
            Box::new(PagedResults::new(PAGE_SIZE)),
        ];

        let mut stream = self
            .conn
            .streaming_search_with(
                adapters,
                &self.base_dn,
                Scope::Subtree,
                filter,
                ATTRIBUTES.to_vec(),
            )
            .await
            .map_err(unavailable)?;

        let mut entries = Vec::new();
        while let Some(entry) = stream.next().await.map_err(unavailable)? {
            entries.push(SearchEntry::construct(entry));
        }
        stream.finish().await.success()?;

        trace!(filter, count = entries.len(), "directory search");
        Ok(entries)
    }

    /// Read attributes of the entry at `dn`.
    ///
    /// Constructed attributes such as `tokenGroups` are only returned by
    /// base searches.
    async fn read_entry(
        &mut self,
        dn: &str,
        attributes: Vec<&str>,
    ) -> Result<Option<SearchEntry>> {
        let (entries, _) = self
            .conn
            .search(dn, Scope::Base, "(objectClass=*)", attributes)
            .await
            .map_err(unavailable)?
            .success()?;

        Ok(entries.into_iter().next().map(SearchEntry::construct))
    }

    async fn find_one(
        &mut self,
        filter: String,
    ) -> Result<Option<DirectoryIdentity>> {
        Ok(self.search(&filter).await?.iter().find_map(to_identity))
    }
}

#[async_trait]
impl DirectorySession for LdapSession {
    async fn find_user(
        &mut self,
        sam_account_name: &str,
    ) -> Result<Option<DirectoryIdentity>> {
        let filter = format!(
            "(&{USER_FILTER}(sAMAccountName={}))",
            escape_ldap(sam_account_name)
        );
        self.find_one(filter).await
    }

    async fn find_group(
        &mut self,
        sam_account_name: &str,
    ) -> Result<Option<DirectoryIdentity>> {
        let filter = format!(
            "(&(objectClass=group)(sAMAccountName={}))",
            escape_ldap(sam_account_name)
        );
        self.find_one(filter).await
    }

    async fn groups_of(
        &mut self,
        user: &DirectoryIdentity,
    ) -> Result<Vec<String>> {
        // tokenGroups holds the SIDs of every security group, nested
        // and primary ones included.
        let sids = self
            .read_entry(&user.distinguished_name, vec!["tokenGroups"])
            .await?
            .map(|entry| binary_values(&entry, "tokenGroups"))
            .unwrap_or_default();
        trace!(
            user = %user.sam_account_name,
            count = sids.len(),
            "token groups read"
        );

        let mut groups = Vec::with_capacity(sids.len());
        for batch in sids.chunks(SID_BATCH) {
            let filter = format!("(&(objectClass=group){})", sid_filter(batch));
            groups.extend(
                self.search(&filter)
                    .await?
                    .iter()
                    .filter_map(|entry| attribute(entry, "sAMAccountName"))
                    .map(str::to_owned),
            );
        }

        Ok(groups)
    }

    async fn members_of(
        &mut self,
        group: &DirectoryIdentity,
    ) -> Result<Vec<DirectoryIdentity>> {
        let token = self
            .read_entry(&group.distinguished_name, vec!["primaryGroupToken"])
            .await?
            .and_then(|entry| {
                attribute(&entry, "primaryGroupToken")
                    .and_then(|value| value.parse::<u32>().ok())
            });
        let filter = members_filter(&group.distinguished_name, token);

        Ok(self
            .search(&filter)
            .await?
            .iter()
            .filter_map(to_identity)
            .filter(DirectoryIdentity::is_user)
            .collect())
    }

    async fn commit(&mut self, changes: AccountChanges) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let result = self
            .conn
            .modify(changes.target(), changes.modifications())
            .await
            .map_err(unavailable)?;

        if result.rc != RC_SUCCESS {
            return Err(DirectoryError::WriteRejected {
                code: result.rc,
                message: result.text,
            });
        }

        Ok(())
    }
}

impl Drop for LdapSession {
    fn drop(&mut self) {
        let mut conn = self.conn.clone();
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(err) = conn.unbind().await {
                    trace!(error = %err, "directory unbind failed");
                }
            });
        }
        debug!("directory session released");
    }
}

fn unavailable(err: LdapError) -> DirectoryError {
    DirectoryError::Unavailable(err.to_string())
}

/// First value of `name`, attribute names being case-insensitive.
fn attribute<'a>(entry: &'a SearchEntry, name: &str) -> Option<&'a str> {
    values(&entry.attrs, name).and_then(|v| v.first()).map(String::as_str)
}

/// Raw values of `name`.
///
/// ldap3 only moves values that are not UTF-8 to `bin_attrs`, so both maps
/// are read.
fn binary_values(entry: &SearchEntry, name: &str) -> Vec<Vec<u8>> {
    let binary = values(&entry.bin_attrs, name).into_iter().flatten().cloned();
    let text = values(&entry.attrs, name)
        .into_iter()
        .flatten()
        .map(|value| value.clone().into_bytes());

    binary.chain(text).collect()
}

fn values<'a, V>(
    attrs: &'a HashMap<String, Vec<V>>,
    name: &str,
) -> Option<&'a Vec<V>> {
    attrs
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, values)| values)
}

/// Map a search entry to a [`DirectoryIdentity`].
fn to_identity(entry: &SearchEntry) -> Option<DirectoryIdentity> {
    let sam_account_name = attribute(entry, "sAMAccountName")?.to_owned();
    let kind = if values(&entry.attrs, "objectClass").is_some_and(|classes| {
        classes.iter().any(|c| c.eq_ignore_ascii_case("group"))
    }) {
        IdentityKind::Group
    } else {
        IdentityKind::User
    };

    let number = |name: &str| {
        attribute(entry, name)
            .and_then(|value| value.parse::<i64>().ok())
            .unwrap_or_default()
    };

    Some(DirectoryIdentity {
        kind,
        distinguished_name: entry.dn.clone(),
        sam_account_name,
        display_name: attribute(entry, "displayName").map(str::to_owned),
        email_address: attribute(entry, "mail").map(str::to_owned),
        user_account_control: number("userAccountControl") as u32,
        last_password_set: filetime_to_datetime(number("pwdLastSet")),
        locked_out: number("lockoutTime") != 0,
    })
}

/// Convert a Windows FILETIME. `0` means never set.
fn filetime_to_datetime(filetime: i64) -> Option<DateTime<Utc>> {
    if filetime <= 0 {
        return None;
    }

    let since_epoch = filetime - FILETIME_UNIX_OFFSET;
    DateTime::from_timestamp(
        since_epoch.div_euclid(10_000_000),
        (since_epoch.rem_euclid(10_000_000) * 100) as u32,
    )
}

/// Users of the group at `dn`, nested members and, when `token` is
/// known, users whose `primaryGroupID` is the group.
fn members_filter(dn: &str, token: Option<u32>) -> String {
    let nested = format!("(memberOf:{IN_CHAIN}:={})", escape_ldap(dn));
    match token {
        Some(token) => {
            format!("(&{USER_FILTER}(|{nested}(primaryGroupID={token})))")
        },
        None => format!("(&{USER_FILTER}{nested})"),
    }
}

/// `objectSid` disjunction over binary SIDs.
fn sid_filter(sids: &[Vec<u8>]) -> String {
    let mut filter = String::from("(|");
    for sid in sids {
        filter.push_str("(objectSid=");
        for byte in sid {
            let _ = write!(filter, "\\{byte:02x}");
        }
        filter.push(')');
    }
    filter.push(')');
    filter
}

/// Escape a value placed in a search filter (RFC 4515).
fn escape_ldap(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '*' => out.push_str(r"\2a"),
            '(' => out.push_str(r"\28"),
            ')' => out.push_str(r"\29"),
            '\\' => out.push_str(r"\5c"),
            '\0' => out.push_str(r"\00"),
            c => out.push(c),
        }
    }
    out
}
