//! Configuration manager for passdesk.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

const DEFAULT_CONFIG_PATH: &str = "config.yaml";
const DEFAULT_TIMEOUT: u64 = 10; // seconds.
const LDAPS_PORT: u16 = 636;
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Errors raised while loading or checking the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot open configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid directory address: {0}")]
    Address(#[from] url::ParseError),

    #[error("directory domain is not configured")]
    MissingDomain,
    #[error("directory service account is not configured")]
    MissingServiceAccount,
    #[error("delegation mappings are not configured")]
    MissingMappings,
}

impl ConfigError {
    /// Whether the error means a required value is absent.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            Self::MissingDomain
                | Self::MissingServiceAccount
                | Self::MissingMappings
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    /// Instance name.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    version: String,
    #[serde(skip)]
    path: PathBuf,
    /// Directory service reached with the service account.
    #[serde(skip_serializing)]
    pub directory: Option<Directory>,
    /// Which admin groups manage which groups.
    #[serde(default)]
    pub delegation: DelegationSettings,
    /// Logs export.
    #[serde(skip_serializing)]
    pub telemetry: Option<Telemetry>,
}

/// Directory connection configuration.
#[derive(Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directory {
    /// `ldap://` or `ldaps://` URL of a domain controller.
    /// Defaults to `ldaps://<domain>:636`.
    #[serde(default)]
    pub address: String,
    /// DNS name of the domain, e.g. `corp.example.com`.
    #[serde(default)]
    pub domain: String,
    /// Search base. Derived from `domain` when empty.
    #[serde(default)]
    pub base_dn: String,
    /// Service account used for every lookup and write.
    #[serde(default)]
    pub service_user: String,
    #[serde(default, skip_serializing)]
    pub service_password: String,
    /// Upgrade a plain `ldap://` connection with StartTLS.
    #[serde(default)]
    pub starttls: bool,
    /// Connection timeout in seconds.
    pub timeout: Option<u64>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Directory")
            .field("address", &self.address)
            .field("domain", &self.domain)
            .field("base_dn", &self.base_dn)
            .field("service_user", &self.service_user)
            .field("service_password", &"[redacted]")
            .field("starttls", &self.starttls)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Directory {
    /// URL used to reach the directory.
    pub fn url(&self) -> Result<Url, ConfigError> {
        let address = if self.address.is_empty() {
            format!("ldaps://{}:{LDAPS_PORT}", self.domain)
        } else if self.address.contains("://") {
            self.address.clone()
        } else {
            format!("ldaps://{}", self.address)
        };

        Ok(Url::parse(&address)?)
    }

    /// Search base, e.g. `DC=corp,DC=example,DC=com`.
    pub fn base_dn(&self) -> String {
        if !self.base_dn.is_empty() {
            return self.base_dn.clone();
        }

        self.domain
            .split('.')
            .filter(|part| !part.is_empty())
            .map(|part| format!("DC={part}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Name used to bind as `user`.
    ///
    /// Values already carrying a realm (`user@domain`, `DOMAIN\user`) or a
    /// full DN are used as-is.
    pub fn bind_name(&self, user: &str) -> String {
        if user.contains('@') || user.contains('\\') || user.contains('=') {
            user.to_owned()
        } else {
            format!("{user}@{}", self.domain)
        }
    }

    /// Connection timeout.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout.unwrap_or(DEFAULT_TIMEOUT))
    }
}

/// One admin group and the groups its members may manage.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationMapping {
    pub admin_group: String,
    #[serde(default)]
    pub managed_groups: BTreeSet<String>,
}

/// Delegation table.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegationSettings {
    #[serde(default)]
    pub admin_mappings: Vec<DelegationMapping>,
}

impl DelegationSettings {
    /// Whether no mapping is configured.
    pub fn is_empty(&self) -> bool {
        self.admin_mappings.is_empty()
    }

    /// Union of the managed groups of every mapping whose admin group is in
    /// `memberships`.
    ///
    /// `memberships` holds lowercased group names. The result is keyed by
    /// lowercased group name and keeps the first spelling encountered.
    pub fn managed_groups_for(
        &self,
        memberships: &HashSet<String>,
    ) -> BTreeMap<String, String> {
        let mut groups = BTreeMap::new();

        for mapping in self
            .admin_mappings
            .iter()
            .filter(|m| memberships.contains(&m.admin_group.to_lowercase()))
        {
            tracing::info!(
                admin_group = %mapping.admin_group,
                "delegation mapping matched"
            );
            for group in &mapping.managed_groups {
                groups
                    .entry(group.to_lowercase())
                    .or_insert_with(|| group.clone());
            }
        }

        groups
    }
}

/// Telemetry configuration.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Telemetry {
    /// OTLP gRPC endpoint receiving logs and traces.
    pub otlp_endpoint: Option<String>,
    /// Emit logs as JSON lines.
    #[serde(default)]
    pub json_logs: bool,
}

impl Configuration {
    pub fn path(mut self, path: PathBuf) -> Self {
        self.path = path;
        self
    }

    /// Application version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Reads the configuration file from the specified path or the default
    /// location.
    ///
    /// `SERVICE_PASSWORD` overrides `directory.service_password`.
    pub fn read(self) -> Result<Self, ConfigError> {
        let file_path = if self.path.is_file() {
            self.path.clone()
        } else {
            Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
        };

        let file = File::open(file_path)?;
        let mut config: Configuration = serde_yaml::from_reader(file)?;

        // set app version.
        config.version = VERSION.to_owned();
        config.path = self.path;

        if let Ok(password) = std::env::var("SERVICE_PASSWORD") {
            config
                .directory
                .get_or_insert_with(Directory::default)
                .service_password = password;
        }

        if let Some(directory) = &config.directory {
            directory.url()?;
        }

        Ok(config)
    }

    /// Return a default configuration as fallback.
    ///
    /// The fallback has no directory and no mapping, so every delegation
    /// resolves to nobody.
    pub fn fallback() -> Self {
        Self {
            version: VERSION.to_owned(),
            ..Default::default()
        }
    }

    /// Directory settings usable for a service-account session.
    pub fn ensure_directory(&self) -> Result<&Directory, ConfigError> {
        let directory =
            self.directory.as_ref().ok_or(ConfigError::MissingDomain)?;

        if directory.domain.trim().is_empty() {
            return Err(ConfigError::MissingDomain);
        }
        if directory.service_user.trim().is_empty()
            || directory.service_password.is_empty()
        {
            return Err(ConfigError::MissingServiceAccount);
        }
        directory.url()?;

        Ok(directory)
    }

    /// Directory settings plus a non-empty delegation table.
    pub fn ensure_delegation(&self) -> Result<&Directory, ConfigError> {
        let domain_set = self
            .directory
            .as_ref()
            .is_some_and(|d| !d.domain.trim().is_empty());
        if !domain_set {
            return Err(ConfigError::MissingDomain);
        }
        if self.delegation.is_empty() {
            return Err(ConfigError::MissingMappings);
        }

        self.ensure_directory()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
name: passdesk
directory:
  domain: corp.example.com
  service_user: svc-passdesk
  service_password: secret
delegation:
  admin_mappings:
    - admin_group: HelpDesk-Tier1
      managed_groups: [Branch-NY-Users, Branch-LA-Users]
    - admin_group: HelpDesk-Tier2
      managed_groups: [branch-ny-users, Contractors]
"#;

    fn sample() -> Configuration {
        serde_yaml::from_str(SAMPLE).unwrap()
    }

    fn memberships(groups: &[&str]) -> HashSet<String> {
        groups.iter().map(|g| g.to_lowercase()).collect()
    }

    #[test]
    fn test_parse_sample() {
        let config = sample();
        assert_eq!(config.name, "passdesk");
        assert_eq!(config.delegation.admin_mappings.len(), 2);
        assert!(config.ensure_delegation().is_ok());
    }

    #[test]
    fn test_base_dn_from_domain() {
        let directory = sample().directory.unwrap();
        assert_eq!(directory.base_dn(), "DC=corp,DC=example,DC=com");
    }

    #[test]
    fn test_default_url_is_ldaps() {
        let directory = sample().directory.unwrap();
        let url = directory.url().unwrap();
        assert_eq!(url.scheme(), "ldaps");
        assert_eq!(url.host_str(), Some("corp.example.com"));
        assert_eq!(url.port(), Some(LDAPS_PORT));
    }

    #[test]
    fn test_bind_name() {
        let directory = sample().directory.unwrap();
        assert_eq!(directory.bind_name("svc"), "svc@corp.example.com");
        assert_eq!(directory.bind_name("CORP\\svc"), "CORP\\svc");
        assert_eq!(directory.bind_name("svc@other.com"), "svc@other.com");
    }

    #[test]
    fn test_debug_redacts_password() {
        let directory = sample().directory.unwrap();
        let output = format!("{directory:?}");
        assert!(!output.contains("secret"));
    }

    #[test]
    fn test_managed_groups_union() {
        let config = sample();
        let groups = config.delegation.managed_groups_for(&memberships(&[
            "HelpDesk-Tier1",
            "HelpDesk-Tier2",
        ]));

        assert_eq!(
            groups.values().cloned().collect::<Vec<_>>(),
            vec!["Branch-LA-Users", "Branch-NY-Users", "Contractors"]
        );
    }

    #[test]
    fn test_managed_groups_ignores_unmapped_membership() {
        let config = sample();
        let groups = config
            .delegation
            .managed_groups_for(&memberships(&["Domain Users", "VPN"]));
        assert!(groups.is_empty());
    }

    #[test]
    fn test_managed_groups_match_case_insensitively() {
        let config = sample();
        let groups = config
            .delegation
            .managed_groups_for(&memberships(&["HELPDESK-TIER2"]));
        assert_eq!(groups.len(), 2);
        assert!(groups.contains_key("contractors"));
    }

    #[test]
    fn test_missing_mappings_is_incomplete() {
        let mut config = sample();
        config.delegation = DelegationSettings::default();

        let err = config.ensure_delegation().unwrap_err();
        assert!(matches!(err, ConfigError::MissingMappings));
        assert!(err.is_incomplete());
        assert!(config.ensure_directory().is_ok());
    }

    #[test]
    fn test_missing_service_account_is_incomplete() {
        let mut config = sample();
        if let Some(directory) = config.directory.as_mut() {
            directory.service_password.clear();
        }

        assert!(matches!(
            config.ensure_directory(),
            Err(ConfigError::MissingServiceAccount)
        ));
        assert!(matches!(
            config.ensure_delegation(),
            Err(ConfigError::MissingServiceAccount)
        ));
    }

    #[test]
    fn test_invalid_address_is_not_incomplete() {
        let mut config = sample();
        if let Some(directory) = config.directory.as_mut() {
            directory.address = "ldaps://[dc01".into();
        }

        let err = config.ensure_delegation().unwrap_err();
        assert!(matches!(err, ConfigError::Address(_)));
        assert!(!err.is_incomplete());
    }

    #[test]
    fn test_fallback_fails_closed() {
        let config = Configuration::fallback();
        assert_eq!(config.version(), VERSION);
        assert!(matches!(
            config.ensure_delegation(),
            Err(ConfigError::MissingDomain)
        ));
        assert!(config.ensure_directory().is_err());
    }

    #[test]
    fn test_read_missing_file() {
        let result = Configuration::default()
            .path(PathBuf::from("does/not/exist.yaml"))
            .read();
        // falls back to `config.yaml`, absent in the test environment.
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
