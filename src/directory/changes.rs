//! Uncommitted account changes.

use std::collections::HashSet;

use ldap3::Mod;
use zeroize::Zeroizing;

use super::{DONT_EXPIRE_PASSWORD, DirectoryError, DirectoryIdentity, Result};

const UNICODE_PWD: &str = "unicodePwd";
const USER_ACCOUNT_CONTROL: &str = "userAccountControl";
const PWD_LAST_SET: &str = "pwdLastSet";
const LOCKOUT_TIME: &str = "lockoutTime";

/// Set of changes staged against one account.
///
/// Nothing reaches the directory until the value is handed to
/// [`super::DirectorySession::commit`], which writes every change at once.
pub struct AccountChanges {
    target: String,
    sam_account_name: String,
    user_account_control: u32,
    password: Option<Zeroizing<String>>,
    password_never_expires: Option<bool>,
    expire_password: bool,
    unlock: bool,
}

impl std::fmt::Debug for AccountChanges {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountChanges")
            .field("target", &self.target)
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .field("password_never_expires", &self.password_never_expires)
            .field("expire_password", &self.expire_password)
            .field("unlock", &self.unlock)
            .finish()
    }
}

impl AccountChanges {
    /// Start an empty set of changes for `account`.
    pub fn new(account: &DirectoryIdentity) -> Self {
        Self {
            target: account.distinguished_name.clone(),
            sam_account_name: account.sam_account_name.clone(),
            user_account_control: account.user_account_control,
            password: None,
            password_never_expires: None,
            expire_password: false,
            unlock: false,
        }
    }

    /// Stage a new password.
    pub fn set_password(&mut self, password: &str) -> Result<&mut Self> {
        if password.is_empty() {
            return Err(DirectoryError::InvalidChange("password is empty"));
        }

        self.password = Some(Zeroizing::new(password.to_owned()));
        Ok(self)
    }

    /// Stage the "password never expires" flag.
    pub fn set_password_never_expires(&mut self, value: bool) -> &mut Self {
        self.password_never_expires = Some(value);
        self
    }

    /// Stage an immediate password expiry, forcing a change at next logon.
    pub fn expire_password_now(&mut self) -> &mut Self {
        self.expire_password = true;
        self
    }

    /// Stage an account unlock.
    pub fn unlock(&mut self) -> &mut Self {
        self.unlock = true;
        self
    }

    /// Distinguished name of the account.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn sam_account_name(&self) -> &str {
        &self.sam_account_name
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_ref().map(|p| p.as_str())
    }

    pub fn password_never_expires(&self) -> Option<bool> {
        self.password_never_expires
    }

    pub fn expires_password(&self) -> bool {
        self.expire_password
    }

    pub fn unlocks(&self) -> bool {
        self.unlock
    }

    pub fn is_empty(&self) -> bool {
        self.password.is_none()
            && self.password_never_expires.is_none()
            && !self.expire_password
            && !self.unlock
    }

    /// `userAccountControl` once the staged flag is applied.
    pub fn user_account_control(&self) -> u32 {
        match self.password_never_expires {
            Some(true) => self.user_account_control | DONT_EXPIRE_PASSWORD,
            Some(false) => self.user_account_control & !DONT_EXPIRE_PASSWORD,
            None => self.user_account_control,
        }
    }

    /// LDAP modifications, in the order the directory must apply them.
    ///
    /// `pwdLastSet` follows `unicodePwd` since setting a password stamps it.
    pub fn modifications(&self) -> Vec<Mod<Vec<u8>>> {
        let mut mods = Vec::new();

        if let Some(password) = &self.password {
            mods.push(replace(UNICODE_PWD, encode_ad_password(password)));
        }
        if self.password_never_expires.is_some() {
            mods.push(replace(
                USER_ACCOUNT_CONTROL,
                self.user_account_control().to_string().into_bytes(),
            ));
        }
        if self.expire_password {
            mods.push(replace(PWD_LAST_SET, b"0".to_vec()));
        }
        if self.unlock {
            mods.push(replace(LOCKOUT_TIME, b"0".to_vec()));
        }

        mods
    }
}

fn replace(attribute: &str, value: Vec<u8>) -> Mod<Vec<u8>> {
    Mod::Replace(attribute.as_bytes().to_vec(), HashSet::from([value]))
}

/// Encode a password for `unicodePwd`: quoted, then UTF-16LE.
pub fn encode_ad_password(password: &str) -> Vec<u8> {
    format!("\"{password}\"")
        .encode_utf16()
        .flat_map(u16::to_le_bytes)
        .collect()
}
