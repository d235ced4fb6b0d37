//! Account and group directory lookups.
//!
//! The verifier needs to know which numeric ids exist on a host and which id
//! a manifest's symbolic owner maps to. The compiler needs the reverse:
//! names for the ids found in a template tree.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Host account/group directory.
pub trait AccountDirectory: Send + Sync {
    /// Whether `uid` is a known account.
    fn user_exists(&self, uid: u32) -> bool {
        self.user_name(uid).is_some()
    }

    /// Whether `gid` is a known group.
    fn group_exists(&self, gid: u32) -> bool {
        self.group_name(gid).is_some()
    }

    /// Numeric id of an account name.
    fn uid_of(&self, name: &str) -> Option<u32>;

    /// Numeric id of a group name.
    fn gid_of(&self, name: &str) -> Option<u32>;

    /// Account name of `uid`.
    fn user_name(&self, uid: u32) -> Option<String>;

    /// Group name of `gid`.
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// Errors reading account databases.
#[derive(Debug, Error)]
pub enum AccountError {
    /// The database file could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        /// Database file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

/// Bidirectional name/id table.
#[derive(Debug, Clone, Default)]
struct IdTable {
    by_id: HashMap<u32, String>,
    by_name: HashMap<String, u32>,
}

impl IdTable {
    fn insert(&mut self, name: &str, id: u32) {
        // First occurrence wins, matching getpwuid/getgrgid on flat files.
        self.by_id.entry(id).or_insert_with(|| name.to_string());
        self.by_name.entry(name.to_string()).or_insert(id);
    }
}

/// In-memory directory, used for tests and for fixed host tables.
#[derive(Debug, Clone, Default)]
pub struct StaticAccounts {
    users: IdTable,
    groups: IdTable,
}

impl StaticAccounts {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an account (builder pattern).
    #[must_use]
    pub fn with_user(mut self, name: &str, uid: u32) -> Self {
        self.users.insert(name, uid);
        self
    }

    /// Adds a group (builder pattern).
    #[must_use]
    pub fn with_group(mut self, name: &str, gid: u32) -> Self {
        self.groups.insert(name, gid);
        self
    }
}

impl AccountDirectory for StaticAccounts {
    fn uid_of(&self, name: &str) -> Option<u32> {
        self.users.by_name.get(name).copied()
    }

    fn gid_of(&self, name: &str) -> Option<u32> {
        self.groups.by_name.get(name).copied()
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        self.users.by_id.get(&uid).cloned()
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.groups.by_id.get(&gid).cloned()
    }
}

/// Directory parsed from `<root>/etc/passwd` and `<root>/etc/group`.
///
/// Used by the compiler to resolve names inside a template tree, where the
/// template's own databases are authoritative rather than the build host's.
#[derive(Debug, Clone, Default)]
pub struct PasswdFiles {
    inner: StaticAccounts,
}

impl PasswdFiles {
    /// Loads the databases below `root`. Missing files yield empty tables.
    ///
    /// # Errors
    ///
    /// Returns [`AccountError::Io`] if a database exists but cannot be read.
    pub fn load(root: &Path) -> Result<Self, AccountError> {
        let passwd = read_db(&root.join("etc/passwd"))?;
        let group = read_db(&root.join("etc/group"))?;
        Ok(Self::parse(&passwd, &group))
    }

    /// Parses colon-separated `passwd` and `group` content.
    #[must_use]
    pub fn parse(passwd: &str, group: &str) -> Self {
        let mut inner = StaticAccounts::new();
        for (name, id) in parse_colon_db(passwd) {
            inner.users.insert(name, id);
        }
        for (name, id) in parse_colon_db(group) {
            inner.groups.insert(name, id);
        }
        Self { inner }
    }
}

impl AccountDirectory for PasswdFiles {
    fn uid_of(&self, name: &str) -> Option<u32> {
        self.inner.uid_of(name)
    }

    fn gid_of(&self, name: &str) -> Option<u32> {
        self.inner.gid_of(name)
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        self.inner.user_name(uid)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.inner.group_name(gid)
    }
}

fn read_db(path: &Path) -> Result<String, AccountError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(source) => Err(AccountError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Yields `(name, id)` from `name:x:id:...` lines, skipping anything else.
fn parse_colon_db(content: &str) -> impl Iterator<Item = (&str, u32)> {
    content.lines().filter_map(|line| {
        if line.starts_with('#') {
            return None;
        }
        let mut fields = line.split(':');
        let name = fields.next().filter(|n| !n.is_empty())?;
        let id = fields.nth(1)?.parse().ok()?;
        Some((name, id))
    })
}

/// The live host's directory through NSS (`getpwuid`, `getgrnam`, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct NssAccounts;

impl AccountDirectory for NssAccounts {
    fn uid_of(&self, name: &str) -> Option<u32> {
        nix::unistd::User::from_name(name)
            .ok()
            .flatten()
            .map(|u| u.uid.as_raw())
    }

    fn gid_of(&self, name: &str) -> Option<u32> {
        nix::unistd::Group::from_name(name)
            .ok()
            .flatten()
            .map(|g| g.gid.as_raw())
    }

    fn user_name(&self, uid: u32) -> Option<String> {
        nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|u| u.name)
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        nix::unistd::Group::from_gid(nix::unistd::Gid::from_raw(gid))
            .ok()
            .flatten()
            .map(|g| g.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PASSWD: &str = "root:x:0:0:root:/root:/bin/bash\n\
                          # comment\n\
                          daemon:x:1:1::/:/sbin/nologin\n\
                          broken-line\n\
                          alice:x:1000:1000::/home/alice:/bin/bash\n";
    const GROUP: &str = "root:x:0:\nwheel:x:10:alice\nalice:x:1000:\n";

    #[test]
    fn parses_passwd_and_group() {
        let db = PasswdFiles::parse(PASSWD, GROUP);
        assert_eq!(db.uid_of("alice"), Some(1000));
        assert_eq!(db.user_name(1), Some("daemon".to_string()));
        assert_eq!(db.gid_of("wheel"), Some(10));
        assert!(db.user_exists(0));
        assert!(!db.user_exists(99_999));
        assert!(!db.group_exists(4242));
    }

    #[test]
    fn first_duplicate_id_wins() {
        let db = PasswdFiles::parse("root:x:0:0::/:\ntoor:x:0:0::/:\n", "");
        assert_eq!(db.user_name(0), Some("root".to_string()));
        assert_eq!(db.uid_of("toor"), Some(0));
    }

    #[test]
    fn load_tolerates_missing_databases() {
        let dir = tempfile::tempdir().unwrap();
        let db = PasswdFiles::load(dir.path()).unwrap();
        assert!(db.user_name(0).is_none());
    }
}
