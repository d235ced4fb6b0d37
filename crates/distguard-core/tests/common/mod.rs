//! Template tree fixture shared by the integration tests.
//!
//! The fixture builds one OS template under a temporary directory, owned by
//! the invoking user, whose `etc/passwd` and `etc/group` name that user
//! `me` and its primary group `us`. Tests compile the template and then
//! verify the same tree, mutated, as if it were a live host.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::{PermissionsExt, symlink};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use distguard_core::accounts::{AccountDirectory, StaticAccounts};
use distguard_core::prelink::{PrelinkTool, Unprelinker};
use distguard_core::rules::RuleStore;
use distguard_core::verifier::{Server, Throttle, VerifyOptions};
use distguard_core::{
    CancelFlag, CompilerContext, ManifestCompiler, ManifestEntry, ManifestSnapshot, Verifier,
    VerifierContext, VerifyReport,
};
use nix::unistd::{Gid, Uid, chown, getgid, getuid};
use tempfile::TempDir;

pub const OS: &str = "7";
pub const HOSTNAME: &str = "web01";

pub fn uid() -> u32 {
    getuid().as_raw()
}

pub fn gid() -> u32 {
    getgid().as_raw()
}

/// Ids outside the system range for user-owned files: the invoking user's,
/// or an unassigned pair when running as root.
pub fn user_ids() -> (u32, u32) {
    if getuid().is_root() {
        (5000, 5000)
    } else {
        (uid(), gid())
    }
}

/// Host accounts matching the template's own databases.
pub fn accounts() -> StaticAccounts {
    StaticAccounts::new()
        .with_user("me", uid())
        .with_group("us", gid())
}

/// Options with throttling off so tests never sleep.
pub fn options() -> VerifyOptions {
    VerifyOptions {
        throttle: Throttle::disabled(),
        ..VerifyOptions::default()
    }
}

/// Prelink stand-in: drops the first line of the file.
pub fn fake_prelink(dir: &Path) -> PrelinkTool {
    let script = dir.join("fake-prelink");
    fs::write(&script, "tail -n +2 \"$2\"\n").unwrap();
    PrelinkTool::new(
        "/bin/sh",
        [script.display().to_string(), "--verify".to_string()],
    )
}

pub struct Fixture {
    dir: TempDir,
}

impl Fixture {
    /// Builds the standard template:
    ///
    /// ```text
    /// /bin/tool            SYSTEM, 755
    /// /bin/sh -> tool      SYSTEM
    /// /etc/{group,hosts,passwd}
    /// /etc/motd            CONFIG
    /// /home/alice/notes.txt  under USER /home
    /// /var/cache/blob      under NO_RECURSE /var/cache
    /// ```
    pub fn new() -> Self {
        let fixture = Self {
            dir: tempfile::tempdir().unwrap(),
        };
        fs::create_dir_all(fixture.root()).unwrap();
        fixture.chmod("/", 0o755);
        for dir in ["/bin", "/etc", "/home", "/home/alice", "/var", "/var/cache"] {
            fixture.mkdir(dir, 0o755);
        }
        fixture.file("/etc/passwd", &format!("me:x:{}:{}::/:/bin/sh\n", uid(), gid()), 0o644);
        fixture.file("/etc/group", &format!("us:x:{}:\n", gid()), 0o644);
        fixture.file("/etc/hosts", "127.0.0.1 localhost\n", 0o644);
        fixture.file("/etc/motd", "welcome\n", 0o644);
        fixture.file("/bin/tool", "#!/bin/sh\necho tool\n", 0o755);
        fixture.link("/bin/sh", "tool");
        fixture.file("/home/alice/notes.txt", "hello\n", 0o600);
        fixture.file("/var/cache/blob", "x", 0o644);
        fixture.rules("config", &["/etc/motd"]);
        fixture.rules("user", &["/home"]);
        fixture.rules("no-recurse", &["/var/cache"]);
        fixture
    }

    pub fn base(&self) -> &Path {
        self.dir.path()
    }

    pub fn templates(&self) -> PathBuf {
        self.dir.path().join("templates")
    }

    pub fn rules_dir(&self) -> PathBuf {
        self.dir.path().join("rules")
    }

    /// Template root of [`OS`], also used as the live host root.
    pub fn root(&self) -> PathBuf {
        self.templates().join(OS)
    }

    pub fn path(&self, manifest_path: &str) -> PathBuf {
        self.root().join(manifest_path.trim_start_matches('/'))
    }

    pub fn mkdir(&self, manifest_path: &str, mode: u32) {
        fs::create_dir_all(self.path(manifest_path)).unwrap();
        self.chmod(manifest_path, mode);
    }

    pub fn file(&self, manifest_path: &str, content: &str, mode: u32) {
        fs::write(self.path(manifest_path), content).unwrap();
        self.chmod(manifest_path, mode);
    }

    pub fn link(&self, manifest_path: &str, target: &str) {
        let path = self.path(manifest_path);
        if fs::symlink_metadata(&path).is_ok() {
            fs::remove_file(&path).unwrap();
        }
        symlink(target, path).unwrap();
    }

    pub fn chmod(&self, manifest_path: &str, mode: u32) {
        fs::set_permissions(self.path(manifest_path), fs::Permissions::from_mode(mode)).unwrap();
    }

    /// Changes ownership, then applies `mode` (chown clears set-id bits).
    pub fn own(&self, manifest_path: &str, owner: u32, group: u32, mode: u32) {
        chown(
            &self.path(manifest_path),
            Some(Uid::from_raw(owner)),
            Some(Gid::from_raw(group)),
        )
        .unwrap();
        self.chmod(manifest_path, mode);
    }

    /// Writes one classification list of [`OS`].
    pub fn rules(&self, list: &str, paths: &[&str]) {
        self.rules_for(OS, list, paths);
    }

    pub fn rules_for(&self, os_version: &str, list: &str, paths: &[&str]) {
        let dir = self.rules_dir().join(os_version);
        fs::create_dir_all(&dir).unwrap();
        let mut content = String::from("# generated by the test fixture\n\n");
        for path in paths {
            content.push_str(path);
            content.push('\n');
        }
        fs::write(dir.join(list), content).unwrap();
    }

    pub fn compiler_with(&self, unprelinker: Arc<dyn Unprelinker>) -> ManifestCompiler {
        ManifestCompiler::new(CompilerContext::new(
            self.templates(),
            RuleStore::new(self.rules_dir()),
            unprelinker,
        ))
    }

    pub fn compiler(&self) -> ManifestCompiler {
        self.compiler_with(Arc::new(PrelinkTool::default()))
    }

    /// Compiles [`OS`] and returns its entries.
    pub fn compile(&self) -> Vec<ManifestEntry> {
        let output = self
            .compiler()
            .compile(&[OS.to_string()], 2, None)
            .unwrap();
        output.versions.into_iter().next().unwrap().entries
    }

    pub fn server(&self) -> Server {
        Server {
            hostname: HOSTNAME.to_string(),
            os_version: OS.to_string(),
            root: self.root(),
        }
    }

    pub fn verifier_with(
        &self,
        accounts: Arc<dyn AccountDirectory>,
        unprelinker: Arc<dyn Unprelinker>,
        options: VerifyOptions,
    ) -> Verifier {
        Verifier::new(VerifierContext {
            server: self.server(),
            accounts,
            unprelinker,
            options,
            cancel: CancelFlag::new(),
        })
    }

    pub fn verifier(&self) -> Verifier {
        self.verifier_with(
            Arc::new(accounts()),
            Arc::new(PrelinkTool::default()),
            options(),
        )
    }

    /// Verifies the tree against `entries` with the default verifier.
    pub fn verify(&self, entries: Vec<ManifestEntry>) -> VerifyReport {
        self.verifier()
            .verify(&ManifestSnapshot::from_entries(OS, entries))
            .unwrap()
    }
}

pub fn find<'a>(entries: &'a [ManifestEntry], path: &str) -> &'a ManifestEntry {
    entries
        .iter()
        .find(|e| e.path == path)
        .unwrap_or_else(|| panic!("{path} not in manifest"))
}
