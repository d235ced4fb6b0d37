//! Verifier against live trees compiled from the same template.

mod common;

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use common::{Fixture, HOSTNAME, OS, accounts, fake_prelink, options, user_ids};
use distguard_core::accounts::{AccountDirectory, StaticAccounts};
use distguard_core::prelink::{FnUnprelinker, PrelinkTool};
use distguard_core::store::{ManifestStore, MemoryManifestStore, SqliteManifestStore};
use distguard_core::verifier::VerifyOptions;
use distguard_core::{
    DiscrepancyKind, DiscrepancyRecord, ErrorClass, ManifestSnapshot, VerifyError, VerifyReport,
};

fn kinds(report: &VerifyReport) -> Vec<(DiscrepancyKind, &str)> {
    report
        .discrepancies
        .iter()
        .map(|d| (d.kind, d.path.as_str()))
        .collect()
}

fn only(report: &VerifyReport) -> &DiscrepancyRecord {
    assert_eq!(report.discrepancies.len(), 1, "{:#?}", report.discrepancies);
    &report.discrepancies[0]
}

#[test]
fn matching_tree_has_no_discrepancies() {
    let fixture = Fixture::new();
    let report = fixture.verify(fixture.compile());

    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
    assert_eq!(report.hostname, HOSTNAME);
    assert_eq!(report.os_version, OS);

    let stats = &report.stats;
    assert!(stats.is_consistent());
    assert_eq!(stats.scanned, 14);
    assert_eq!(stats.system_count, 10);
    // /home itself plus alice and her notes.
    assert_eq!(stats.user_count, 3);
    assert_eq!(stats.no_recurse_count, 1);
    // tool, group, hosts, passwd; motd is CONFIG.
    assert_eq!(stats.sha256_files, 4);
    assert_eq!(stats.skipped, 0);
    assert!(stats.finished_at >= stats.started_at);
}

#[test]
fn system_only_run_stops_at_user_dirs() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    let verifier = fixture.verifier_with(
        Arc::new(accounts()),
        Arc::new(PrelinkTool::default()),
        VerifyOptions {
            include_user_dirs: false,
            ..options()
        },
    );
    let report = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();
    assert!(report.discrepancies.is_empty());
    assert_eq!(report.stats.user_count, 1);
    assert_eq!(report.stats.scanned, 12);
}

#[test]
fn removed_file_is_missing() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fs::remove_file(fixture.path("/etc/hosts")).unwrap();

    let report = fixture.verify(entries);
    let record = only(&report);
    assert_eq!(record.kind, DiscrepancyKind::Missing);
    assert_eq!(record.path, "/etc/hosts");
    assert_eq!(record.observed, "absent");
    assert_eq!(record.expected, "SYSTEM regular file");
}

#[test]
fn removed_subtree_is_reported_once() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fs::remove_dir_all(fixture.path("/bin")).unwrap();

    let report = fixture.verify(entries);
    assert_eq!(kinds(&report), vec![(DiscrepancyKind::Missing, "/bin")]);
    assert!(report.stats.is_consistent());
}

#[test]
fn optional_paths_may_be_absent() {
    let fixture = Fixture::new();
    fixture.rules("optional", &["/etc/motd"]);
    let entries = fixture.compile();
    fs::remove_file(fixture.path("/etc/motd")).unwrap();

    let report = fixture.verify(entries);
    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
}

#[test]
fn unexpected_file_is_extra() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.file("/etc/extra.conf", "x=1\n", 0o644);

    let report = fixture.verify(entries);
    let record = only(&report);
    assert_eq!(record.kind, DiscrepancyKind::Extra);
    assert_eq!(record.path, "/etc/extra.conf");
    assert_eq!(record.suggestion.as_deref(), Some("rm -f '/etc/extra.conf'"));
    assert!(report.stats.is_consistent());
}

#[test]
fn unexpected_directory_is_not_descended() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.mkdir("/opt/pkg", 0o755);
    fixture.file("/opt/pkg/payload", "x", 0o644);

    let report = fixture.verify(entries);
    let record = only(&report);
    assert_eq!((record.kind, record.path.as_str()), (DiscrepancyKind::Extra, "/opt"));
    assert_eq!(record.suggestion.as_deref(), Some("rm -rf '/opt'"));
}

#[test]
fn disguised_names_are_hidden() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    for name in ["/etc/...", "/etc/.. ", "/etc/   ", "/etc/..foo"] {
        fixture.file(name, "", 0o644);
    }
    fixture.file("/home/alice/...", "", 0o644);

    let report = fixture.verify(entries);
    let mut hidden: Vec<&str> = report
        .discrepancies
        .iter()
        .filter(|d| d.kind == DiscrepancyKind::Hidden)
        .map(|d| d.path.as_str())
        .collect();
    hidden.sort_unstable();
    assert_eq!(hidden, vec!["/etc/   ", "/etc/.. ", "/etc/...", "/home/alice/..."]);
    // Every strict-side stranger is also EXTRA, including the visible one.
    assert_eq!(report.count(DiscrepancyKind::Extra), 4);
}

#[test]
fn permission_change_is_the_only_finding() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.chmod("/etc/hosts", 0o600);

    let report = fixture.verify(entries);
    let record = only(&report);
    assert_eq!(record.kind, DiscrepancyKind::Permissions);
    assert_eq!(record.path, "/etc/hosts");
    assert_eq!((record.observed.as_str(), record.expected.as_str()), ("600", "644"));
    assert_eq!(record.suggestion.as_deref(), Some("chmod 644 '/etc/hosts'"));
}

#[test]
fn same_length_edit_is_digest_mismatch() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.file("/etc/hosts", "127.0.0.2 localhost\n", 0o644);

    let report = fixture.verify(entries);
    assert_eq!(kinds(&report), vec![(DiscrepancyKind::Digest, "/etc/hosts")]);
}

#[test]
fn length_change_skips_hashing() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.file("/etc/hosts", "127.0.0.1 localhost\n::1 localhost\n", 0o644);

    let report = fixture.verify(entries);
    let record = only(&report);
    assert_eq!(record.kind, DiscrepancyKind::Length);
    assert_eq!((record.observed.as_str(), record.expected.as_str()), ("34", "20"));
    assert_eq!(report.stats.sha256_files, 3);
}

#[test]
fn config_files_are_not_hashed() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.file("/etc/motd", "this host is special\n", 0o644);

    let report = fixture.verify(entries);
    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
}

#[test]
fn retargeted_symlink_is_reported() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.link("/bin/sh", "busybox");

    let report = fixture.verify(entries);
    let record = only(&report);
    assert_eq!(record.kind, DiscrepancyKind::Symlink);
    assert_eq!((record.observed.as_str(), record.expected.as_str()), ("busybox", "tool"));
    assert_eq!(record.suggestion.as_deref(), Some("ln -sfn 'tool' '/bin/sh'"));
}

#[test]
fn symlink_alternatives_are_accepted() {
    let fixture = Fixture::new();
    let mut entries = fixture.compile();
    let sh = entries.iter_mut().find(|e| e.path == "/bin/sh").unwrap();
    sh.link_target = Some("dash|tool".to_string());

    let report = fixture.verify(entries);
    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
}

#[test]
fn type_change_stops_further_checks() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fs::remove_file(fixture.path("/etc/motd")).unwrap();
    fixture.mkdir("/etc/motd", 0o700);
    fixture.file("/etc/motd/inner", "x", 0o644);

    let report = fixture.verify(entries);
    let record = only(&report);
    assert_eq!(record.kind, DiscrepancyKind::Type);
    assert_eq!(
        (record.observed.as_str(), record.expected.as_str()),
        ("directory", "regular file")
    );
}

#[test]
fn foreign_owner_is_reported_everywhere_it_is_checked() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    let manifest_len = entries.len();
    // "me" resolves to some other account on this host.
    let host = StaticAccounts::new()
        .with_user("me", common::uid().wrapping_add(1))
        .with_user("someone", common::uid())
        .with_group("us", common::gid());
    let verifier = fixture.verifier_with(
        Arc::new(host),
        Arc::new(PrelinkTool::default()),
        VerifyOptions {
            include_user_dirs: false,
            ..options()
        },
    );
    let report = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();

    assert_eq!(report.count(DiscrepancyKind::OwnerMismatch), manifest_len);
    assert_eq!(report.discrepancies.len(), manifest_len);
    let sh = report
        .discrepancies
        .iter()
        .find(|d| d.path == "/bin/sh")
        .unwrap();
    assert_eq!((sh.observed.as_str(), sh.expected.as_str()), ("someone", "me"));
    assert_eq!(sh.suggestion.as_deref(), Some("chown -h me '/bin/sh'"));
}

/// Name lookups succeed but the owner's account no longer exists, as after
/// `userdel` of a user whose files stay behind.
struct DeletedOwner(StaticAccounts);

impl AccountDirectory for DeletedOwner {
    fn uid_of(&self, name: &str) -> Option<u32> {
        self.0.uid_of(name)
    }

    fn gid_of(&self, name: &str) -> Option<u32> {
        self.0.gid_of(name)
    }

    fn user_name(&self, _uid: u32) -> Option<String> {
        None
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.0.group_name(gid)
    }
}

#[test]
fn user_files_of_unknown_accounts_have_no_owner() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    let verifier = fixture.verifier_with(
        Arc::new(DeletedOwner(accounts())),
        Arc::new(PrelinkTool::default()),
        options(),
    );
    let report = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();

    assert_eq!(
        kinds(&report),
        vec![
            (DiscrepancyKind::NoOwner, "/home/alice"),
            (DiscrepancyKind::NoOwner, "/home/alice/notes.txt"),
        ]
    );
    assert_eq!(report.discrepancies[1].observed, common::uid().to_string());
}

#[test]
fn setid_user_files_are_reported() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    let (uid, gid) = user_ids();
    fixture.file("/home/alice/run", "#!/bin/sh\n", 0o755);
    fixture.own("/home/alice/run", uid, gid, 0o4755);

    let verifier = fixture.verifier_with(
        Arc::new(accounts().with_user("alice", uid).with_group("staff", gid)),
        Arc::new(PrelinkTool::default()),
        VerifyOptions {
            system_id_max: 0,
            ..options()
        },
    );
    let report = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();
    let record = only(&report);
    assert_eq!(record.kind, DiscrepancyKind::Setuid);
    assert_eq!(record.path, "/home/alice/run");
    assert_eq!(record.observed, "4755");
    assert_eq!(record.suggestion.as_deref(), Some("chmod ug-s '/home/alice/run'"));
}

#[test]
fn mailing_list_wrapper_is_accepted() {
    const WRAPPER: &str = "/home/alice/mailman/lists/devel/wrapper";
    let fixture = Fixture::new();
    let entries = fixture.compile();
    let (uid, gid) = user_ids();
    fixture.mkdir("/home/alice/mailman/lists/devel", 0o755);
    fixture.file(WRAPPER, "#!/bin/sh\n", 0o755);
    fixture.own(WRAPPER, uid, gid, 0o2755);

    let verify = |accounts: StaticAccounts| {
        fixture
            .verifier_with(
                Arc::new(accounts),
                Arc::new(PrelinkTool::default()),
                VerifyOptions {
                    system_id_max: 0,
                    ..options()
                },
            )
            .verify(&ManifestSnapshot::from_entries(OS, entries.clone()))
            .unwrap()
    };

    let report = verify(accounts().with_user("alice", uid).with_group("mail", gid));
    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);

    // The owner must be the account named in the path.
    let report = verify(
        accounts()
            .with_user("bob", uid)
            .with_user("alice", uid + 1)
            .with_group("mail", gid),
    );
    assert_eq!(kinds(&report), vec![(DiscrepancyKind::Setuid, WRAPPER)]);

    fixture.chmod(WRAPPER, 0o2775);
    let report = verify(accounts().with_user("alice", uid).with_group("mail", gid));
    assert_eq!(kinds(&report), vec![(DiscrepancyKind::Setuid, WRAPPER)]);
}

#[test]
fn failed_unprelinking_skips_one_entry() {
    let fixture = Fixture::new();
    fixture.rules("prelink", &["/bin/tool"]);
    let output = fixture
        .compiler_with(Arc::new(fake_prelink(fixture.base())))
        .compile(&[OS.to_string()], 2, None)
        .unwrap();
    let entries = output.versions.into_iter().next().unwrap().entries;

    let broken = FnUnprelinker(|_: &Path| -> io::Result<io::Empty> {
        Err(io::Error::other("prelink: cannot open /bin/tool"))
    });
    let report = fixture
        .verifier_with(Arc::new(accounts()), Arc::new(broken), options())
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();

    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
    let stats = &report.stats;
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.prelink_files, 0);
    assert!(stats.is_consistent());
}

#[test]
fn nesting_limit_skips_deep_subtrees_without_missing_records() {
    let fixture = Fixture::new();
    fixture.mkdir("/opt/a/b/c", 0o755);
    fixture.file("/opt/a/b/c/d", "deep\n", 0o644);
    let entries = fixture.compile();

    let verifier = fixture.verifier_with(
        Arc::new(accounts()),
        Arc::new(PrelinkTool::default()),
        VerifyOptions {
            max_depth: 2,
            ..options()
        },
    );
    let report = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();

    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
    // /opt/a and /home/alice sit at the limit and are not listed.
    assert_eq!(report.stats.skipped, 2);
    assert!(report.stats.is_consistent());
}

#[test]
fn unreadable_directory_is_skipped_not_missing() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fixture.chmod("/etc", 0o000);
    let listable = fs::read_dir(fixture.path("/etc")).is_ok();
    let report = fixture.verify(entries);
    fixture.chmod("/etc", 0o755);

    // Only the mode change itself is a finding; nothing below /etc is
    // claimed absent whether or not the listing succeeded.
    assert_eq!(kinds(&report), vec![(DiscrepancyKind::Permissions, "/etc")]);
    assert_eq!(report.stats.skipped, u64::from(!listable));
    assert!(report.stats.is_consistent());
}

#[test]
fn crowded_directories_are_flagged() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    let verifier = fixture.verifier_with(
        Arc::new(accounts()),
        Arc::new(PrelinkTool::default()),
        VerifyOptions {
            big_directory_threshold: 3,
            ..options()
        },
    );
    let report = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();
    assert_eq!(
        kinds(&report),
        vec![
            (DiscrepancyKind::BigDirectory, "/"),
            (DiscrepancyKind::BigDirectory, "/etc"),
        ]
    );
}

#[test]
fn host_name_matches_the_placeholder() {
    let fixture = Fixture::new();
    fixture.file("/etc/@HOSTNAME@.conf", "role=web\n", 0o644);
    let entries = fixture.compile();
    fs::rename(
        fixture.path("/etc/@HOSTNAME@.conf"),
        fixture.path(&format!("/etc/{HOSTNAME}.conf")),
    )
    .unwrap();

    let report = fixture.verify(entries);
    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
}

#[test]
fn prelinked_binaries_verify_through_the_tool() {
    let fixture = Fixture::new();
    fixture.rules("prelink", &["/bin/tool"]);
    let tool = Arc::new(fake_prelink(fixture.base()));
    let output = fixture
        .compiler_with(tool.clone())
        .compile(&[OS.to_string()], 2, None)
        .unwrap();
    let entries = output.versions.into_iter().next().unwrap().entries;
    // A different load address on the host: only the first line changes.
    fixture.file("/bin/tool", "#!/bin/bash\necho tool\n", 0o755);

    let verifier = fixture.verifier_with(Arc::new(accounts()), tool, options());
    let report = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap();
    assert!(report.discrepancies.is_empty(), "{:#?}", report.discrepancies);
    assert_eq!(report.stats.prelink_files, 1);
    assert_eq!(report.stats.prelink_bytes, 10);
}

#[test]
fn missing_records_come_last() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fs::remove_file(fixture.path("/bin/tool")).unwrap();
    fixture.chmod("/etc/hosts", 0o640);

    let report = fixture.verify(entries);
    let order: Vec<DiscrepancyKind> = report.discrepancies.iter().map(|d| d.kind).collect();
    assert_eq!(order.last(), Some(&DiscrepancyKind::Missing));
    assert_eq!(report.count(DiscrepancyKind::Permissions), 1);
}

#[test]
fn cancelled_run_produces_no_report() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    let verifier = fixture.verifier();
    verifier.context().cancel.cancel();
    let err = verifier
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap_err();
    assert!(matches!(err, VerifyError::Interrupted));
    assert_eq!(err.class(), ErrorClass::Interrupted);
}

#[test]
fn empty_manifest_is_refused() {
    let fixture = Fixture::new();
    let err = fixture
        .verifier()
        .verify_server(&MemoryManifestStore::new())
        .unwrap_err();
    assert!(matches!(err, VerifyError::EmptyManifest { .. }));
    assert_eq!(err.class(), ErrorClass::Data);
}

#[test]
fn unreadable_root_is_fatal() {
    let fixture = Fixture::new();
    let entries = fixture.compile();
    fs::remove_dir_all(fixture.root()).unwrap();
    let err = fixture
        .verifier()
        .verify(&ManifestSnapshot::from_entries(OS, entries))
        .unwrap_err();
    assert!(matches!(err, VerifyError::RootUnreadable { .. }));
    assert_eq!(err.class(), ErrorClass::Io);
}

#[test]
fn verifies_from_the_sqlite_store() {
    let fixture = Fixture::new();
    let store = SqliteManifestStore::open(fixture.base().join("manifest.db")).unwrap();
    fixture
        .compiler()
        .compile_into_store(&store, &[OS.to_string()], 4, None)
        .unwrap();
    fixture.chmod("/bin/tool", 0o775);

    let report = fixture.verifier().verify_server(&store).unwrap();
    assert_eq!(kinds(&report), vec![(DiscrepancyKind::Permissions, "/bin/tool")]);
    assert!(!store.load_version(OS).unwrap().is_empty());
}
