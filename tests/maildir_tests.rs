//! Integration tests for maildir summaries.

use std::fs;
use std::path::Path;

use mailsummary::local::maildir::{self, MaildirSummary};
use mailsummary::local::MaildirFormat;
use mailsummary::model::MessageFlags;
use mailsummary::summary::{ChangeInfo, SummaryOptions};

fn open(root: &Path) -> (MaildirSummary, ChangeInfo) {
    let s = MaildirSummary::new(
        root.join(".summary"),
        MaildirFormat::new(root),
        SummaryOptions::default(),
    );
    let mut changes = ChangeInfo::new();
    s.open(&mut changes).unwrap();
    (s, changes)
}

fn cur_names(root: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(root.join("cur"))
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    names
}

fn setup() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    maildir::create(dir.path()).unwrap();
    fs::write(
        dir.path().join("new").join("1000.A"),
        "Subject: fresh\nFrom: a@example.com\n\nhello\n",
    )
    .unwrap();
    fs::write(
        dir.path().join("cur").join("999.B:2,S"),
        "Subject: old\n\nread already\n",
    )
    .unwrap();
    dir
}

#[test]
fn test_new_messages_move_to_cur() {
    let dir = setup();
    let (s, changes) = open(dir.path());

    assert_eq!(s.count(), 2);
    assert_eq!(cur_names(dir.path()), vec!["1000.A:2,", "999.B:2,S"]);
    assert!(fs::read_dir(dir.path().join("new")).unwrap().next().is_none());
    assert_eq!(changes.recent, vec!["1000.A"]);
    assert_eq!(changes.added.len(), 2);

    let fresh = s.lookup_uid("1000.A").unwrap();
    assert_eq!(fresh.subject, "fresh");
    assert_eq!(fresh.extra.filename(), "1000.A:2,");
    assert!(s.lookup_uid("999.B").unwrap().has(MessageFlags::SEEN));
}

#[test]
fn test_sync_renames_for_flag_changes() {
    let dir = setup();
    let (s, _) = open(dir.path());
    s.set_flags(
        "1000.A",
        MessageFlags::SEEN | MessageFlags::FLAGGED,
        MessageFlags::SEEN | MessageFlags::FLAGGED,
    )
    .unwrap();
    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();

    assert_eq!(cur_names(dir.path()), vec!["1000.A:2,FS", "999.B:2,S"]);
    let info = s.lookup_uid("1000.A").unwrap();
    assert_eq!(info.extra.filename(), "1000.A:2,FS");
    assert!(!info.has(MessageFlags::FOLDER_FLAGGED));

    let (t, changes) = open(dir.path());
    assert!(changes.is_empty(), "unexpected changes: {changes:?}");
    assert_eq!(
        t.lookup_uid("1000.A").unwrap().extra.filename(),
        "1000.A:2,FS"
    );
}

#[test]
fn test_external_rename_updates_flags() {
    let dir = setup();
    let (s, _) = open(dir.path());
    let cur = dir.path().join("cur");
    fs::rename(cur.join("999.B:2,S"), cur.join("999.B:2,RS")).unwrap();

    let mut changes = ChangeInfo::new();
    s.check(&mut changes).unwrap();
    assert_eq!(changes.changed, vec!["999.B"]);
    let info = s.lookup_uid("999.B").unwrap();
    assert!(info.has(MessageFlags::ANSWERED | MessageFlags::SEEN));
    assert_eq!(info.extra.filename(), "999.B:2,RS");
}

#[test]
fn test_sync_after_external_rename_of_pending_message() {
    let dir = setup();
    let (s, _) = open(dir.path());
    s.set_flags("999.B", MessageFlags::FLAGGED, MessageFlags::FLAGGED)
        .unwrap();
    let cur = dir.path().join("cur");
    fs::rename(cur.join("999.B:2,S"), cur.join("999.B:2,RS")).unwrap();

    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();
    assert_eq!(cur_names(dir.path()), vec!["1000.A:2,", "999.B:2,FS"]);
    let info = s.lookup_uid("999.B").unwrap();
    assert_eq!(info.extra.filename(), "999.B:2,FS");
    assert!(info.has(MessageFlags::SEEN | MessageFlags::FLAGGED));
    assert!(!info.has(MessageFlags::FOLDER_FLAGGED));

    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();
    assert!(changes.is_empty(), "unexpected changes: {changes:?}");
}

#[test]
fn test_external_delete_and_expunge() {
    let dir = setup();
    let (s, _) = open(dir.path());
    fs::remove_file(dir.path().join("cur").join("999.B:2,S")).unwrap();
    let mut changes = ChangeInfo::new();
    s.check(&mut changes).unwrap();
    assert_eq!(changes.removed, vec!["999.B"]);

    s.set_flags("1000.A", MessageFlags::DELETED, MessageFlags::DELETED)
        .unwrap();
    let mut changes = ChangeInfo::new();
    s.sync(true, &mut changes).unwrap();
    assert_eq!(changes.removed, vec!["1000.A"]);
    assert_eq!(s.count(), 0);
    assert!(cur_names(dir.path()).is_empty());
}

#[test]
fn test_append_and_read() {
    let dir = setup();
    let (s, _) = open(dir.path());
    let raw = b"Subject: appended\n\nbody\n";
    let info = s.append_message(raw, MessageFlags::SEEN).unwrap();

    assert_eq!(info.extra.filename(), format!("{}:2,S", info.uid()));
    assert!(dir.path().join("cur").join(info.extra.filename()).is_file());
    assert!(fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());
    assert_eq!(s.read_message(info.uid()).unwrap(), raw);

    let mut changes = ChangeInfo::new();
    s.check(&mut changes).unwrap();
    assert!(changes.is_empty());
}
