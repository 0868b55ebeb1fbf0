//! Integration tests for mbox summaries: check, quick and full sync,
//! expunge, append and out-of-band changes.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use mailsummary::local::mbox::MboxSummary;
use mailsummary::local::MboxFormat;
use mailsummary::model::MessageFlags;
use mailsummary::summary::{ChangeInfo, SummaryOptions};

const THREE: &str = "\
From alice@example.com Mon Jan  1 10:00:00 2024
From: Alice <alice@example.com>
Subject: one
Message-ID: <one@example.com>

first body

From bob@example.com Mon Jan  1 11:00:00 2024
From: Bob <bob@example.com>
Subject: two

second body
>From the archive

From carol@example.com Mon Jan  1 12:00:00 2024
From: Carol <carol@example.com>
Subject: three
Status: RO

third body

";

fn setup(contents: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let mbox = dir.path().join("inbox");
    fs::write(&mbox, contents).unwrap();
    (dir, mbox)
}

fn open(dir: &Path, mbox: &Path, options: SummaryOptions) -> (MboxSummary, ChangeInfo) {
    let s = MboxSummary::new(dir.join("inbox.summary"), MboxFormat::new(mbox), options);
    let mut changes = ChangeInfo::new();
    s.open(&mut changes).unwrap();
    (s, changes)
}

fn contents(path: &Path) -> String {
    String::from_utf8(fs::read(path).unwrap()).unwrap()
}

// ─── Check ──────────────────────────────────────────────────────────

#[test]
fn test_open_indexes_every_message() {
    let (dir, mbox) = setup(THREE);
    let (s, changes) = open(dir.path(), &mbox, SummaryOptions::default());

    assert_eq!(s.uids(), vec!["1", "2", "3"]);
    assert_eq!(changes.added, vec!["1", "2", "3"]);
    assert_eq!(changes.recent, vec!["1", "2"]);
    let first = s.lookup_uid("1").unwrap();
    assert_eq!(first.subject, "one");
    assert_eq!(first.extra.from_offset(), 0);
    assert!(first.has(MessageFlags::FOLDER_NOXEV));
    assert!(s.lookup_uid("3").unwrap().has(MessageFlags::SEEN));
    assert_eq!(s.header_extra(), THREE.len() as u64);
}

#[test]
fn test_reopen_without_changes_is_quiet() {
    let (dir, mbox) = setup(THREE);
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();

    let (t, changes) = open(dir.path(), &mbox, SummaryOptions::default());
    assert!(changes.is_empty(), "unexpected changes: {changes:?}");
    assert_eq!(t.uids(), s.uids());
    assert!(!t.is_dirty());
}

#[test]
fn test_missing_mbox_is_empty_folder() {
    let dir = tempfile::tempdir().unwrap();
    let (s, changes) = open(dir.path(), &dir.path().join("absent"), SummaryOptions::default());
    assert_eq!(s.count(), 0);
    assert!(changes.is_empty());
}

#[test]
fn test_leading_blank_line_before_first_message() {
    let (dir, mbox) = setup("\nFrom a@b Mon Jan  1 10:00:00 2024\nSubject: one\n\nbody\n\n");
    let (s, changes) = open(dir.path(), &mbox, SummaryOptions::default());
    assert_eq!(s.uids(), vec!["1"]);
    assert_eq!(changes.added, vec!["1"]);
    let info = s.lookup_uid("1").unwrap();
    assert_eq!(info.subject, "one");
    assert_eq!(info.extra.from_offset(), 1);
    let back = String::from_utf8(s.read_message("1").unwrap()).unwrap();
    assert!(back.starts_with("Subject: one\n"));
}

// ─── Sync ───────────────────────────────────────────────────────────

#[test]
fn test_first_sync_writes_markers_then_quick_sync_patches_in_place() {
    let (dir, mbox) = setup(THREE);
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    s.set_flags("2", MessageFlags::SEEN, MessageFlags::SEEN).unwrap();
    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();

    let text = contents(&mbox);
    assert!(text.contains("X-Evolution: 00000001-0000\n"));
    assert!(text.contains("X-Evolution: 00000002-0010\n"));
    assert!(text.contains("X-Evolution: 00000003-0010\n"));
    assert!(text.contains(">From the archive\n"));
    for info in s.snapshot() {
        assert!(!info.flags().intersects(MessageFlags::SYNC_PENDING));
        assert!(text[info.extra.from_offset() as usize..].starts_with("From "));
    }

    let len_before = fs::metadata(&mbox).unwrap().len();
    s.set_flags("1", MessageFlags::FLAGGED, MessageFlags::FLAGGED)
        .unwrap();
    s.sync(false, &mut changes).unwrap();
    let text = contents(&mbox);
    assert_eq!(fs::metadata(&mbox).unwrap().len(), len_before);
    assert!(text.contains("X-Evolution: 00000001-0008\n"));
    assert!(!s.lookup_uid("1").unwrap().has(MessageFlags::FOLDER_FLAGGED));
}

#[test]
fn test_quick_sync_disabled_rewrites() {
    let (dir, mbox) = setup(THREE);
    let options = SummaryOptions {
        quick_sync: false,
        ..SummaryOptions::default()
    };
    let (s, _) = open(dir.path(), &mbox, options);
    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();
    s.set_flags("3", MessageFlags::ANSWERED, MessageFlags::ANSWERED)
        .unwrap();
    s.sync(false, &mut changes).unwrap();

    let text = contents(&mbox);
    assert!(text.contains("X-Evolution: 00000003-0011\n"));
    assert!(text.contains("X-Status: A\n"));
}

#[test]
fn test_expunge_removes_deleted_messages() {
    let (dir, mbox) = setup(THREE);
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    s.set_flags("2", MessageFlags::DELETED, MessageFlags::DELETED)
        .unwrap();
    let mut changes = ChangeInfo::new();
    s.sync(true, &mut changes).unwrap();

    assert_eq!(changes.removed, vec!["2"]);
    assert_eq!(s.uids(), vec!["1", "3"]);
    let text = contents(&mbox);
    assert!(!text.contains("Subject: two"));
    assert_eq!(s.header_extra(), text.len() as u64);

    let third = s.read_message("3").unwrap();
    let third = String::from_utf8(third).unwrap();
    assert!(third.contains("Subject: three"));
    assert!(third.ends_with("third body\n"));
}

// ─── Out-of-band changes ────────────────────────────────────────────

#[test]
fn test_external_append_is_picked_up_incrementally() {
    let (dir, mbox) = setup(THREE);
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();
    let before: Vec<u64> = s.snapshot().iter().map(|i| i.extra.from_offset()).collect();

    let end = fs::metadata(&mbox).unwrap().len();
    let mut f = OpenOptions::new().append(true).open(&mbox).unwrap();
    f.write_all(b"From dave@example.com Tue Jan  2 09:00:00 2024\nSubject: four\n\nlate\n\n")
        .unwrap();
    drop(f);

    let mut changes = ChangeInfo::new();
    s.check(&mut changes).unwrap();
    assert_eq!(changes.added, vec!["4"]);
    assert_eq!(changes.recent, vec!["4"]);
    let four = s.lookup_uid("4").unwrap();
    assert_eq!(four.extra.from_offset(), end);
    assert!(four.has(MessageFlags::FOLDER_NOXEV));
    let after: Vec<u64> = s.snapshot().iter().take(3).map(|i| i.extra.from_offset()).collect();
    assert_eq!(before, after);

    s.sync(false, &mut changes).unwrap();
    assert!(contents(&mbox).contains("X-Evolution: 00000004-0000\n"));
}

#[test]
fn test_external_rewrite_triggers_rescan() {
    let (dir, mbox) = setup(THREE);
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    let mut changes = ChangeInfo::new();
    s.sync(false, &mut changes).unwrap();

    // Another client drops the first message and marks the last one flagged.
    let text = contents(&mbox);
    let second = text.find("From bob@").unwrap();
    let rest = text[second..].replace("00000003-0010", "00000003-0018");
    fs::write(&mbox, rest).unwrap();

    let mut changes = ChangeInfo::new();
    s.check(&mut changes).unwrap();
    assert_eq!(changes.removed, vec!["1"]);
    assert_eq!(changes.changed, vec!["3"]);
    assert!(changes.added.is_empty());
    assert_eq!(s.uids(), vec!["2", "3"]);
    assert_eq!(s.lookup_uid("2").unwrap().extra.from_offset(), 0);
    assert!(s.lookup_uid("3").unwrap().has(MessageFlags::FLAGGED));
}

// ─── Append / read ──────────────────────────────────────────────────

#[test]
fn test_append_then_read_back() {
    let (dir, mbox) = setup(THREE);
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    let raw = b"From: Erin <erin@example.com>\nSubject: hi\n\nFrom the start\nbody\n";
    let info = s.append_message(raw, MessageFlags::SEEN).unwrap();
    assert_eq!(info.uid(), "4");
    assert_eq!(info.subject, "hi");
    assert!(!info.has(MessageFlags::FOLDER_NOXEV));

    let text = contents(&mbox);
    assert!(text[info.extra.from_offset() as usize..].starts_with("From erin@example.com "));
    assert!(text.contains("\n>From the start\n"));

    let back = String::from_utf8(s.read_message("4").unwrap()).unwrap();
    assert!(back.starts_with("From: Erin <erin@example.com>\nSubject: hi\n"));
    assert!(back.contains("X-Evolution: 00000004-0010\n"));
    assert!(back.ends_with("\n\nFrom the start\nbody\n"));

    // The append keeps the summary in step, so nothing is rescanned.
    let mut changes = ChangeInfo::new();
    s.check(&mut changes).unwrap();
    assert!(changes.is_empty());
}

#[test]
fn test_append_to_new_mbox() {
    let dir = tempfile::tempdir().unwrap();
    let mbox = dir.path().join("outbox");
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    s.append_message(b"Subject: a\n\nx\n", MessageFlags::empty())
        .unwrap();
    s.append_message(b"Subject: b\n\ny\n", MessageFlags::DRAFT)
        .unwrap();
    assert_eq!(s.message_range("1").unwrap().0, 0);
    s.save().unwrap();

    let (t, changes) = open(dir.path(), &mbox, SummaryOptions::default());
    assert!(changes.added.is_empty());
    t.check(&mut ChangeInfo::new()).unwrap();
    assert_eq!(t.uids(), vec!["1", "2"]);
    assert!(t.lookup_uid("2").unwrap().has(MessageFlags::DRAFT));
}

#[test]
fn test_appended_messages_reload_and_quick_sync() {
    let dir = tempfile::tempdir().unwrap();
    let mbox = dir.path().join("inbox");
    fs::write(&mbox, "").unwrap();
    let (s, _) = open(dir.path(), &mbox, SummaryOptions::default());
    for n in 1..=3 {
        s.append_message(
            format!("From: u{n}@example.com\nSubject: m{n}\n\nbody {n}\n").as_bytes(),
            MessageFlags::empty(),
        )
        .unwrap();
    }
    let mut changes = ChangeInfo::new();
    s.check(&mut changes).unwrap();
    assert!(changes.is_empty());
    assert_eq!(s.uids(), vec!["1", "2", "3"]);
    let text = contents(&mbox);
    for info in s.snapshot() {
        let at = &text[info.extra.from_offset() as usize..];
        assert!(at.starts_with(&format!("From u{}@example.com ", info.uid())));
    }
    s.save().unwrap();
    drop(s);

    let (s, changes) = open(dir.path(), &mbox, SummaryOptions::default());
    assert!(changes.is_empty());
    assert_eq!(s.uids(), vec!["1", "2", "3"]);

    let before = fs::read(&mbox).unwrap();
    s.set_flags("2", MessageFlags::SEEN, MessageFlags::SEEN).unwrap();
    s.sync(false, &mut ChangeInfo::new()).unwrap();
    let after = fs::read(&mbox).unwrap();
    assert_eq!(before.len(), after.len());
    let differing: Vec<usize> = (0..before.len()).filter(|&i| before[i] != after[i]).collect();
    let marker_at = contents(&mbox).find("00000002-0010").unwrap();
    assert!(differing.iter().all(|&i| i >= marker_at && i < marker_at + 13));

    let (t, _) = open(dir.path(), &mbox, SummaryOptions::default());
    assert!(t.lookup_uid("2").unwrap().has(MessageFlags::SEEN));
    assert!(!t.lookup_uid("1").unwrap().has(MessageFlags::SEEN));
    assert!(!t.lookup_uid("3").unwrap().has(MessageFlags::SEEN));
}
