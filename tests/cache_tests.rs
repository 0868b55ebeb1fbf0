//! Integration tests for the sharded data cache.

use std::fs::{self, FileTimes};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};

use mailsummary::cache::{CacheMarker, DataCache};
use mailsummary::config::CacheConfig;
use mailsummary::error::SummaryError;

/// `count` keys other than `key` that land in the same shard.
fn shard_siblings(cache: &DataCache, key: &str, count: usize) -> Vec<String> {
    let shard = cache.shard_of(key);
    let siblings: Vec<String> = (0..100_000)
        .map(|n| format!("sibling-{n}"))
        .filter(|k| cache.shard_of(k) == shard)
        .take(count)
        .collect();
    assert_eq!(siblings.len(), count);
    siblings
}

fn backdate(path: &Path, accessed: SystemTime, modified: SystemTime) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_times(FileTimes::new().set_accessed(accessed).set_modified(modified))
        .unwrap();
}

#[test]
fn test_layout_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DataCache::new(dir.path());
    let a = cache.get_filename("bodies", "1234").unwrap();
    let b = cache.get_filename("bodies", "1234").unwrap();
    assert_eq!(a, b);
    assert!(a.starts_with(dir.path().join("bodies")));
    assert_eq!(a.file_name().unwrap(), "1234");
    let shard = a.parent().unwrap().file_name().unwrap().to_str().unwrap();
    assert_eq!(shard, format!("{:02x}", cache.shard_of("1234")));
    assert!(cache.shard_of("1234") < 64);
}

#[test]
fn test_add_write_get_read() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DataCache::new(dir.path());
    {
        let entry = cache.add("bodies", "m1").unwrap();
        (&*entry).write_all(b"cached body").unwrap();
    }
    let entry = cache.get("bodies", "m1").unwrap();
    let mut text = String::new();
    (&*entry).read_to_string(&mut text).unwrap();
    assert_eq!(text, "cached body");
    assert_eq!(entry.len().unwrap(), 11);
    assert_eq!(
        fs::read(cache.get_filename("bodies", "m1").unwrap()).unwrap(),
        b"cached body"
    );
}

#[test]
fn test_get_missing_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DataCache::new(dir.path());
    assert!(matches!(
        cache.get("bodies", "nothing"),
        Err(SummaryError::NotFound(_))
    ));
}

#[test]
fn test_concurrent_gets_share_one_handle() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(DataCache::new(dir.path()));
    let first = cache.add("parts", "k").unwrap();
    (&*first).write_all(b"0123456789").unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.get("parts", "k").unwrap())
        })
        .collect();
    for h in handles {
        let entry = h.join().unwrap();
        assert!(Arc::ptr_eq(&entry, &first));
    }

    (&*first).seek(SeekFrom::Start(2)).unwrap();
    let again = cache.get("parts", "k").unwrap();
    let mut buf = [0u8; 3];
    (&*again).read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"234");
}

#[test]
fn test_remove_invalidates_open_handle() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DataCache::new(dir.path());
    let entry = cache.add("bodies", "gone").unwrap();
    cache
        .set_marker("bodies", "gone", CacheMarker::Partial, true)
        .unwrap();
    assert!(cache
        .has_marker("bodies", "gone", CacheMarker::Partial)
        .unwrap());

    cache.remove("bodies", "gone").unwrap();
    assert!(!entry.is_valid());
    assert!((&*entry).write_all(b"late").is_err());
    assert!(!cache.get_filename("bodies", "gone").unwrap().exists());
    assert!(!cache
        .has_marker("bodies", "gone", CacheMarker::Partial)
        .unwrap());
    cache.remove("bodies", "gone").unwrap();
}

#[test]
fn test_clear_subpath() {
    let dir = tempfile::tempdir().unwrap();
    let cache = DataCache::new(dir.path());
    let keep = cache.add("keep", "a").unwrap();
    let drop_me = cache.add("drop", "b").unwrap();
    cache.clear("drop").unwrap();

    assert!(!drop_me.is_valid());
    assert!(keep.is_valid());
    assert!(!dir.path().join("drop").exists());
    assert!(cache.get_filename("keep", "a").unwrap().exists());
    cache.clear("never-created").unwrap();
}

#[test]
fn test_old_entries_expire_when_shard_is_touched() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        expire_age_secs: Some(1),
        expire_cycle_secs: 0,
        ..CacheConfig::default()
    };
    let cache = DataCache::with_config(dir.path(), &config);
    let siblings = shard_siblings(&cache, "old", 2);
    let (pinned_key, trigger) = (&siblings[0], &siblings[1]);

    drop(cache.add("bodies", "old").unwrap());
    let pinned = cache.add("bodies", pinned_key).unwrap();
    let old_path = cache.get_filename("bodies", "old").unwrap();
    assert!(old_path.exists());

    thread::sleep(Duration::from_millis(2100));
    drop(cache.add("bodies", trigger).unwrap());
    assert!(!old_path.exists(), "expired entry survived the sweep");

    // Open entries are never expired.
    assert!(cache.get_filename("bodies", pinned_key).unwrap().exists());
    assert!(pinned.is_valid());
    drop(pinned);
}

#[test]
fn test_unaccessed_entries_expire() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        expire_access_secs: Some(60),
        expire_cycle_secs: 0,
        ..CacheConfig::default()
    };
    let cache = DataCache::with_config(dir.path(), &config);
    let siblings = shard_siblings(&cache, "stale", 2);
    let (fresh, trigger) = (&siblings[0], &siblings[1]);

    drop(cache.add("bodies", "stale").unwrap());
    drop(cache.add("bodies", fresh).unwrap());
    let stale_path = cache.get_filename("bodies", "stale").unwrap();
    let fresh_path = cache.get_filename("bodies", fresh).unwrap();

    let now = SystemTime::now();
    let long_ago = now - Duration::from_secs(3600);
    backdate(&stale_path, long_ago, long_ago);
    // Only the access time counts when no age limit is set.
    backdate(&fresh_path, now, long_ago);

    drop(cache.add("bodies", trigger).unwrap());
    assert!(!stale_path.exists(), "unaccessed entry survived the sweep");
    assert!(fresh_path.exists(), "recently accessed entry was expired");
    assert!(cache.get("bodies", fresh).is_ok());
}

#[test]
fn test_no_expiry_without_thresholds() {
    let dir = tempfile::tempdir().unwrap();
    let config = CacheConfig {
        expire_cycle_secs: 0,
        ..CacheConfig::default()
    };
    let cache = DataCache::with_config(dir.path(), &config);
    let sibling = shard_siblings(&cache, "old", 1).remove(0);
    drop(cache.add("bodies", "old").unwrap());
    cache.set_expire_age(None);
    drop(cache.add("bodies", &sibling).unwrap());
    assert!(cache.get("bodies", "old").is_ok());
}
