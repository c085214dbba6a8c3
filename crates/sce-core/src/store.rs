//! Crash-safe JSON persistence.
//!
//! Every mutation goes through atomic file replacement: serialize to a
//! sibling `.tmp`, fsync, rename into place, then best-effort fsync the
//! parent directory. A reader concurrent with a writer sees either the
//! fully-prior or fully-new content, never a torn document.
//!
//! The append-only event logs are JSON-lines; a crash mid-append may leave a
//! partial trailing line, which readers silently drop.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::clock::SharedClock;
use crate::error::{CoreError, Result};
use crate::layout::Layout;

/// Best-effort fsync of the parent directory after a rename, ensuring the
/// directory entry update is durable on crash. Errors are ignored because
/// not all platforms support opening a directory for sync.
fn fsync_parent_dir(path: &Path) {
    if let Some(parent) = path.parent()
        && let Ok(dir) = File::open(parent)
    {
        let _ = dir.sync_all();
    }
}

/// Atomically replace `path` with the pretty-printed JSON of `value`.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::io(format!("failed to create dir {}", parent.display()), e))?;
    }

    let tmp = path.with_extension("tmp");
    let data = serde_json::to_vec_pretty(value)
        .map_err(|e| CoreError::io("failed to serialize JSON", e))?;

    {
        let mut f = File::create(&tmp)
            .map_err(|e| CoreError::io(format!("failed to create tmp file {}", tmp.display()), e))?;
        f.write_all(&data)
            .map_err(|e| CoreError::io(format!("failed to write tmp file {}", tmp.display()), e))?;
        f.sync_all().ok();
    }

    fs::rename(&tmp, path).map_err(|e| {
        CoreError::io(
            format!("failed to rename {} to {}", tmp.display(), path.display()),
            e,
        )
    })?;

    fsync_parent_dir(path);
    Ok(())
}

/// Load a JSON document; `Ok(None)` when the file does not exist,
/// `Corruption` when it exists but does not parse.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .map_err(|e| CoreError::io(format!("failed to read {}", path.display()), e))?;
    let value: T = serde_json::from_str(&content)
        .map_err(|e| CoreError::corrupt(format!("failed to parse {}", path.display()), e))?;
    Ok(Some(value))
}

/// Append one JSON line to an append-only log.
pub fn append_jsonl<T: Serialize>(path: &Path, event: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CoreError::io(format!("failed to create dir {}", parent.display()), e))?;
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CoreError::io(format!("failed to open log {}", path.display()), e))?;
    let mut writer = std::io::BufWriter::new(file);

    let line = serde_json::to_string(event)
        .map_err(|e| CoreError::io("failed to serialize event", e))?;
    writeln!(writer, "{line}")
        .map_err(|e| CoreError::io(format!("failed to append to {}", path.display()), e))?;
    writer
        .flush()
        .map_err(|e| CoreError::io(format!("failed to flush {}", path.display()), e))?;
    Ok(())
}

/// Read a JSON-lines log. Lines that fail to parse (torn tail after a crash,
/// foreign garbage) are dropped silently. `tail` truncates to the last N
/// lines; truncation is by line count only, never by bytes.
pub fn read_jsonl<T: DeserializeOwned>(path: &Path, tail: Option<usize>) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = File::open(path)
        .map_err(|e| CoreError::io(format!("failed to open log {}", path.display()), e))?;
    let reader = BufReader::new(file);

    let mut events: Vec<T> = Vec::new();
    for line in reader.lines() {
        let line =
            line.map_err(|e| CoreError::io(format!("failed to read {}", path.display()), e))?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(event) = serde_json::from_str::<T>(&line) {
            events.push(event);
        }
    }

    if let Some(n) = tail
        && events.len() > n
    {
        events.drain(..events.len() - n);
    }
    Ok(events)
}

/// Advisory per-spec lock document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub owner: String,
    pub hostname: String,
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub timeout_hours: f64,
}

impl LockInfo {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        let age_hours = (now - self.timestamp).num_milliseconds() as f64 / 3_600_000.0;
        age_hours > self.timeout_hours
    }
}

/// Held advisory lock; released on [`SpecLock::release`] or Drop.
#[derive(Debug)]
pub struct SpecLock {
    path: PathBuf,
    owner: String,
    released: bool,
}

impl SpecLock {
    /// Acquire the advisory lock for `spec_id`.
    ///
    /// Fails with `Conflict` when a non-stale lock is held by another owner
    /// and `force` is false. A stale or unparseable lock document is
    /// replaced. Re-acquisition by the same owner refreshes the timestamp.
    pub fn acquire(
        layout: &Layout,
        spec_id: &str,
        owner: &str,
        reason: &str,
        timeout_hours: f64,
        force: bool,
        clock: &SharedClock,
    ) -> Result<Self> {
        let path = layout.spec_lock(spec_id);
        let now = clock.now();

        if path.exists() {
            match read_json::<LockInfo>(&path) {
                Ok(Some(existing)) => {
                    let same_owner = existing.owner == owner;
                    if !same_owner && !existing.is_stale(now) && !force {
                        return Err(CoreError::Conflict(format!(
                            "spec '{spec_id}' locked by {} on {} since {} ({})",
                            existing.owner, existing.hostname, existing.timestamp, existing.reason
                        )));
                    }
                }
                // Corrupt lock files count as stale.
                _ => {}
            }
        }

        let info = LockInfo {
            owner: owner.to_string(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            timestamp: now,
            reason: reason.to_string(),
            timeout_hours,
        };
        write_json(&path, &info)?;

        Ok(Self {
            path,
            owner: owner.to_string(),
            released: false,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn release(&mut self) -> Result<()> {
        if !self.released && self.path.exists() {
            fs::remove_file(&self.path).map_err(|e| {
                CoreError::io(format!("failed to remove lock {}", self.path.display()), e)
            })?;
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for SpecLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// Read the current lock holder for a spec, if any.
pub fn read_lock(layout: &Layout, spec_id: &str) -> Result<Option<LockInfo>> {
    read_json(&layout.spec_lock(spec_id))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;
    use tempfile::tempdir;

    use super::*;
    use crate::clock::{ManualClock, system_clock};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Doc {
        name: String,
        count: u32,
    }

    fn manual_clock() -> (Arc<ManualClock>, SharedClock) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
        ));
        let shared: SharedClock = clock.clone();
        (clock, shared)
    }

    #[test]
    fn write_and_read_roundtrip() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("nested").join("doc.json");
        let doc = Doc {
            name: "demo".into(),
            count: 3,
        };

        write_json(&path, &doc).expect("write");
        let loaded: Doc = read_json(&path).expect("read").expect("exists");
        assert_eq!(loaded, doc);
    }

    #[test]
    fn read_missing_file_is_none() {
        let td = tempdir().expect("tempdir");
        let loaded: Option<Doc> = read_json(&td.path().join("absent.json")).expect("read");
        assert!(loaded.is_none());
    }

    #[test]
    fn read_invalid_json_is_corruption() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("bad.json");
        fs::write(&path, "{not-json").expect("write");

        let err = read_json::<Doc>(&path).expect_err("must fail");
        assert_eq!(err.machine_name(), "corruption");
    }

    #[test]
    fn write_leaves_no_tmp_behind() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("doc.json");
        write_json(
            &path,
            &Doc {
                name: "x".into(),
                count: 0,
            },
        )
        .expect("write");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn jsonl_appends_and_reads_in_order() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        for i in 0..5 {
            append_jsonl(
                &path,
                &Doc {
                    name: format!("e{i}"),
                    count: i,
                },
            )
            .expect("append");
        }

        let events: Vec<Doc> = read_jsonl(&path, None).expect("read");
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].name, "e0");
        assert_eq!(events[4].name, "e4");
    }

    #[test]
    fn jsonl_reader_drops_torn_tail() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");

        append_jsonl(
            &path,
            &Doc {
                name: "ok".into(),
                count: 1,
            },
        )
        .expect("append");
        // Simulate a crash mid-append.
        let mut f = OpenOptions::new().append(true).open(&path).expect("open");
        f.write_all(b"{\"name\":\"torn").expect("write");
        drop(f);

        let events: Vec<Doc> = read_jsonl(&path, None).expect("read");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "ok");
    }

    #[test]
    fn jsonl_tail_truncates_by_line_count() {
        let td = tempdir().expect("tempdir");
        let path = td.path().join("events.jsonl");
        for i in 0..10 {
            append_jsonl(
                &path,
                &Doc {
                    name: format!("e{i}"),
                    count: i,
                },
            )
            .expect("append");
        }

        let events: Vec<Doc> = read_jsonl(&path, Some(3)).expect("read");
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].name, "e7");
        assert_eq!(events[2].name, "e9");
    }

    #[test]
    fn concurrent_readers_never_observe_torn_writes() {
        use std::sync::atomic::{AtomicBool, Ordering};

        #[derive(Debug, Serialize, Deserialize)]
        struct Pair {
            left: u64,
            right: u64,
        }

        let td = tempdir().expect("tempdir");
        let path = td.path().join("pair.json");
        write_json(&path, &Pair { left: 0, right: 0 }).expect("seed");

        let done = std::sync::Arc::new(AtomicBool::new(false));
        let writer_path = path.clone();
        let writer_done = done.clone();
        let writer = std::thread::spawn(move || {
            for i in 1..300u64 {
                write_json(&writer_path, &Pair { left: i, right: i }).expect("write");
            }
            writer_done.store(true, Ordering::SeqCst);
        });

        let mut observed = 0u64;
        while !done.load(Ordering::SeqCst) {
            // Every read sees a fully-prior or fully-new document, never a
            // mix of the two halves.
            let pair: Pair = read_json(&path).expect("read").expect("exists");
            assert_eq!(pair.left, pair.right);
            observed += 1;
        }
        writer.join().expect("writer");
        assert!(observed > 0);
    }

    #[test]
    fn lock_acquire_release_cycle() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let clock = system_clock();

        let mut lock =
            SpecLock::acquire(&layout, "s1", "alice", "pipeline run", 1.0, false, &clock)
                .expect("acquire");
        assert!(layout.spec_lock("s1").exists());

        lock.release().expect("release");
        assert!(!layout.spec_lock("s1").exists());
    }

    #[test]
    fn lock_conflicts_with_foreign_holder() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let clock = system_clock();

        let _held =
            SpecLock::acquire(&layout, "s1", "alice", "run", 1.0, false, &clock).expect("acquire");

        let err = SpecLock::acquire(&layout, "s1", "bob", "run", 1.0, false, &clock)
            .expect_err("must conflict");
        assert_eq!(err.machine_name(), "conflict");
    }

    #[test]
    fn force_steals_foreign_lock() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let clock = system_clock();

        let mut held =
            SpecLock::acquire(&layout, "s1", "alice", "run", 1.0, false, &clock).expect("acquire");

        let stolen = SpecLock::acquire(&layout, "s1", "bob", "takeover", 1.0, true, &clock)
            .expect("force acquire");
        assert_eq!(
            read_lock(&layout, "s1").expect("read").expect("held").owner,
            "bob"
        );
        drop(stolen);
        held.released = true; // alice's guard must not delete bob's lock in this test
    }

    #[test]
    fn stale_lock_is_replaced() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let (manual, clock) = manual_clock();

        {
            let mut l = SpecLock::acquire(&layout, "s1", "alice", "run", 2.0, false, &clock)
                .expect("acquire");
            l.released = true; // leave the document behind, as after a crash
        }

        // 3 hours later the 2h lock is stale for any other owner.
        manual.advance_ms(3 * 3_600_000);
        let taken = SpecLock::acquire(&layout, "s1", "bob", "resume", 2.0, false, &clock)
            .expect("stale lock replaced");
        assert_eq!(taken.owner(), "bob");
    }

    #[test]
    fn corrupt_lock_counts_as_stale() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let clock = system_clock();

        let path = layout.spec_lock("s1");
        fs::create_dir_all(path.parent().unwrap()).expect("mkdir");
        fs::write(&path, "garbage").expect("write");

        let taken = SpecLock::acquire(&layout, "s1", "bob", "run", 1.0, false, &clock)
            .expect("corrupt lock replaced");
        assert_eq!(taken.owner(), "bob");
    }

    #[test]
    fn drop_releases_lock() {
        let td = tempdir().expect("tempdir");
        let layout = Layout::with_default_ns(td.path());
        let clock = system_clock();

        {
            let _lock = SpecLock::acquire(&layout, "s1", "alice", "run", 1.0, false, &clock)
                .expect("acquire");
            assert!(layout.spec_lock("s1").exists());
        }
        assert!(!layout.spec_lock("s1").exists());
    }
}
