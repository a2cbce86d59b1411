//! Housekeeping for cache directories.
//!
//! Regenerators that get killed mid-fill (e.g., by the web server's
//! CGI timeout) leave their `.lock` file behind.  That's harmless for
//! correctness, since the kernel drops the dead process's `flock` and
//! the next regenerator reuses the file, but slots that are never
//! requested again would keep their lock file forever.
//! [`sweep_orphan_locks`] deletes lock files that are old and unlocked.
//!
//! Cache processes are short-lived, so they can't count fills to
//! sweep every `n`th time.  Instead, a [`SweepTrigger`] fires with
//! a randomised countdown, such that the probability of sweeping on
//! any given fill is never less than `1/n`, even for a process that
//! only ever fills one slot.
use std::cell::Cell;
use std::fs::OpenOptions;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::SystemTime;

use crate::benign_error::is_absent_file_error;
use crate::benign_error::log_os_error;
use crate::fingerprint::is_lock_name;
use crate::lock::still_linked_at;
use crate::lock::try_lock_exclusive;

// Remaining weight before the next sweep.  Zero means uninitialised:
// the first observation draws a fresh uniform countdown.
std::thread_local! {
    static COUNTDOWN: Cell<u64> = Cell::new(0);
}

/// Returns a new positive uniform countdown.
fn draw() -> u64 {
    use rand::RngCore;

    let mut rng = rand::thread_rng();
    loop {
        let value = rng.next_u64();
        if value > 0 {
            return value;
        }
    }
}

/// Subtracts `weight` from the countdown, and returns true (with a
/// fresh countdown) once it would reach zero.
fn consume(weight: u64) -> bool {
    COUNTDOWN.with(|countdown| {
        let mut current = countdown.get();
        if current == 0 {
            current = draw();
        }

        if current > weight {
            countdown.set(current - weight);
            false
        } else {
            countdown.set(draw());
            true
        }
    })
}

/// Fires roughly once every `period` events.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SweepTrigger {
    // Weight of a single event: `u64::MAX / period`, rounded up.
    // `None` never fires.
    weight: Option<u64>,
}

impl SweepTrigger {
    /// Returns a trigger that fires roughly every `period` events, or
    /// never if `period == 0`.
    pub fn new(period: u64) -> SweepTrigger {
        if period == 0 {
            return SweepTrigger { weight: None };
        }

        let weight = (u64::MAX / period) + ((u64::MAX % period) > 0) as u64;
        SweepTrigger {
            weight: Some(weight),
        }
    }

    /// Returns a trigger that never fires.
    pub fn never() -> SweepTrigger {
        SweepTrigger::new(0)
    }

    /// Observes one event, and returns whether the caller should
    /// sweep now.
    pub fn event(self) -> bool {
        match self.weight {
            Some(weight) => consume(weight),
            None => false,
        }
    }
}

/// Deletes the lock file at `path` if it is older than `max_age` (at
/// `now`) and nobody holds its lock.  Returns whether the file was
/// deleted.
fn sweep_one(path: &Path, max_age: Duration, now: SystemTime) -> Result<bool> {
    let mtime = match std::fs::metadata(path) {
        Ok(meta) => meta.modified()?,
        Err(e) if is_absent_file_error(&e) => return Ok(false),
        Err(e) => return Err(e),
    };

    match now.duration_since(mtime) {
        Ok(age) if age >= max_age => {}
        _ => return Ok(false),
    }

    // Open without `create`: we don't want to resurrect a lock file
    // that was just published or discarded.
    let file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if is_absent_file_error(&e) => return Ok(false),
        Err(e) => return Err(e),
    };

    if !try_lock_exclusive(&file)? || !still_linked_at(&file, path)? {
        return Ok(false);
    }

    // We hold the lock on the file at `path`, so no regenerator can be
    // filling it.  Regenerators that opened it but haven't locked it
    // yet will notice it's gone once they get the lock.
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if is_absent_file_error(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Deletes unlocked lock files older than `max_age` directly under
/// `cache_root`, and returns their paths.  Slot files and unrelated
/// files are never touched.
///
/// Errors on individual files are logged and skipped; only a failure
/// to list `cache_root` itself is returned.
pub fn sweep_orphan_locks(cache_root: &Path, max_age: Duration) -> Result<Vec<PathBuf>> {
    let now = SystemTime::now();
    let mut removed = Vec::new();

    for dirent in std::fs::read_dir(cache_root)?.flatten() {
        let name = dirent.file_name();
        if !is_lock_name(&name) {
            continue;
        }

        let path = dirent.path();
        match sweep_one(&path, max_age, now) {
            Ok(true) => {
                tracing::debug!("[cache] removed orphaned lock file {}", path.display());
                removed.push(path);
            }
            Ok(false) => {}
            Err(e) => log_os_error(&format!("Unable to sweep lock file {}", path.display()), &e),
        }
    }

    removed.sort();
    Ok(removed)
}

#[test]
fn test_trigger_period_one() {
    let trigger = SweepTrigger::new(1);

    for _ in 0..10 {
        assert!(trigger.event());
    }
}

#[test]
fn test_trigger_never() {
    let trigger = SweepTrigger::never();

    for _ in 0..1000 {
        assert!(!trigger.event());
    }

    // A huge period is as good as never.
    let trigger = SweepTrigger::new(u64::MAX);
    for _ in 0..1000 {
        assert!(!trigger.event());
    }
}

/// With a period of 10, we never go more than 10 events without a
/// sweep, and we sometimes wait nearly that long.
#[test]
fn test_trigger_period() {
    let trigger = SweepTrigger::new(10);

    let mut max_delay = 0;
    for _ in 0..200 {
        let mut fired = false;
        for i in 1..=10 {
            fired = trigger.event();
            if fired {
                max_delay = max_delay.max(i);
                break;
            }
        }

        assert!(fired);
    }

    // Waiting 9 or 10 events has a 20% chance per round.
    assert!(max_delay >= 9);
}

#[cfg(test)]
fn age(path: &Path, secs: i64) {
    use filetime::FileTime;

    let then = FileTime::from_unix_time(FileTime::now().unix_seconds() - secs, 0);
    filetime::set_file_mtime(path, then).expect("set mtime must succeed");
}

/// Old unlocked lock files go away; recent ones, locked ones, slots,
/// and unrelated files stay.
#[test]
fn test_sweep() {
    use crate::fingerprint::SlotPaths;
    use crate::lock::SlotLock;
    use crate::SlotKey;
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("00000001", FileType::ZeroFile(10))
        .create("00000001.lock", FileType::ZeroFile(10))
        .create("00000002.lock", FileType::ZeroFile(10))
        .create("notes.lock", FileType::ZeroFile(10));

    // A live regenerator on slot 3.
    let busy = SlotPaths::for_slot(temp.path("00000003"));
    let key = SlotKey::new(b"p=log").expect("valid key");
    let held = SlotLock::try_acquire(&busy, &key)
        .expect("lock must succeed")
        .expect("lock must be free");

    age(&temp.path("00000001"), 7200);
    age(&temp.path("00000001.lock"), 7200);
    age(&temp.path("notes.lock"), 7200);
    age(&busy.lock, 7200);

    let removed =
        sweep_orphan_locks(&temp.path("."), Duration::from_secs(3600)).expect("sweep must succeed");
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].file_name(), temp.path("00000001.lock").file_name());

    assert!(std::fs::metadata(temp.path("00000001")).is_ok());
    assert!(std::fs::metadata(temp.path("00000001.lock")).is_err());
    // Too recent.
    assert!(std::fs::metadata(temp.path("00000002.lock")).is_ok());
    // Not a slot lock.
    assert!(std::fs::metadata(temp.path("notes.lock")).is_ok());
    // Still locked.
    assert!(std::fs::metadata(&busy.lock).is_ok());

    drop(held);
}
