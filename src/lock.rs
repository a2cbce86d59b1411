//! Regenerators write a slot's new content to `<slot>.lock` while
//! holding an exclusive `flock` on that file, then rename it over the
//! slot.  Lock attempts never block: a contended lock reports busy,
//! and the caller falls back to stale content or uncached rendering.
//!
//! `flock` locks belong to the open file description, so the kernel
//! releases them when a regenerator dies, and closing unrelated
//! descriptors for the same file (as `fcntl` record locks would) can't
//! drop them by accident.  A lock file left behind by a dead process
//! can thus simply be locked, truncated, and reused.
use std::fs::File;
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::io::Result;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::benign_error::is_absent_file_error;
use crate::benign_error::is_busy_lock_error;
use crate::fingerprint::SlotPaths;
use crate::slot::Slot;
use crate::slot::Snapshot;
use crate::Generator;
use crate::SlotKey;

/// Attempts to take an exclusive `flock` on `file` without blocking.
/// Returns false if someone else holds a lock on it.
pub(crate) fn try_lock_exclusive(file: &File) -> Result<bool> {
    loop {
        // SAFETY: `file` owns an open descriptor.
        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret == 0 {
            return Ok(true);
        }

        let error = std::io::Error::last_os_error();
        if error.kind() == ErrorKind::Interrupted {
            continue;
        }

        if is_busy_lock_error(&error) {
            return Ok(false);
        }

        return Err(error);
    }
}

/// Returns whether `path` still names the file `file` has open.  Lock
/// files get renamed (published) and unlinked (discarded or swept)
/// under our feet; a lock on an inode that's no longer at `path` is
/// worthless.
pub(crate) fn still_linked_at(file: &File, path: &Path) -> Result<bool> {
    let ours = Snapshot::of(&file.metadata()?);

    match std::fs::metadata(path) {
        Ok(meta) => Ok(ours.same_file(&meta)),
        Err(e) if is_absent_file_error(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Exclusive write access to a slot, held until the lock is
/// discarded, published, or dropped.
#[derive(Debug)]
pub struct SlotLock {
    paths: SlotPaths,
    file: File,
    key_len: usize,
}

impl SlotLock {
    /// Attempts to lock the slot at `paths` for regeneration under
    /// `key`.
    ///
    /// Returns `Ok(None)` if another process is already regenerating
    /// that slot.  On success, the lock file holds exactly the slot
    /// header for `key`.
    pub fn try_acquire(paths: &SlotPaths, key: &SlotKey) -> Result<Option<SlotLock>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(0o600)
            .open(&paths.lock)?;

        if !try_lock_exclusive(&file)? {
            return Ok(None);
        }

        // Between `open` and `flock`, the previous holder may have
        // published or discarded the file we opened.  If so, someone
        // else won the race: report busy rather than writing into a
        // file that's now a live slot.
        if !still_linked_at(&file, &paths.lock)? {
            return Ok(None);
        }

        // An abandoned fill may have left bytes behind.
        file.set_len(0)?;
        (&file).write_all(&key.header())?;

        Ok(Some(SlotLock {
            paths: paths.clone(),
            file,
            key_len: key.as_bytes().len(),
        }))
    }

    pub fn paths(&self) -> &SlotPaths {
        &self.paths
    }

    /// Runs `generator` with the lock file as its sink, appending the
    /// payload after the key header.
    pub fn fill<G: Generator + ?Sized>(&mut self, generator: &mut G) -> Result<()> {
        generator.generate(&mut self.file)?;
        self.file.flush()
    }

    /// Deletes the lock file and releases the lock.
    pub fn discard(self) -> Result<()> {
        match std::fs::remove_file(&self.paths.lock) {
            Ok(()) => Ok(()),
            Err(e) if is_absent_file_error(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Atomically renames the lock file over the slot, and returns the
    /// new slot, still open on the lock file's descriptor.
    ///
    /// On failure, the lock file is deleted.
    pub fn publish(self) -> Result<Slot> {
        let snapshot = Snapshot::of(&self.file.metadata()?);

        if let Err(e) = std::fs::rename(&self.paths.lock, &self.paths.slot) {
            let _ = std::fs::remove_file(&self.paths.lock);
            return Err(e);
        }

        Ok(Slot::published(
            self.paths.slot,
            self.file,
            snapshot,
            self.key_len,
        ))
    }
}

#[cfg(test)]
fn test_paths(temp: &test_dir::TestDir) -> SlotPaths {
    use test_dir::DirBuilder;

    SlotPaths::for_slot(temp.path("0a000000"))
}

/// A second lock attempt on the same slot reports busy until the
/// first lock is released.
#[test]
fn test_single_writer() {
    use test_dir::TestDir;

    let temp = TestDir::temp();
    let paths = test_paths(&temp);
    let key = SlotKey::new(b"p=log").expect("valid key");

    let first = SlotLock::try_acquire(&paths, &key)
        .expect("lock must succeed")
        .expect("lock must be free");
    assert!(SlotLock::try_acquire(&paths, &key)
        .expect("lock must succeed")
        .is_none());

    first.discard().expect("discard must succeed");
    assert!(std::fs::metadata(&paths.lock).is_err());

    let second = SlotLock::try_acquire(&paths, &key)
        .expect("lock must succeed")
        .expect("lock must be free");
    drop(second);
}

/// A lock file left behind (e.g., by a killed process) is reused,
/// and its stale contents are dropped.
#[test]
fn test_orphan_lock_reused() {
    use test_dir::TestDir;

    let temp = TestDir::temp();
    let paths = test_paths(&temp);
    std::fs::write(&paths.lock, b"old-key\0half a page that never finished")
        .expect("write must succeed");

    let key = SlotKey::new(b"p=log").expect("valid key");
    let lock = SlotLock::try_acquire(&paths, &key)
        .expect("lock must succeed")
        .expect("orphaned lock must be free");

    assert_eq!(
        std::fs::read(&paths.lock).expect("read must succeed"),
        b"p=log\0"
    );
    drop(lock);
}

/// Publishing renames the lock file over the slot, with the header
/// followed by the generated payload.
#[test]
fn test_fill_and_publish() {
    use crate::Sink;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let paths = test_paths(&temp);
    std::fs::write(&paths.slot, b"p=log\0old").expect("write must succeed");

    let key = SlotKey::new(b"p=log").expect("valid key");
    let mut lock = SlotLock::try_acquire(&paths, &key)
        .expect("lock must succeed")
        .expect("lock must be free");

    let mut generator = |out: &mut dyn Sink| out.write_all(b"<html>new</html>");
    lock.fill(&mut generator).expect("fill must succeed");

    let mut slot = lock.publish().expect("publish must succeed");
    assert!(std::fs::metadata(&paths.lock).is_err());
    assert_eq!(
        std::fs::read(&paths.slot).expect("read must succeed"),
        b"p=log\0<html>new</html>"
    );
    assert_eq!(slot.snapshot().size(), 22);

    // The published slot serves from the lock file's descriptor.
    let out_path = temp.path("out");
    let mut out = File::create(&out_path).expect("create must succeed");
    slot.print(&mut out).expect("print must succeed");
    assert_eq!(
        std::fs::read(&out_path).expect("read must succeed"),
        b"<html>new</html>"
    );
}

/// A failed fill leaves the slot alone once the lock is discarded.
#[test]
fn test_fill_failure() {
    use crate::Sink;
    use test_dir::TestDir;

    let temp = TestDir::temp();
    let paths = test_paths(&temp);
    std::fs::write(&paths.slot, b"p=log\0old").expect("write must succeed");

    let key = SlotKey::new(b"p=log").expect("valid key");
    let mut lock = SlotLock::try_acquire(&paths, &key)
        .expect("lock must succeed")
        .expect("lock must be free");

    let mut generator = |out: &mut dyn Sink| -> Result<()> {
        out.write_all(b"partial")?;
        Err(std::io::Error::new(ErrorKind::Other, "render failed"))
    };
    assert!(lock.fill(&mut generator).is_err());
    lock.discard().expect("discard must succeed");

    assert!(std::fs::metadata(&paths.lock).is_err());
    assert_eq!(
        std::fs::read(&paths.slot).expect("read must succeed"),
        b"p=log\0old"
    );
}

/// If the lock file we opened is renamed away before we lock it, the
/// attempt reports busy instead of scribbling over the renamed file.
#[test]
fn test_lock_file_replaced() {
    use test_dir::TestDir;

    let temp = TestDir::temp();
    let paths = test_paths(&temp);
    std::fs::write(&paths.lock, b"").expect("write must succeed");

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&paths.lock)
        .expect("open must succeed");
    assert!(still_linked_at(&file, &paths.lock).expect("stat must succeed"));

    std::fs::rename(&paths.lock, &paths.slot).expect("rename must succeed");
    assert!(!still_linked_at(&file, &paths.lock).expect("stat must succeed"));

    std::fs::write(&paths.lock, b"").expect("write must succeed");
    assert!(!still_linked_at(&file, &paths.lock).expect("stat must succeed"));
}
