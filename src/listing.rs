//! Administrative listing of a cache directory.
//!
//! Listing opens every slot file read-only, without a key, and never
//! takes a lock, so it's safe to run against a cache that's serving
//! live traffic.
use chrono::TimeZone;
use chrono::Utc;
use filetime::FileTime;
use std::fmt;
use std::io::Result;
use std::path::Path;
use std::path::PathBuf;

use crate::benign_error::log_os_error;
use crate::fingerprint::is_slot_name;
use crate::slot::Slot;

/// One slot file, as seen by [`list`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotEntry {
    pub path: PathBuf,
    pub mtime: FileTime,
    pub size: u64,
    /// The slot's read-ahead: stored key, NUL, and the start of the
    /// payload.
    pub head: Vec<u8>,
}

impl SlotEntry {
    fn of(slot: &Slot) -> SlotEntry {
        SlotEntry {
            path: slot.path().to_owned(),
            mtime: slot.snapshot().mtime(),
            size: slot.snapshot().size(),
            head: slot.head().to_vec(),
        }
    }

    /// Returns the key stored in the slot header, if the header is
    /// well formed.
    pub fn stored_key(&self) -> Option<&[u8]> {
        self.head
            .iter()
            .position(|&b| b == 0)
            .map(|len| &self.head[..len])
    }
}

/// Formats as `<path> <mtime> <size> <read-ahead>`, with the
/// read-ahead escaped to printable ASCII.
impl fmt::Display for SlotEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.path.display())?;

        match Utc
            .timestamp_opt(self.mtime.unix_seconds(), self.mtime.nanoseconds())
            .single()
        {
            Some(time) => write!(f, "{}", time.format("%Y-%m-%d %H:%M:%S"))?,
            None => write!(f, "@{}", self.mtime.unix_seconds())?,
        }

        write!(f, " {:10} ", self.size)?;
        for &byte in &self.head {
            write!(f, "{}", std::ascii::escape_default(byte))?;
        }

        Ok(())
    }
}

/// Returns an entry for every slot file directly under `cache_root`,
/// sorted by path.  Lock files and files whose name isn't a slot name
/// are ignored; slots that fail to open are logged and skipped.
///
/// # Errors
///
/// Returns `Err` only if `cache_root` itself can't be listed.
pub fn list(cache_root: impl AsRef<Path>) -> Result<Vec<SlotEntry>> {
    fn run(cache_root: &Path) -> Result<Vec<SlotEntry>> {
        let mut entries = Vec::new();

        for dirent in std::fs::read_dir(cache_root)? {
            let dirent = match dirent {
                Ok(dirent) => dirent,
                Err(e) => {
                    log_os_error(&format!("Unable to list {}", cache_root.display()), &e);
                    continue;
                }
            };

            if !is_slot_name(&dirent.file_name()) {
                continue;
            }

            let path = dirent.path();
            match Slot::open(&path, None) {
                Ok(Some(mut slot)) => {
                    entries.push(SlotEntry::of(&slot));
                    slot.close();
                }
                // Deleted since readdir.
                Ok(None) => {}
                Err(e) => log_os_error(&format!("Unable to open slot {}", path.display()), &e),
            }
        }

        entries.sort_by(|x, y| x.path.cmp(&y.path));
        Ok(entries)
    }

    run(cache_root.as_ref())
}

/// Three slot files and two unrelated files yield three entries.
#[test]
fn test_list() {
    use test_dir::{DirBuilder, FileType, TestDir};

    let temp = TestDir::temp()
        .create("0000000a.lock", FileType::ZeroFile(10))
        .create("README", FileType::ZeroFile(10));
    let slots: [(&str, &[u8]); 3] = [
        ("00000001", b"p=log\0<html>log</html>"),
        ("3a9f0c21", b"p=tree\0<html>tree</html>"),
        ("ffffffff", b"\0summary"),
    ];
    for (name, contents) in slots.iter() {
        std::fs::write(temp.path(name), contents).expect("write must succeed");
    }

    let entries = list(temp.path(".")).expect("list must succeed");
    assert_eq!(entries.len(), 3);

    let names: Vec<_> = entries
        .iter()
        .map(|e| e.path.file_name().expect("has name").to_owned())
        .collect();
    assert_eq!(names, vec!["00000001", "3a9f0c21", "ffffffff"]);

    assert_eq!(entries[0].stored_key(), Some(&b"p=log"[..]));
    assert_eq!(entries[0].size, 22);
    assert_eq!(entries[0].head, b"p=log\0<html>log</html>");
    assert_eq!(entries[2].stored_key(), Some(&b""[..]));
}

/// Slots list fine while someone is regenerating them.
#[test]
fn test_list_with_lock_held() {
    use crate::fingerprint::SlotPaths;
    use crate::lock::SlotLock;
    use crate::SlotKey;
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let paths = SlotPaths::for_slot(temp.path("00000001"));
    std::fs::write(&paths.slot, b"p=log\0old").expect("write must succeed");

    let key = SlotKey::new(b"p=log").expect("valid key");
    let _held = SlotLock::try_acquire(&paths, &key)
        .expect("lock must succeed")
        .expect("lock must be free");

    let entries = list(temp.path(".")).expect("list must succeed");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].head, b"p=log\0old");
}

#[test]
fn test_list_missing_dir() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    assert!(list(temp.path("missing")).is_err());
}

#[test]
fn test_display() {
    let entry = SlotEntry {
        path: PathBuf::from("/var/cache/cgit/00000001"),
        mtime: FileTime::from_unix_time(1_000_000_000, 0),
        size: 22,
        head: b"p=log\0<a>\n".to_vec(),
    };

    assert_eq!(
        entry.to_string(),
        "/var/cache/cgit/00000001 2001-09-09 01:46:40         22 p=log\\x00<a>\\n"
    );
}
