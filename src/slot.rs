//! Slot files hold a NUL-terminated key followed by the cached
//! payload.  This module opens slots, checks their key and freshness,
//! and streams their payload to an output sink.  Slot files are never
//! modified in place: a regeneration renames a whole new file over the
//! slot path, so an open `Slot` keeps seeing the content it opened.
use derivative::Derivative;
use filetime::FileTime;
use std::fs::File;
use std::fs::Metadata;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Result;
use std::io::Seek;
use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;

use crate::benign_error::is_absent_file_error;
#[cfg(any(target_os = "linux", target_os = "android"))]
use crate::benign_error::is_transient_error;
use crate::Sink;
use crate::SlotKey;
use crate::Ttl;
use crate::READ_AHEAD_SIZE;

/// What we remember about a slot file when we open it: enough to tell
/// whether the path has been replaced since.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Snapshot {
    dev: u64,
    ino: u64,
    mtime: FileTime,
    size: u64,
}

impl Snapshot {
    pub fn of(meta: &Metadata) -> Snapshot {
        Snapshot {
            dev: meta.dev(),
            ino: meta.ino(),
            mtime: FileTime::from_last_modification_time(meta),
            size: meta.len(),
        }
    }

    pub fn mtime(&self) -> FileTime {
        self.mtime
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn same_file(&self, meta: &Metadata) -> bool {
        self.dev == meta.dev() && self.ino == meta.ino()
    }
}

/// An open slot file.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Slot {
    path: PathBuf,
    // `None` once closed.
    file: Option<File>,
    snapshot: Snapshot,
    // Offset of the header's NUL terminator, if we found one in the
    // read-ahead.
    key_len: Option<usize>,
    matched: bool,
    #[derivative(Debug = "ignore")]
    head: Vec<u8>,
}

/// Reads from `file` until `buf` is full or we hit EOF.  Returns the
/// number of bytes read.
fn read_head(file: &mut File, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match file.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

impl Slot {
    /// Opens the slot file at `path` and reads its header.
    ///
    /// Returns `Ok(None)` if there is no such slot file.  When `key`
    /// is provided, [`Slot::matches`] reports whether the slot was
    /// generated for that exact key; a slot without a NUL terminator
    /// in its read-ahead never matches.
    pub fn open(path: impl AsRef<Path>, key: Option<&SlotKey>) -> Result<Option<Slot>> {
        fn run(path: &Path, key: Option<&SlotKey>) -> Result<Option<Slot>> {
            let mut file = match File::open(path) {
                Ok(file) => file,
                Err(e) if is_absent_file_error(&e) => return Ok(None),
                Err(e) => return Err(e),
            };

            let snapshot = Snapshot::of(&file.metadata()?);
            let mut head = vec![0u8; READ_AHEAD_SIZE];
            let len = read_head(&mut file, &mut head)?;
            head.truncate(len);

            let key_len = head.iter().position(|&b| b == 0);
            let matched = match (key, key_len) {
                (Some(key), Some(key_len)) => &head[..key_len] == key.as_bytes(),
                _ => false,
            };

            Ok(Some(Slot {
                path: path.to_owned(),
                file: Some(file),
                snapshot,
                key_len,
                matched,
                head,
            }))
        }

        run(path.as_ref(), key)
    }

    /// Wraps a file that was just published at `path` with a header
    /// for a `key_len`-byte key.
    pub(crate) fn published(
        path: PathBuf,
        file: File,
        snapshot: Snapshot,
        key_len: usize,
    ) -> Slot {
        Slot {
            path,
            file: Some(file),
            snapshot,
            key_len: Some(key_len),
            matched: true,
            head: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    /// Returns whether the slot's stored key is the key we opened it
    /// with.
    pub fn matches(&self) -> bool {
        self.matched
    }

    /// Returns the key stored in the slot header, if the header is
    /// well formed.
    pub fn stored_key(&self) -> Option<&[u8]> {
        self.key_len.map(|len| &self.head[..len])
    }

    /// Returns the bytes read ahead when the slot was opened: the
    /// stored key, its NUL terminator, and the start of the payload.
    pub fn head(&self) -> &[u8] {
        &self.head
    }

    /// Returns whether the slot's content is older than `ttl`.
    pub fn is_expired(&self, ttl: Ttl) -> bool {
        ttl.is_expired(self.snapshot.mtime)
    }

    /// Returns whether the slot path now names a different file, or
    /// a file with a different mtime or size, than when we opened it.
    ///
    /// A failed `stat` (including a missing file) counts as modified.
    pub fn is_modified(&self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                !self.snapshot.same_file(&meta)
                    || FileTime::from_last_modification_time(&meta) != self.snapshot.mtime
                    || meta.len() != self.snapshot.size
            }
            Err(_) => true,
        }
    }

    /// Writes the slot's payload (everything after the key header) to
    /// `out`.
    pub fn print<O: Sink + ?Sized>(&mut self, out: &mut O) -> Result<()> {
        let key_len = match self.key_len {
            Some(len) => len,
            None => {
                return Err(std::io::Error::new(
                    ErrorKind::InvalidData,
                    "slot has no key header",
                ))
            }
        };
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => {
                return Err(std::io::Error::new(
                    ErrorKind::Other,
                    "slot is already closed",
                ))
            }
        };

        // We write to the raw descriptor below: anything buffered in
        // `out` must go first.
        out.flush()?;

        #[allow(unused_mut)]
        let mut offset = key_len as u64 + 1;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            match send_file(file, out.as_raw_fd(), offset, self.snapshot.size)? {
                Transfer::Done => return Ok(()),
                Transfer::Fallback(resume) => offset = resume,
            }
        }

        file.seek(SeekFrom::Start(offset))?;
        std::io::copy(file, out)?;
        out.flush()
    }

    /// Releases the slot's file descriptor.  Closing twice is a no-op.
    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
enum Transfer {
    Done,
    // `sendfile` can't handle this pair of descriptors; continue with
    // plain reads and writes from this offset.
    Fallback(u64),
}

/// Copies `[offset, end)` from `src` to `out_fd` with `sendfile`.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn send_file(
    src: &File,
    out_fd: std::os::unix::io::RawFd,
    offset: u64,
    end: u64,
) -> Result<Transfer> {
    let mut off = offset as libc::off_t;
    let end = end as libc::off_t;

    while off < end {
        let count = (end - off) as usize;
        // SAFETY: both descriptors are open for the duration of the
        // call, and `off` is a valid `off_t` that `sendfile` updates.
        let ret = unsafe { libc::sendfile(out_fd, src.as_raw_fd(), &mut off, count) };
        if ret < 0 {
            let error = std::io::Error::last_os_error();
            if is_transient_error(&error) {
                continue;
            }

            return match error.raw_os_error() {
                Some(libc::EINVAL) | Some(libc::ENOSYS) => Ok(Transfer::Fallback(off as u64)),
                _ => Err(error),
            };
        }

        if ret == 0 {
            // The file is shorter than it was at open time; finish
            // with whatever a regular read finds.
            return Ok(Transfer::Fallback(off as u64));
        }
    }

    Ok(Transfer::Done)
}

#[cfg(test)]
fn write_slot(path: &Path, key: &[u8], payload: &[u8]) {
    let mut contents = key.to_vec();
    contents.push(0);
    contents.extend_from_slice(payload);
    std::fs::write(path, contents).expect("write must succeed");
}

#[cfg(test)]
fn print_to_vec(slot: &mut Slot, scratch: &Path) -> Vec<u8> {
    let mut out = File::create(scratch).expect("create must succeed");
    slot.print(&mut out).expect("print must succeed");
    std::fs::read(scratch).expect("read must succeed")
}

/// Opening a missing slot is a miss, not an error.
#[test]
fn test_open_missing() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let key = SlotKey::new(b"p=log").expect("valid key");

    assert!(Slot::open(temp.path("00000000"), Some(&key))
        .expect("open must succeed")
        .is_none());
}

#[test]
fn test_open_match() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    write_slot(&path, b"p=log", b"<html>log</html>");

    let key = SlotKey::new(b"p=log").expect("valid key");
    let slot = Slot::open(&path, Some(&key))
        .expect("open must succeed")
        .expect("slot must exist");

    assert!(slot.matches());
    assert_eq!(slot.stored_key(), Some(&b"p=log"[..]));
    assert_eq!(slot.head(), b"p=log\0<html>log</html>");
    assert_eq!(slot.snapshot().size(), 22);
}

/// A different key, or a prefix of the stored key, is a mismatch.
#[test]
fn test_open_mismatch() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    write_slot(&path, b"p=log", b"payload");

    let others: [&[u8]; 4] = [b"p=tree", b"p=lo", b"p=log2", b""];
    for other in others.iter() {
        let key = SlotKey::new(other).expect("valid key");
        let slot = Slot::open(&path, Some(&key))
            .expect("open must succeed")
            .expect("slot must exist");
        assert!(!slot.matches());
    }

    // Without a key, nothing matches.
    let slot = Slot::open(&path, None)
        .expect("open must succeed")
        .expect("slot must exist");
    assert!(!slot.matches());
    assert_eq!(slot.stored_key(), Some(&b"p=log"[..]));
}

/// A slot without a NUL in its read-ahead is corrupt, and never
/// matches.
#[test]
fn test_open_corrupt() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    std::fs::write(&path, vec![b'x'; 2 * READ_AHEAD_SIZE]).expect("write must succeed");

    let key = SlotKey::new(b"xxxx").expect("valid key");
    let mut slot = Slot::open(&path, Some(&key))
        .expect("open must succeed")
        .expect("slot must exist");

    assert!(!slot.matches());
    assert_eq!(slot.stored_key(), None);
    assert_eq!(slot.head().len(), READ_AHEAD_SIZE);

    let mut out = File::create(temp.path("out")).expect("create must succeed");
    assert!(slot.print(&mut out).is_err());
}

/// Printing skips the header, and printing twice yields the same
/// bytes, even for payloads much larger than the read-ahead.
#[test]
fn test_print_idempotent() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    write_slot(&path, b"p=tree", &payload);

    let key = SlotKey::new(b"p=tree").expect("valid key");
    let mut slot = Slot::open(&path, Some(&key))
        .expect("open must succeed")
        .expect("slot must exist");

    assert_eq!(print_to_vec(&mut slot, &temp.path("out1")), payload);
    assert_eq!(print_to_vec(&mut slot, &temp.path("out2")), payload);
}

/// An empty payload prints nothing.
#[test]
fn test_print_empty() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    write_slot(&path, b"", b"");

    let key = SlotKey::new(b"").expect("valid key");
    let mut slot = Slot::open(&path, Some(&key))
        .expect("open must succeed")
        .expect("slot must exist");

    assert!(slot.matches());
    assert_eq!(print_to_vec(&mut slot, &temp.path("out")), b"");
}

#[test]
fn test_close_idempotent() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    write_slot(&path, b"k", b"v");

    let mut slot = Slot::open(&path, None)
        .expect("open must succeed")
        .expect("slot must exist");
    assert!(!slot.is_closed());
    slot.close();
    assert!(slot.is_closed());
    slot.close();
    assert!(slot.is_closed());

    let mut out = File::create(temp.path("out")).expect("create must succeed");
    assert!(slot.print(&mut out).is_err());
}

/// Replacing, rewriting, or deleting the slot path all count as
/// modifications.
#[test]
fn test_is_modified() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    write_slot(&path, b"k", b"v1");

    let open = || {
        Slot::open(&path, None)
            .expect("open must succeed")
            .expect("slot must exist")
    };

    let slot = open();
    assert!(!slot.is_modified());

    // Atomic replacement with a new inode.
    let replacement = temp.path("replacement");
    write_slot(&replacement, b"k", b"v2");
    std::fs::rename(&replacement, &path).expect("rename must succeed");
    assert!(slot.is_modified());

    let slot = open();
    assert!(!slot.is_modified());
    std::fs::remove_file(&path).expect("remove must succeed");
    assert!(slot.is_modified());
}

/// Expiry follows the slot's mtime.
#[test]
fn test_is_expired() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    write_slot(&path, b"k", b"v");

    let fresh = Slot::open(&path, None)
        .expect("open must succeed")
        .expect("slot must exist");
    assert!(!fresh.is_expired(Ttl::Minutes(5)));

    let old = FileTime::from_unix_time(FileTime::now().unix_seconds() - 5 * 60 - 10, 0);
    filetime::set_file_mtime(&path, old).expect("set mtime must succeed");
    let stale = Slot::open(&path, None)
        .expect("open must succeed")
        .expect("slot must exist");
    assert!(stale.is_expired(Ttl::Minutes(5)));
    assert!(!stale.is_expired(Ttl::Forever));
}

/// An open slot keeps serving its content after the path is replaced.
#[test]
fn test_no_torn_read() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("00000000");
    let original = vec![b'a'; 3 * READ_AHEAD_SIZE];
    write_slot(&path, b"k", &original);

    let key = SlotKey::new(b"k").expect("valid key");
    let mut slot = Slot::open(&path, Some(&key))
        .expect("open must succeed")
        .expect("slot must exist");

    let replacement = temp.path("00000000.lock");
    write_slot(&replacement, b"k", &vec![b'b'; 5 * READ_AHEAD_SIZE]);
    std::fs::rename(&replacement, &path).expect("rename must succeed");

    assert_eq!(print_to_vec(&mut slot, &temp.path("out")), original);
}
