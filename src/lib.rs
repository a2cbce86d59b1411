//! Slot-cache memoizes the output of expensive, dynamically rendered
//! CGI responses in a directory of slot files, with TTL-based expiry,
//! stale-while-regenerating semantics, and at most one regenerator
//! per slot across concurrent processes.[^one-process-per-request]
//!
//! [^one-process-per-request]: Each request is usually handled by a
//! fresh OS process, launched by the web server's CGI gateway.  There
//! is no shared memory between these processes, so all coordination
//! goes through the filesystem: file existence, advisory locks, and
//! atomic renames.  Reads never take a lock, and lock acquisition
//! never blocks: a contended regeneration degrades to serving stale
//! content, or to rendering without the cache.
//!
//! # Slots
//!
//! A cache key (usually the request's normalised query string) is
//! hashed with 32-bit FNV-1 and reduced modulo the table size; the
//! result names one of at most `table_size` slot files under the cache
//! root, as eight lowercase hex digits.  Distinct keys may alias to
//! the same slot, so each slot file starts with the full key it was
//! generated for, followed by a NUL byte, followed by the payload:
//!
//! ```text
//! p=log\0<html>...
//! ```
//!
//! A slot whose stored key does not match the request's key is a
//! miss, and will be overwritten by the next regeneration.  The cache
//! never serves content for the wrong key.
//!
//! # Regeneration
//!
//! A regenerator opens `<slot>.lock`, takes a non-blocking exclusive
//! `flock` on it, writes the key header, and runs the content
//! generator with its output directed into the lock file.  On
//! success, the lock file is renamed over the slot: that rename is
//! the only moment new content becomes visible.  Readers that opened
//! the previous slot file keep reading the previous content through
//! their open descriptor, so nobody ever observes a torn slot.
//!
//! Every failure along the way (open, lock, fill, rename) is logged
//! to the diagnostic stream as `[cache] <message>: <strerror> (<errno>)`
//! and degrades to serving stale content or rendering without the
//! cache.  The request is only reported as failed when the response
//! bytes themselves can't be written.
//!
//! Lock files left behind by killed regenerators are harmless: the
//! kernel drops their `flock`, and the next regenerator truncates and
//! reuses the file.  They are also swept opportunistically once they
//! are old enough; see [`maintenance`].
//!
//! # Sample usage
//!
//! ```no_run
//! use std::io::Write;
//!
//! # fn main() -> std::io::Result<()> {
//! let cache = slot_cache::SlotCache::new("/var/cache/cgit", 1000);
//!
//! let mut render = |out: &mut dyn slot_cache::Sink| -> std::io::Result<()> {
//!     out.write_all(b"Content-Type: text/html\n\n<html>...</html>\n")
//! };
//!
//! // Serves the cached page for `p=log` if it's younger than five
//! // minutes, and regenerates (and caches) it otherwise.
//! cache.process(b"p=log", slot_cache::Ttl::Minutes(5), &mut std::io::stdout(), &mut render)?;
//! # Ok(())
//! # }
//! ```
pub mod benign_error;
pub mod config;
pub mod fingerprint;
pub mod generator;
pub mod listing;
pub mod lock;
pub mod maintenance;
mod process;
pub mod request;
pub mod slot;
mod ttl;

pub use generator::Generator;
pub use generator::Sink;
pub use generator::StdoutGenerator;
pub use listing::list;
pub use process::cache_process;
pub use process::SlotCache;
pub use ttl::Ttl;

/// Slot files are read with a read-ahead buffer of this many bytes;
/// the stored key must be found within that first chunk.
pub const READ_AHEAD_SIZE: usize = 4096;

/// Keys are at most this many bytes long, so that a key and its NUL
/// terminator always fit in the read-ahead buffer.
pub const MAX_KEY_LEN: usize = READ_AHEAD_SIZE - 1;

/// Cache keys that can't be stored in a slot header.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    /// The key is longer than [`MAX_KEY_LEN`].
    #[error("cache key is {0} bytes long, the limit is {}", MAX_KEY_LEN)]
    TooLong(usize),
    /// The key contains a NUL byte, which terminates the slot header.
    #[error("cache key contains a NUL byte at offset {0}")]
    ContainsNul(usize),
}

/// A validated cache key: at most [`MAX_KEY_LEN`] bytes, and no NUL.
///
/// Keys are compared byte for byte; callers are responsible for any
/// normalisation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotKey<'a> {
    bytes: &'a [u8],
}

impl<'a> SlotKey<'a> {
    /// Validates `bytes` as a cache key.
    pub fn new(bytes: &'a [u8]) -> Result<SlotKey<'a>, KeyError> {
        if bytes.len() > MAX_KEY_LEN {
            return Err(KeyError::TooLong(bytes.len()));
        }

        if let Some(offset) = bytes.iter().position(|&b| b == 0) {
            return Err(KeyError::ContainsNul(offset));
        }

        Ok(SlotKey { bytes })
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Returns the slot header for this key: the key followed by NUL.
    pub fn header(&self) -> Vec<u8> {
        let mut header = Vec::with_capacity(self.bytes.len() + 1);
        header.extend_from_slice(self.bytes);
        header.push(0);
        header
    }
}

#[test]
fn test_key_validation() {
    assert!(SlotKey::new(b"").is_ok());
    assert!(SlotKey::new(b"p=log&h=master").is_ok());
    assert!(SlotKey::new(&vec![b'x'; MAX_KEY_LEN]).is_ok());

    assert_eq!(
        SlotKey::new(&vec![b'x'; MAX_KEY_LEN + 1]),
        Err(KeyError::TooLong(MAX_KEY_LEN + 1))
    );
    assert_eq!(SlotKey::new(b"p=\0log"), Err(KeyError::ContainsNul(2)));
}

#[test]
fn test_key_header() {
    let key = SlotKey::new(b"p=log").expect("valid key");
    assert_eq!(key.header(), b"p=log\0".to_vec());
    assert_eq!(SlotKey::new(b"").expect("valid").header(), vec![0]);
}
