//! Slot addressing maps an arbitrary cache key to one of a bounded
//! number of slot files under the cache root.  The hash is a 32-bit
//! [FNV-1](http://www.isthe.com/chongo/tech/comp/fnv/) (multiply,
//! then xor), reduced modulo the table size.  Distinct keys may alias
//! to the same slot: slot files record their full key, and the most
//! recent writer wins.
use std::ffi::OsStr;
use std::path::Path;
use std::path::PathBuf;

const FNV_OFFSET: u32 = 0x811c9dc5;
const FNV_PRIME: u32 = 0x01000193;

/// Number of hex digits in a slot file name.
pub const SLOT_NAME_LEN: usize = 8;

/// Lock files live next to their slot, with this suffix.
pub const LOCK_SUFFIX: &str = ".lock";

/// Returns the 32-bit FNV-1 hash of `key`.  The empty key hashes to
/// the offset basis.
#[inline]
pub fn hash_key(key: &[u8]) -> u32 {
    key.iter().fold(FNV_OFFSET, |h, &byte| {
        h.wrapping_mul(FNV_PRIME) ^ (byte as u32)
    })
}

/// Returns the slot index for `key` in a table of `table_size`
/// slots, a value in `[0, table_size)`.
///
/// As a special case, returns 0 when `table_size == 0`; callers
/// disable caching before addressing in that case.
#[inline]
pub fn slot_index(key: &[u8], table_size: usize) -> usize {
    if table_size == 0 {
        return 0;
    }

    (hash_key(key) as u64 % table_size as u64) as usize
}

/// Renders `index` as a slot file name: eight lowercase hex digits,
/// least significant nibble first.
pub fn slot_name(index: usize) -> String {
    let mut bits = index as u64;
    let mut name = String::with_capacity(SLOT_NAME_LEN);

    for _ in 0..SLOT_NAME_LEN {
        name.push(std::char::from_digit((bits & 0xf) as u32, 16).unwrap_or('0'));
        bits >>= 4;
    }

    name
}

/// Returns whether `name` looks like a slot file name.
pub fn is_slot_name(name: &OsStr) -> bool {
    match name.to_str() {
        Some(name) => {
            name.len() == SLOT_NAME_LEN
                && name
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}

/// Returns whether `name` looks like a slot's lock file name.
pub fn is_lock_name(name: &OsStr) -> bool {
    match name.to_str() {
        Some(name) => match name.strip_suffix(LOCK_SUFFIX) {
            Some(stem) => is_slot_name(OsStr::new(stem)),
            None => false,
        },
        None => false,
    }
}

/// The pair of paths that back a single slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotPaths {
    /// The published slot file.
    pub slot: PathBuf,
    /// The lock file a regenerator writes to before publication.
    pub lock: PathBuf,
}

impl SlotPaths {
    /// Returns the slot and lock paths for `key` under `cache_root`.
    pub fn new(cache_root: &Path, key: &[u8], table_size: usize) -> SlotPaths {
        SlotPaths::for_slot(cache_root.join(slot_name(slot_index(key, table_size))))
    }

    /// Returns the paths for an existing slot file path.
    pub fn for_slot(slot: PathBuf) -> SlotPaths {
        let mut lock = slot.clone().into_os_string();
        lock.push(LOCK_SUFFIX);

        SlotPaths {
            slot,
            lock: PathBuf::from(lock),
        }
    }
}

/// Known answers for the hash, computed by hand from the definition.
#[test]
fn test_hash_known_values() {
    assert_eq!(hash_key(b""), FNV_OFFSET);
    // One round: (offset * prime) ^ byte.
    assert_eq!(
        hash_key(b"a"),
        FNV_OFFSET.wrapping_mul(FNV_PRIME) ^ (b'a' as u32)
    );
    assert_eq!(hash_key(b"a"), 0x050c5d7e);
    assert_ne!(hash_key(b"p=log"), hash_key(b"p=tree"));
}

/// The empty key lands on `offset_basis % size`.
#[test]
fn test_empty_key_index() {
    assert_eq!(slot_index(b"", 64), (FNV_OFFSET % 64) as usize);
    assert_eq!(slot_index(b"anything", 1), 0);
    assert_eq!(slot_index(b"anything", 0), 0);
}

#[test]
fn test_slot_name() {
    assert_eq!(slot_name(0), "00000000");
    // Least significant nibble first.
    assert_eq!(slot_name(0x1), "10000000");
    assert_eq!(slot_name(0xab), "ba000000");
    assert_eq!(slot_name(0x12345678), "87654321");
}

#[test]
fn test_name_predicates() {
    assert!(is_slot_name(OsStr::new("0a1b2c3d")));
    assert!(!is_slot_name(OsStr::new("0a1b2c3")));
    assert!(!is_slot_name(OsStr::new("0A1B2C3D")));
    assert!(!is_slot_name(OsStr::new("notaslot")));
    assert!(!is_slot_name(OsStr::new("0a1b2c3d.lock")));

    assert!(is_lock_name(OsStr::new("0a1b2c3d.lock")));
    assert!(!is_lock_name(OsStr::new("0a1b2c3d")));
    assert!(!is_lock_name(OsStr::new("garbage.lock")));
}

#[test]
fn test_slot_paths() {
    let paths = SlotPaths::new(Path::new("/var/cache/cgit"), b"p=log", 64);

    assert_eq!(paths.slot.parent(), Some(Path::new("/var/cache/cgit")));
    assert_eq!(
        paths.lock,
        PathBuf::from(format!("{}.lock", paths.slot.display()))
    );
    assert!(is_slot_name(paths.slot.file_name().unwrap()));
    assert!(is_lock_name(paths.lock.file_name().unwrap()));
}

#[cfg(test)]
mod test {
    use crate::fingerprint::*;
    use proptest::collection::vec;
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;

    /// A cache key and a table size for that key.
    #[derive(Arbitrary, Clone, Debug)]
    struct Addressed {
        key: Vec<u8>,
        #[proptest(strategy = "1..100_000usize")]
        table_size: usize,
    }

    proptest! {
        /// Indices always fall in the table, and map to well-formed
        /// slot names.
        #[test]
        fn test_index_in_range(input in any::<Addressed>()) {
            let index = slot_index(&input.key, input.table_size);

            prop_assert!(index < input.table_size);
            let name = slot_name(index);
            prop_assert!(is_slot_name(OsStr::new(&name)));
        }

        /// Addressing is a pure function of the key and table size.
        #[test]
        fn test_deterministic(key in vec(any::<u8>(), 0..64usize),
                              table_size in 1..4096usize) {
            let root = Path::new("/cache");
            prop_assert_eq!(SlotPaths::new(root, &key, table_size),
                            SlotPaths::new(root, &key, table_size));
        }

        /// Distinct indices render to distinct names.
        #[test]
        fn test_names_injective(x in 0..(u32::MAX as usize), y in 0..(u32::MAX as usize)) {
            prop_assert_eq!(x == y, slot_name(x) == slot_name(y));
        }
    }
}
