//! Time-to-live policy for cache slots.  TTLs are configured in
//! minutes, with the historical conventions: a negative TTL caches
//! forever (until something external prunes the slot), and zero
//! disables caching for the request.
use filetime::FileTime;
use std::time::SystemTime;

/// How long a slot's content may be served before regeneration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ttl {
    /// Never cache; always run the generator.
    Disabled,
    /// Cache for this many minutes after the slot was written.
    Minutes(u32),
    /// Cache until the slot is pruned externally.
    Forever,
}

impl From<i64> for Ttl {
    fn from(minutes: i64) -> Ttl {
        if minutes < 0 {
            Ttl::Forever
        } else if minutes == 0 {
            Ttl::Disabled
        } else {
            Ttl::Minutes(minutes.min(u32::MAX as i64) as u32)
        }
    }
}

impl Ttl {
    /// Returns whether this TTL allows caching at all.
    pub fn is_enabled(self) -> bool {
        self != Ttl::Disabled
    }

    /// Returns the TTL in seconds, or `None` for `Forever`.
    pub fn as_secs(self) -> Option<i64> {
        match self {
            Ttl::Disabled => Some(0),
            Ttl::Minutes(minutes) => Some(minutes as i64 * 60),
            Ttl::Forever => None,
        }
    }

    /// Returns whether content last written at `mtime` has expired at
    /// `now`: expired iff `mtime + ttl < now`, at one second
    /// granularity.
    pub fn is_expired_at(self, mtime: FileTime, now: FileTime) -> bool {
        match self.as_secs() {
            Some(secs) => mtime.unix_seconds().saturating_add(secs) < now.unix_seconds(),
            None => false,
        }
    }

    /// Returns whether content last written at `mtime` has expired.
    pub fn is_expired(self, mtime: FileTime) -> bool {
        self.is_expired_at(mtime, FileTime::from_system_time(SystemTime::now()))
    }
}

#[test]
fn test_from_minutes() {
    assert_eq!(Ttl::from(-1), Ttl::Forever);
    assert_eq!(Ttl::from(-100), Ttl::Forever);
    assert_eq!(Ttl::from(0), Ttl::Disabled);
    assert_eq!(Ttl::from(5), Ttl::Minutes(5));
    assert!(!Ttl::from(0).is_enabled());
    assert!(Ttl::from(-1).is_enabled());
}

/// One second past the TTL is expired; one second before is not.
#[test]
fn test_boundary() {
    let now = FileTime::from_unix_time(1_700_000_000, 0);
    let ttl = Ttl::Minutes(5);

    let old = FileTime::from_unix_time(now.unix_seconds() - 5 * 60 - 1, 0);
    let young = FileTime::from_unix_time(now.unix_seconds() - 5 * 60 + 1, 0);
    let exact = FileTime::from_unix_time(now.unix_seconds() - 5 * 60, 0);

    assert!(ttl.is_expired_at(old, now));
    assert!(!ttl.is_expired_at(young, now));
    // `mtime + ttl < now` is strict.
    assert!(!ttl.is_expired_at(exact, now));
}

#[test]
fn test_forever() {
    let now = FileTime::from_unix_time(1_700_000_000, 0);

    assert!(!Ttl::Forever.is_expired_at(FileTime::zero(), now));
    assert!(!Ttl::from(-1).is_expired(FileTime::zero()));
}
