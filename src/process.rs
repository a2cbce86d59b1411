//! The orchestrator ties slot addressing, slot I/O, locking, and
//! expiry together for a single request.  Cache failures never fail a
//! request: every coordination or filesystem problem degrades to
//! serving stale content, or to running the generator without the
//! cache.  Only failures to write the response itself are returned.
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use crate::benign_error::log_os_error;
use crate::fingerprint::SlotPaths;
use crate::lock::SlotLock;
use crate::maintenance::sweep_orphan_locks;
use crate::maintenance::SweepTrigger;
use crate::slot::Slot;
use crate::Generator;
use crate::Sink;
use crate::SlotKey;
use crate::Ttl;

/// Lock files older than this, and unlocked, are orphans.
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Sweep orphaned lock files roughly once every this many fills.
pub const DEFAULT_SWEEP_PERIOD: u64 = 64;

/// A `SlotCache` is a directory of at most `table_size` slot files.
#[derive(Clone, Debug)]
pub struct SlotCache {
    // `None` disables caching, like a zero table size.
    cache_root: Option<PathBuf>,
    table_size: usize,
    lock_stale_after: Duration,
    sweep_trigger: SweepTrigger,
}

impl SlotCache {
    /// Returns a cache of `table_size` slots in `cache_root`.  A zero
    /// `table_size` disables caching.
    pub fn new(cache_root: impl AsRef<Path>, table_size: usize) -> SlotCache {
        SlotCache {
            cache_root: Some(cache_root.as_ref().to_owned()),
            table_size,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
            sweep_trigger: SweepTrigger::new(DEFAULT_SWEEP_PERIOD),
        }
    }

    /// Returns a cache that always runs the generator directly.
    pub fn disabled() -> SlotCache {
        SlotCache {
            cache_root: None,
            table_size: 0,
            lock_stale_after: DEFAULT_LOCK_STALE_AFTER,
            sweep_trigger: SweepTrigger::never(),
        }
    }

    /// Sets the age after which unlocked lock files are swept, and
    /// the approximate number of fills between sweeps (0 for never).
    pub fn with_sweeps(mut self, lock_stale_after: Duration, period: u64) -> SlotCache {
        self.lock_stale_after = lock_stale_after;
        self.sweep_trigger = SweepTrigger::new(period);
        self
    }

    pub fn cache_root(&self) -> Option<&Path> {
        self.cache_root.as_deref()
    }

    pub fn table_size(&self) -> usize {
        self.table_size
    }

    /// Writes the response for `key` to `out`, from the cache if
    /// possible, and by running `generator` otherwise.
    ///
    /// A disabled cache (no root, zero table size) or a disabled `ttl`
    /// runs the generator directly, without touching the filesystem.
    /// Keys that can't be stored in a slot are logged and rendered
    /// without the cache.
    ///
    /// # Errors
    ///
    /// Returns `Err` only when the response couldn't be delivered to
    /// `out`, or when an uncached generator run fails.
    pub fn process<O, G>(
        &self,
        key: &[u8],
        ttl: Ttl,
        out: &mut O,
        generator: &mut G,
    ) -> std::io::Result<()>
    where
        O: Sink,
        G: Generator + ?Sized,
    {
        if self.table_size == 0 || !ttl.is_enabled() {
            return generator.generate(out);
        }

        let cache_root = match &self.cache_root {
            Some(root) => root,
            None => {
                tracing::warn!("[cache] Cache path not specified, caching is disabled");
                return generator.generate(out);
            }
        };

        let key = match SlotKey::new(key) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!("[cache] {}, caching is disabled for this request", e);
                return generator.generate(out);
            }
        };

        let paths = SlotPaths::new(cache_root, key.as_bytes(), self.table_size);
        let opened = match Slot::open(&paths.slot, Some(&key)) {
            Ok(opened) => opened,
            Err(e) => {
                log_os_error(
                    &format!("Unable to open slot {}", paths.slot.display()),
                    &e,
                );
                None
            }
        };

        match opened {
            Some(slot) if slot.matches() => self.serve_hit(slot, &paths, &key, ttl, out, generator),
            stale => {
                if stale.is_some() {
                    tracing::debug!(
                        "[cache] key mismatch in slot {}, regenerating",
                        paths.slot.display()
                    );
                }

                drop(stale);
                self.serve_miss(&paths, &key, out, generator)
            }
        }
    }

    /// Serves a slot that matches the request's key, after attempting
    /// to regenerate it if it has expired.
    fn serve_hit<O, G>(
        &self,
        slot: Slot,
        paths: &SlotPaths,
        key: &SlotKey,
        ttl: Ttl,
        out: &mut O,
        generator: &mut G,
    ) -> std::io::Result<()>
    where
        O: Sink,
        G: Generator + ?Sized,
    {
        let mut active = slot;

        if active.is_expired(ttl) {
            match SlotLock::try_acquire(paths, key) {
                Ok(Some(lock)) => {
                    if let Some(fresh) = self.regenerate(&active, lock, generator) {
                        active.close();
                        active = fresh;
                    }
                }
                Ok(None) => tracing::debug!(
                    "[cache] slot {} is being regenerated elsewhere, serving stale content",
                    paths.slot.display()
                ),
                Err(e) => log_os_error(
                    &format!("Unable to lock slot {}", paths.lock.display()),
                    &e,
                ),
            }
        }

        self.print_and_close(active, out)
    }

    /// Refills an expired slot under `lock`.  Returns the published
    /// slot, or `None` if the caller should keep serving `stale`.
    fn regenerate<G>(&self, stale: &Slot, mut lock: SlotLock, generator: &mut G) -> Option<Slot>
    where
        G: Generator + ?Sized,
    {
        let lock_path = lock.paths().lock.clone();

        // Someone may have replaced the slot between our open and our
        // lock.  Don't overwrite their work; our open slot is still
        // good enough for this request.
        if stale.is_modified() {
            tracing::debug!(
                "[cache] slot {} changed since it was opened, serving stale content",
                stale.path().display()
            );
            discard(lock);
            return None;
        }

        if let Err(e) = lock.fill(generator) {
            log_os_error(
                &format!("Unable to fill slot {}", lock_path.display()),
                &e,
            );
            discard(lock);
            return None;
        }

        match lock.publish() {
            Ok(fresh) => {
                self.maybe_sweep();
                Some(fresh)
            }
            Err(e) => {
                log_os_error(
                    &format!("Unable to publish slot {}", lock_path.display()),
                    &e,
                );
                None
            }
        }
    }

    /// Fills a missing (or mismatched) slot and serves it, or renders
    /// without the cache if that's not possible.
    fn serve_miss<O, G>(
        &self,
        paths: &SlotPaths,
        key: &SlotKey,
        out: &mut O,
        generator: &mut G,
    ) -> std::io::Result<()>
    where
        O: Sink,
        G: Generator + ?Sized,
    {
        let mut lock = match SlotLock::try_acquire(paths, key) {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                tracing::debug!(
                    "[cache] slot {} is being regenerated elsewhere, rendering without cache",
                    paths.slot.display()
                );
                return generator.generate(out);
            }
            Err(e) => {
                log_os_error(
                    &format!("Unable to lock slot {}", paths.lock.display()),
                    &e,
                );
                return generator.generate(out);
            }
        };

        if let Err(e) = lock.fill(generator) {
            log_os_error(
                &format!("Unable to fill slot {}", paths.lock.display()),
                &e,
            );
            discard(lock);
            return generator.generate(out);
        }

        // Serve from the lock file's descriptor rather than reopening
        // the slot path: a concurrent writer for another key could
        // replace the slot in between.
        match lock.publish() {
            Ok(slot) => {
                self.maybe_sweep();
                self.print_and_close(slot, out)
            }
            Err(e) => {
                log_os_error(
                    &format!("Unable to publish slot {}", paths.lock.display()),
                    &e,
                );
                generator.generate(out)
            }
        }
    }

    fn print_and_close<O: Sink>(&self, mut slot: Slot, out: &mut O) -> std::io::Result<()> {
        let ret = slot.print(out);
        if let Err(e) = &ret {
            log_os_error(
                &format!("error printing cache {}", slot.path().display()),
                e,
            );
        }

        slot.close();
        ret
    }

    fn maybe_sweep(&self) {
        if !self.sweep_trigger.event() {
            return;
        }

        if let Some(root) = &self.cache_root {
            if let Err(e) = sweep_orphan_locks(root, self.lock_stale_after) {
                log_os_error(
                    &format!("Unable to sweep lock files in {}", root.display()),
                    &e,
                );
            }
        }
    }
}

fn discard(lock: SlotLock) {
    let path = lock.paths().lock.clone();

    if let Err(e) = lock.discard() {
        log_os_error(&format!("Unable to remove lock {}", path.display()), &e);
    }
}

/// Writes the response for `key` to `out`: serves the slot for `key`
/// among `table_size` slots under `cache_root` if it is fresh, and
/// runs `generator` (caching its output when possible) otherwise.
///
/// This is [`SlotCache::process`] with default sweep settings.
pub fn cache_process<O, G>(
    table_size: usize,
    cache_root: Option<&Path>,
    key: &[u8],
    ttl: Ttl,
    out: &mut O,
    generator: &mut G,
) -> std::io::Result<()>
where
    O: Sink,
    G: Generator + ?Sized,
{
    let cache = match cache_root {
        Some(root) => SlotCache::new(root, table_size),
        None => SlotCache::disabled(),
    };

    cache.process(key, ttl, out, generator)
}

#[cfg(test)]
mod test {
    use crate::fingerprint::SlotPaths;
    use crate::lock::SlotLock;
    use crate::process::*;
    use crate::Generator;
    use crate::Sink;
    use crate::SlotKey;
    use crate::Ttl;
    use filetime::FileTime;
    use std::fs::File;
    use std::path::Path;
    use test_dir::{DirBuilder, TestDir};

    /// Counts generator invocations, and renders `<key>#<count>`.
    struct Counter {
        body: &'static str,
        calls: usize,
    }

    impl Counter {
        fn new(body: &'static str) -> Counter {
            Counter { body, calls: 0 }
        }
    }

    impl Generator for Counter {
        fn generate(&mut self, out: &mut dyn Sink) -> std::io::Result<()> {
            self.calls += 1;
            write!(out, "{}#{}", self.body, self.calls)?;
            out.flush()
        }
    }

    /// A generator that always fails after writing some garbage.
    struct Failing(usize);

    impl Generator for Failing {
        fn generate(&mut self, out: &mut dyn Sink) -> std::io::Result<()> {
            self.0 += 1;
            out.write_all(b"garbage")?;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "render failed"))
        }
    }

    fn run(
        cache: &SlotCache,
        temp: &TestDir,
        key: &[u8],
        ttl: Ttl,
        generator: &mut dyn Generator,
    ) -> Vec<u8> {
        let out_path = temp.path("response.out");
        let mut out = File::create(&out_path).expect("create must succeed");
        cache
            .process(key, ttl, &mut out, generator)
            .expect("process must succeed");
        std::fs::read(&out_path).expect("read must succeed")
    }

    fn cache_dir(temp: &TestDir) -> std::path::PathBuf {
        let dir = temp.path("cache");
        std::fs::create_dir_all(&dir).expect("mkdir must succeed");
        dir
    }

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .expect("read_dir must succeed")
            .flatten()
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    fn expire(path: &Path, minutes: i64) {
        let then = FileTime::from_unix_time(FileTime::now().unix_seconds() - minutes * 60 - 1, 0);
        filetime::set_file_mtime(path, then).expect("set mtime must succeed");
    }

    /// Disabled caches call the generator once and leave no files.
    #[test]
    fn test_disabled() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);

        for cache in [SlotCache::new(&dir, 0), SlotCache::disabled()].iter() {
            let mut generator = Counter::new("page");
            assert_eq!(run(cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"page#1");
            assert_eq!(generator.calls, 1);
        }

        let mut generator = Counter::new("page");
        let cache = SlotCache::new(&dir, 64);
        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Disabled, &mut generator), b"page#1");
        assert_eq!(generator.calls, 1);

        assert!(entries(&dir).is_empty());
    }

    /// First call fills the slot, second call serves it, and a call
    /// after expiry regenerates it.
    #[test]
    fn test_fill_hit_expire() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let cache = SlotCache::new(&dir, 64);
        let paths = SlotPaths::new(&dir, b"p=log", 64);
        let mut generator = Counter::new("log");

        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"log#1");
        assert_eq!(entries(&dir).len(), 1);
        assert_eq!(
            std::fs::read(&paths.slot).expect("read must succeed"),
            b"p=log\0log#1"
        );

        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"log#1");
        assert_eq!(generator.calls, 1);

        expire(&paths.slot, 5);
        let old_mtime = FileTime::from_last_modification_time(
            &std::fs::metadata(&paths.slot).expect("stat must succeed"),
        );
        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"log#2");
        assert_eq!(generator.calls, 2);

        let new_mtime = FileTime::from_last_modification_time(
            &std::fs::metadata(&paths.slot).expect("stat must succeed"),
        );
        assert!(new_mtime > old_mtime);
        assert_eq!(entries(&dir).len(), 1);
    }

    /// Slots cached forever never regenerate.
    #[test]
    fn test_forever() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let cache = SlotCache::new(&dir, 64);
        let paths = SlotPaths::new(&dir, b"id=abc", 64);
        let mut generator = Counter::new("blob");

        assert_eq!(run(&cache, &temp, b"id=abc", Ttl::Forever, &mut generator), b"blob#1");
        expire(&paths.slot, 60 * 24 * 365);
        assert_eq!(run(&cache, &temp, b"id=abc", Ttl::Forever, &mut generator), b"blob#1");
        assert_eq!(generator.calls, 1);
    }

    /// Two keys sharing a slot evict each other, and never see each
    /// other's content.
    #[test]
    fn test_collision() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        // With a single slot, every key collides.
        let cache = SlotCache::new(&dir, 1);
        let mut first = Counter::new("first");
        let mut second = Counter::new("second");

        assert_eq!(run(&cache, &temp, b"k1", Ttl::Minutes(5), &mut first), b"first#1");
        assert_eq!(run(&cache, &temp, b"k2", Ttl::Minutes(5), &mut second), b"second#1");

        let slot = dir.join("00000000");
        assert_eq!(std::fs::read(&slot).expect("read must succeed"), b"k2\0second#1");

        assert_eq!(run(&cache, &temp, b"k1", Ttl::Minutes(5), &mut first), b"first#2");
        assert_eq!(entries(&dir), vec!["00000000".to_owned()]);
    }

    /// When someone else holds the lock, a miss renders without the
    /// cache, and an expired hit serves stale content.
    #[test]
    fn test_busy() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let cache = SlotCache::new(&dir, 64);
        let paths = SlotPaths::new(&dir, b"p=log", 64);
        let key = SlotKey::new(b"p=log").expect("valid key");
        let mut generator = Counter::new("log");

        {
            let _held = SlotLock::try_acquire(&paths, &key)
                .expect("lock must succeed")
                .expect("lock must be free");

            assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"log#1");
            assert!(std::fs::metadata(&paths.slot).is_err());
        }

        // Drop the leftover lock file and populate the slot.
        std::fs::remove_file(&paths.lock).expect("remove must succeed");
        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"log#2");
        expire(&paths.slot, 5);

        let _held = SlotLock::try_acquire(&paths, &key)
            .expect("lock must succeed")
            .expect("lock must be free");
        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"log#2");
        assert_eq!(generator.calls, 2);
    }

    /// A failing generator on a miss is retried without the cache,
    /// and leaves no lock file behind.
    #[test]
    fn test_miss_fill_failure() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let cache = SlotCache::new(&dir, 64);

        let out_path = temp.path("response.out");
        let mut out = File::create(&out_path).expect("create must succeed");
        let mut generator = Failing(0);
        assert!(cache
            .process(b"p=log", Ttl::Minutes(5), &mut out, &mut generator)
            .is_err());

        // Once for the fill, once uncached.
        assert_eq!(generator.0, 2);
        assert!(entries(&dir).is_empty());
    }

    /// A failing regeneration on an expired hit serves the stale slot.
    #[test]
    fn test_hit_fill_failure() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let cache = SlotCache::new(&dir, 64);
        let paths = SlotPaths::new(&dir, b"p=log", 64);

        let mut generator = Counter::new("log");
        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"log#1");
        expire(&paths.slot, 5);

        let mut failing = Failing(0);
        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut failing), b"log#1");
        assert_eq!(failing.0, 1);
        assert_eq!(entries(&dir).len(), 1);
        assert_eq!(
            std::fs::read(&paths.slot).expect("read must succeed"),
            b"p=log\0log#1"
        );
    }

    /// If the slot was replaced between our open and our lock, the
    /// regeneration is abandoned: the lock file goes away, the generator
    /// never runs, and the replacement is left alone.
    #[test]
    fn test_regenerate_slot_replaced() {
        use crate::slot::Slot;

        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let cache = SlotCache::new(&dir, 64);
        let paths = SlotPaths::new(&dir, b"p=log", 64);
        let key = SlotKey::new(b"p=log").expect("valid key");

        std::fs::write(&paths.slot, b"p=log\0original").expect("write must succeed");
        let mut stale = Slot::open(&paths.slot, Some(&key))
            .expect("open must succeed")
            .expect("slot must exist");
        assert!(stale.matches());

        let replacement = temp.path("replacement");
        std::fs::write(&replacement, b"p=log\0other").expect("write must succeed");
        std::fs::rename(&replacement, &paths.slot).expect("rename must succeed");

        let lock = SlotLock::try_acquire(&paths, &key)
            .expect("lock must succeed")
            .expect("lock must be free");
        let mut generator = Counter::new("log");
        assert!(cache.regenerate(&stale, lock, &mut generator).is_none());

        assert_eq!(generator.calls, 0);
        assert!(std::fs::metadata(&paths.lock).is_err());
        assert_eq!(
            std::fs::read(&paths.slot).expect("read must succeed"),
            b"p=log\0other"
        );

        // The request still gets the content it opened.
        let out_path = temp.path("response.out");
        let mut out = File::create(&out_path).expect("create must succeed");
        stale.print(&mut out).expect("print must succeed");
        assert_eq!(std::fs::read(&out_path).expect("read must succeed"), b"original");
    }

    /// Keys that can't be stored render without the cache.
    #[test]
    fn test_invalid_key() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let cache = SlotCache::new(&dir, 64);
        let mut generator = Counter::new("page");

        let long = vec![b'q'; crate::MAX_KEY_LEN + 1];
        assert_eq!(run(&cache, &temp, &long, Ttl::Minutes(5), &mut generator), b"page#1");
        assert_eq!(run(&cache, &temp, b"a\0b", Ttl::Minutes(5), &mut generator), b"page#2");
        assert!(entries(&dir).is_empty());
    }

    /// A missing cache directory degrades to uncached rendering.
    #[test]
    fn test_missing_cache_root() {
        let temp = TestDir::temp();
        let cache = SlotCache::new(temp.path("does/not/exist"), 64);
        let mut generator = Counter::new("page");

        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"page#1");
        assert_eq!(run(&cache, &temp, b"p=log", Ttl::Minutes(5), &mut generator), b"page#2");
    }

    /// The free function agrees with `SlotCache`.
    #[test]
    fn test_cache_process() {
        let temp = TestDir::temp();
        let dir = cache_dir(&temp);
        let out_path = temp.path("response.out");
        let mut generator = Counter::new("summary");

        for _ in 0..2 {
            let mut out = File::create(&out_path).expect("create must succeed");
            cache_process(64, Some(&dir), b"", Ttl::Minutes(5), &mut out, &mut generator)
                .expect("process must succeed");
            assert_eq!(std::fs::read(&out_path).expect("read must succeed"), b"summary#1");
        }

        let mut out = File::create(&out_path).expect("create must succeed");
        cache_process(64, None, b"", Ttl::Minutes(5), &mut out, &mut generator)
            .expect("process must succeed");
        assert_eq!(std::fs::read(&out_path).expect("read must succeed"), b"summary#2");
    }
}
