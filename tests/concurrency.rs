//! Many threads hammering the same slots, standing in for concurrent
//! CGI processes.  `flock` locks belong to open file descriptions, so
//! threads contend exactly like processes do.
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Barrier;
use std::time::Duration;

use filetime::FileTime;
use slot_cache::fingerprint::slot_name;
use slot_cache::fingerprint::SlotPaths;
use slot_cache::Generator;
use slot_cache::Sink;
use slot_cache::SlotCache;
use slot_cache::Ttl;

const NUM_THREADS: usize = 8;
const NUM_ROUNDS: usize = 20;
const TABLE_SIZE: usize = 4;

fn body(key: &str) -> Vec<u8> {
    let mut body = format!("<begin {}>", key).into_bytes();
    body.extend(std::iter::repeat(b'x').take(10_000));
    body.extend_from_slice(format!("<end {}>", key).as_bytes());
    body
}

/// Writes `body(key)` in slow chunks, and tracks how many generators
/// are concurrently filling each slot's lock file.
struct SlowRender {
    key: String,
    root: PathBuf,
    filling: Arc<Vec<AtomicUsize>>,
    max_filling: Arc<AtomicUsize>,
}

impl SlowRender {
    /// Returns the slot index whose lock file `out` is, if any.
    fn filling_slot(&self, out: &dyn Sink) -> Option<usize> {
        let ours = std::fs::metadata(format!("/proc/self/fd/{}", out.as_raw_fd())).ok()?;

        (0..TABLE_SIZE).find(|&index| {
            let slot = self.root.join(slot_name(index));
            match std::fs::metadata(SlotPaths::for_slot(slot).lock) {
                Ok(meta) => {
                    use std::os::unix::fs::MetadataExt;
                    meta.dev() == ours.dev() && meta.ino() == ours.ino()
                }
                Err(_) => false,
            }
        })
    }
}

impl Generator for SlowRender {
    fn generate(&mut self, out: &mut dyn Sink) -> std::io::Result<()> {
        let slot = self.filling_slot(out);
        if let Some(index) = slot {
            let now = self.filling[index].fetch_add(1, Ordering::SeqCst) + 1;
            self.max_filling.fetch_max(now, Ordering::SeqCst);
        }

        let body = body(&self.key);
        let mut ret = Ok(());
        for chunk in body.chunks(1000) {
            ret = out.write_all(chunk);
            if ret.is_err() {
                break;
            }

            std::thread::sleep(Duration::from_micros(200));
        }

        if let Some(index) = slot {
            self.filling[index].fetch_sub(1, Ordering::SeqCst);
        }

        ret?;
        out.flush()
    }
}

fn expire_all(root: &Path) {
    let then = FileTime::from_unix_time(FileTime::now().unix_seconds() - 3600, 0);

    for dirent in std::fs::read_dir(root).expect("read_dir must succeed").flatten() {
        // Slots may be renamed under our feet.
        let _ = filetime::set_file_mtime(dirent.path(), then);
    }
}

/// Every response is exactly one complete body for the requested key,
/// and at most one generator fills any slot at any time.
#[test]
fn test_concurrent_requests() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let root = temp.path().join("cache");
    let scratch = temp.path().join("out");
    std::fs::create_dir_all(&root).expect("mkdir must succeed");
    std::fs::create_dir_all(&scratch).expect("mkdir must succeed");

    let filling = Arc::new((0..TABLE_SIZE).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
    let max_filling = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(NUM_THREADS + 1));

    let mut workers = Vec::new();
    for thread in 0..NUM_THREADS {
        let root = root.clone();
        let scratch = scratch.clone();
        let filling = filling.clone();
        let max_filling = max_filling.clone();
        let barrier = barrier.clone();

        workers.push(std::thread::spawn(move || {
            let cache = SlotCache::new(&root, TABLE_SIZE);
            let out_path = scratch.join(format!("{}", thread));
            barrier.wait();

            for round in 0..NUM_ROUNDS {
                let key = format!("p=log&ofs={}", (thread + round) % 6);
                let mut generator = SlowRender {
                    key: key.clone(),
                    root: root.clone(),
                    filling: filling.clone(),
                    max_filling: max_filling.clone(),
                };

                let mut out = std::fs::File::create(&out_path).expect("create must succeed");
                cache
                    .process(key.as_bytes(), Ttl::Minutes(5), &mut out, &mut generator)
                    .expect("process must succeed");
                drop(out);

                let got = std::fs::read(&out_path).expect("read must succeed");
                assert!(got == body(&key), "torn or mismatched response for {}", key);
            }
        }));
    }

    barrier.wait();
    for _ in 0..10 {
        std::thread::sleep(Duration::from_millis(5));
        expire_all(&root);
    }

    for worker in workers {
        worker.join().expect("worker must not panic");
    }

    assert!(max_filling.load(Ordering::SeqCst) <= 1);

    // Whatever survived is internally consistent: each slot's payload
    // is the full body for the key in its header.
    for entry in slot_cache::list(&root).expect("list must succeed") {
        let contents = std::fs::read(&entry.path).expect("read must succeed");
        let nul = contents
            .iter()
            .position(|&b| b == 0)
            .expect("slot must have a header");
        let key = std::str::from_utf8(&contents[..nul]).expect("key must be utf-8");
        assert_eq!(&contents[nul + 1..], &body(key)[..]);
    }
}

/// A reader that opened a slot keeps its content while the slot is
/// regenerated under it.
#[test]
fn test_read_during_regeneration() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let root = temp.path();
    let cache = SlotCache::new(root, 1);

    let out_path = root.join("out");
    let mut render = |out: &mut dyn Sink| out.write_all(b"first");
    let mut out = std::fs::File::create(&out_path).expect("create must succeed");
    cache
        .process(b"p=log", Ttl::Minutes(5), &mut out, &mut render)
        .expect("process must succeed");

    let paths = SlotPaths::new(root, b"p=log", 1);
    let mut reader = slot_cache::slot::Slot::open(&paths.slot, None)
        .expect("open must succeed")
        .expect("slot must exist");

    expire_all(root);
    let mut render = |out: &mut dyn Sink| out.write_all(b"second, and longer");
    let mut out = std::fs::File::create(&out_path).expect("create must succeed");
    cache
        .process(b"p=log", Ttl::Minutes(5), &mut out, &mut render)
        .expect("process must succeed");
    assert_eq!(std::fs::read(&out_path).expect("read must succeed"), b"second, and longer");

    let mut out = std::fs::File::create(&out_path).expect("create must succeed");
    reader.print(&mut out).expect("print must succeed");
    assert_eq!(std::fs::read(&out_path).expect("read must succeed"), b"first");
    assert!(reader.is_modified());
}
