//! `StdoutGenerator` rewires file descriptor 1, so it gets a test
//! binary of its own: nothing else may write to stdout concurrently.
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::process::Command;

use slot_cache::SlotCache;
use slot_cache::StdoutGenerator;
use slot_cache::Ttl;

fn stdout_identity() -> (u64, u64) {
    // SAFETY: `stat` is plain old data, and fd 1 is always open in a
    // test process.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(libc::STDOUT_FILENO, &mut stat) };
    assert_eq!(ret, 0, "fstat(1) must succeed");
    (stat.st_dev as u64, stat.st_ino as u64)
}

#[test]
fn test_stdout_generator_fills_slot() {
    let temp = tempfile::tempdir().expect("tempdir must succeed");
    let cache = SlotCache::new(temp.path(), 16);
    let before = stdout_identity();

    let mut calls = 0;
    let mut generator = StdoutGenerator(|| {
        calls += 1;
        std::io::stdout().write_all(b"Content-Type: text/plain\n\n")?;
        // Subprocesses inherit the redirected descriptor.
        let status = Command::new("sh").arg("-c").arg("printf 'hello from sh'").status()?;
        assert!(status.success());
        Ok(())
    });

    let out_path = temp.path().join("response");
    for _ in 0..2 {
        let mut out = std::fs::File::create(&out_path).expect("create must succeed");
        cache
            .process(b"p=about", Ttl::Minutes(5), &mut out, &mut generator)
            .expect("process must succeed");
        drop(out);

        assert_eq!(
            std::fs::read(&out_path).expect("read must succeed"),
            b"Content-Type: text/plain\n\nhello from sh"
        );
    }

    drop(generator);
    assert_eq!(calls, 1);

    // Standard output is back where it was.
    assert_eq!(stdout_identity(), before);

    // The slot holds the header and the captured output; no lock file
    // is left behind.
    let mut names: Vec<_> = std::fs::read_dir(temp.path())
        .expect("read_dir must succeed")
        .flatten()
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name != "response")
        .collect();
    names.sort();
    assert_eq!(names.len(), 1);
    assert!(!names[0].ends_with(".lock"));

    let slot = std::fs::read(temp.path().join(&names[0])).expect("read must succeed");
    assert_eq!(slot, b"p=about\0Content-Type: text/plain\n\nhello from sh");

    // Failing generators still restore stdout.
    let mut failing = StdoutGenerator(|| -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "render failed"))
    });
    let mut out = std::fs::File::create(&out_path).expect("create must succeed");
    assert!(cache
        .process(b"p=log", Ttl::Minutes(5), &mut out, &mut failing)
        .is_err());
    assert_eq!(stdout_identity(), before);
    assert!(out.as_raw_fd() != libc::STDOUT_FILENO);
}
