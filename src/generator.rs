//! Content generators produce the response bytes behind a cache slot.
//!
//! The orchestrator hands each generator a [`Sink`]: the lock file
//! when filling a slot, or the real output when rendering without the
//! cache.  Generators that can only write to the process's standard
//! output (e.g., because they run a subprocess that inherits it) can
//! be wrapped in a [`StdoutGenerator`], which temporarily points file
//! descriptor 1 at the sink and always restores it afterwards.
use std::io::Result;
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::os::unix::io::FromRawFd;
use std::os::unix::io::OwnedFd;
use std::os::unix::io::RawFd;

/// A destination for response bytes.  Serving a slot writes straight
/// to the sink's file descriptor, so sinks must expose one.
pub trait Sink: Write + AsRawFd {}

impl<T: Write + AsRawFd + ?Sized> Sink for T {}

/// Renders a response into a sink.
pub trait Generator {
    /// Writes the full response to `out`.  Anything buffered must be
    /// flushed to `out` before returning: the cache measures the slot
    /// file as soon as the generator returns.
    fn generate(&mut self, out: &mut dyn Sink) -> Result<()>;
}

impl<F> Generator for F
where
    F: FnMut(&mut dyn Sink) -> Result<()>,
{
    fn generate(&mut self, out: &mut dyn Sink) -> Result<()> {
        (*self)(&mut *out)?;
        out.flush()
    }
}

/// Converts a libc return value to a `Result`.
fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret == -1 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// While alive, the process's standard output (file descriptor 1)
/// points at another file.  Dropping the guard flushes
/// [`std::io::stdout`] and restores the original standard output, on
/// every exit path, panics included.
#[derive(Debug)]
pub struct StdoutRedirect {
    saved: OwnedFd,
}

impl StdoutRedirect {
    /// Points standard output at `target` until the returned guard is
    /// dropped.
    pub fn to(target: RawFd) -> Result<StdoutRedirect> {
        std::io::stdout().flush()?;

        // SAFETY: `dup` has no memory safety preconditions; on success
        // we own the new descriptor.
        let saved = unsafe { OwnedFd::from_raw_fd(cvt(libc::dup(libc::STDOUT_FILENO))?) };
        // SAFETY: both descriptors are open; on failure, `saved` is
        // closed on drop and stdout is untouched.
        cvt(unsafe { libc::dup2(target, libc::STDOUT_FILENO) })?;

        Ok(StdoutRedirect { saved })
    }
}

impl Drop for StdoutRedirect {
    fn drop(&mut self) {
        let _ = std::io::stdout().flush();

        loop {
            // SAFETY: `saved` is open until `self` is dropped.
            match cvt(unsafe { libc::dup2(self.saved.as_raw_fd(), libc::STDOUT_FILENO) }) {
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    crate::benign_error::log_os_error("Unable to restore stdout", &e);
                    break;
                }
                Ok(_) => break,
            }
        }
    }
}

/// Adapts a generator that writes to the process's standard output.
///
/// When the sink isn't already standard output, the callback runs
/// with standard output redirected to the sink.
#[derive(Debug)]
pub struct StdoutGenerator<F>(pub F);

impl<F> Generator for StdoutGenerator<F>
where
    F: FnMut() -> Result<()>,
{
    fn generate(&mut self, out: &mut dyn Sink) -> Result<()> {
        let fd = out.as_raw_fd();
        if fd == libc::STDOUT_FILENO {
            (self.0)()?;
            return std::io::stdout().flush();
        }

        out.flush()?;
        let _redirect = StdoutRedirect::to(fd)?;
        (self.0)()?;
        std::io::stdout().flush()
    }
}

/// Closure generators flush their sink.
#[test]
fn test_closure_generator() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let path = temp.path("out");
    let mut file = std::fs::File::create(&path).expect("create must succeed");

    let mut calls = 0;
    let mut generator = |out: &mut dyn Sink| -> Result<()> {
        calls += 1;
        out.write_all(b"hello ")?;
        out.write_all(b"world")
    };

    generator
        .generate(&mut file)
        .expect("generate must succeed");
    drop(generator);

    assert_eq!(calls, 1);
    assert_eq!(std::fs::read(&path).expect("read must succeed"), b"hello world");
}

/// Generator errors propagate.
#[test]
fn test_generator_error() {
    use test_dir::{DirBuilder, TestDir};

    let temp = TestDir::temp();
    let mut file = std::fs::File::create(temp.path("out")).expect("create must succeed");
    let mut generator = |_: &mut dyn Sink| -> Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Other, "render failed"))
    };

    assert!(generator.generate(&mut file).is_err());
}
