/// We expect some [`std::io::Error`] during regular operations: the
/// slot cache relies on the filesystem for concurrency control, so
/// missing files and contended locks are part of the steady state.
use std::io::Error;
use std::io::ErrorKind;

/// Checks whether the error is for a missing file: NotFound, or stale
/// handle.  A stale (NFS) handle means the inode we're trying to read
/// isn't available on the server anymore; slots do get replaced and
/// pruned, so we treat that like a plain miss.
pub fn is_absent_file_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::NotFound {
        true
    } else if let Some(errno) = error.raw_os_error() {
        errno == libc::ESTALE
    } else {
        false
    }
}

/// Checks whether a non-blocking lock attempt failed because some
/// other open file description already holds the lock.
pub fn is_busy_lock_error(error: &Error) -> bool {
    if error.kind() == ErrorKind::WouldBlock {
        true
    } else if let Some(errno) = error.raw_os_error() {
        // Some platforms report a contended lock as EACCES.
        errno == libc::EWOULDBLOCK || errno == libc::EAGAIN || errno == libc::EACCES
    } else {
        false
    }
}

/// Checks whether a data transfer failed for a transient reason, and
/// should simply be retried.
pub fn is_transient_error(error: &Error) -> bool {
    matches!(error.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock)
}

/// Returns the errno for `error`, or `EIO` for errors that did not
/// come from the operating system.
pub fn errno(error: &Error) -> i32 {
    error.raw_os_error().unwrap_or(libc::EIO)
}

/// Returns the C library's description for `errno`.
pub fn strerror(errno: i32) -> String {
    let mut buf = [0 as libc::c_char; 256];

    // SAFETY: `buf` is a writable buffer of `buf.len()` bytes, and
    // `strerror_r` always NUL-terminates on success.
    let ret = unsafe { libc::strerror_r(errno, buf.as_mut_ptr(), buf.len()) };
    if ret != 0 {
        return format!("Unknown error {}", errno);
    }

    // SAFETY: see above; the buffer now holds a C string.
    let msg = unsafe { std::ffi::CStr::from_ptr(buf.as_ptr()) };
    msg.to_string_lossy().into_owned()
}

/// Formats the diagnostic line for an unexpected OS-level failure:
/// `[cache] <message>: <strerror> (<errno>)`.
pub fn format_os_error(message: &str, error: &Error) -> String {
    let errno = errno(error);
    format!("[cache] {}: {} ({})", message, strerror(errno), errno)
}

/// Logs an unexpected OS-level failure to the diagnostic stream.
pub fn log_os_error(message: &str, error: &Error) {
    tracing::warn!("{}", format_os_error(message, error));
}

// Mostly trivial, but let's at least make sure we didn't mess up raw_os_error
// and confirm that libc agrees with what we know to be true on Linux.
#[test]
fn test_absent() {
    assert!(is_absent_file_error(&Error::new(
        ErrorKind::NotFound,
        "not found"
    )));
    assert!(!is_absent_file_error(&Error::new(
        ErrorKind::PermissionDenied,
        "bad"
    )));

    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ENOENT)));
    assert!(is_absent_file_error(&Error::from_raw_os_error(libc::ESTALE)));
    assert!(!is_absent_file_error(&Error::from_raw_os_error(libc::EIO)));

    #[cfg(target_os = "linux")]
    assert!(is_absent_file_error(&Error::from_raw_os_error(116))); // ESTALE
}

#[test]
fn test_busy() {
    assert!(is_busy_lock_error(&Error::from_raw_os_error(
        libc::EWOULDBLOCK
    )));
    assert!(is_busy_lock_error(&Error::from_raw_os_error(libc::EACCES)));
    assert!(!is_busy_lock_error(&Error::from_raw_os_error(libc::ENOSPC)));
    assert!(!is_busy_lock_error(&Error::new(ErrorKind::Other, "nope")));
}

#[test]
fn test_transient() {
    assert!(is_transient_error(&Error::from_raw_os_error(libc::EINTR)));
    assert!(is_transient_error(&Error::from_raw_os_error(libc::EAGAIN)));
    assert!(!is_transient_error(&Error::from_raw_os_error(libc::EINVAL)));
}

/// The diagnostic line carries the message, the description, and the
/// numeric errno.
#[test]
fn test_format_os_error() {
    let line = format_os_error(
        "Unable to lock slot /tmp/x.lock",
        &Error::from_raw_os_error(libc::ENOENT),
    );

    assert!(line.starts_with("[cache] Unable to lock slot /tmp/x.lock: "));
    assert!(line.ends_with(&format!(" ({})", libc::ENOENT)));
    assert!(line.contains(&strerror(libc::ENOENT)));

    // Synthetic errors map to EIO.
    assert_eq!(errno(&Error::new(ErrorKind::Other, "synthetic")), libc::EIO);
}
