use std::fs::File;
use std::io;

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

#[cfg(windows)]
use std::os::windows::io::AsRawHandle;

/// Acquires an exclusive advisory lock on an already-open file handle.
///
/// The working folder holds exactly two files, so the store locks its index
/// handle directly instead of maintaining a separate lock file. The lock is
/// released automatically when the handle is closed.
pub fn try_lock(file: &File) -> io::Result<()> {
    platform_lock(file)
}

#[cfg(unix)]
fn platform_lock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let fd = file.as_raw_fd();
    let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(windows)]
fn platform_lock(file: &File) -> io::Result<()> {
    use winapi::um::fileapi::LockFileEx;
    use winapi::um::winnt::{LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY};

    let handle = file.as_raw_handle();
    let result = unsafe {
        LockFileEx(
            handle as *mut _,
            LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY,
            0,
            !0,
            !0,
            std::ptr::null_mut(),
        )
    };

    if result == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(any(unix, windows)))]
fn platform_lock(_file: &File) -> io::Result<()> {
    // Fallback for other platforms - just succeed
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::NamedTempFile;

    #[test]
    fn test_lock_released_on_close() {
        let temp = NamedTempFile::new().expect("Failed to create temporary file");

        {
            let first = OpenOptions::new()
                .read(true)
                .write(true)
                .open(temp.path())
                .expect("Failed to open file");
            try_lock(&first).expect("Failed to acquire lock");
        }

        // The handle is closed, so a fresh open must be lockable again.
        let second = OpenOptions::new()
            .read(true)
            .write(true)
            .open(temp.path())
            .expect("Failed to reopen file");
        try_lock(&second).expect("Should be able to lock after close");
    }

    #[test]
    #[cfg(unix)]
    fn test_double_lock_fails() {
        let temp = NamedTempFile::new().expect("Failed to create temporary file");

        let first = OpenOptions::new()
            .read(true)
            .write(true)
            .open(temp.path())
            .expect("Failed to open file");
        try_lock(&first).expect("Failed to acquire first lock");

        // A second open file description on the same path must be refused.
        let second = OpenOptions::new()
            .read(true)
            .write(true)
            .open(temp.path())
            .expect("Failed to reopen file");
        assert!(try_lock(&second).is_err());
    }
}
