//! File-descriptor backed accessory.
//!
//! On Android the app opens the accessory through `UsbManager`, detaches the
//! descriptor from its `ParcelFileDescriptor` and passes the raw fd down. A
//! negative fd is what the app sends when `openAccessory` returned nothing.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::error::{PipeError, PipeResult};
use crate::stream::{AccessoryHandle, ByteStream, ReadOutcome};

/// A raw accessory descriptor whose ownership was handed to native code
#[derive(Debug)]
pub struct FdAccessory {
    fd: RawFd,
}

impl FdAccessory {
    /// Take ownership of `fd`.
    ///
    /// # Safety
    ///
    /// If `fd` is non-negative and open, the caller must own it and must not
    /// use or close it afterwards.
    pub unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self { fd }
    }

    fn is_open(fd: RawFd) -> bool {
        // SAFETY: F_GETFD only inspects the descriptor table
        unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
    }
}

impl AccessoryHandle for FdAccessory {
    type Stream = FdStream;

    fn open_stream(mut self) -> PipeResult<FdStream> {
        let fd = std::mem::replace(&mut self.fd, -1);
        if fd < 0 {
            return Err(PipeError::OpenFailed(
                "openAccessory returned no descriptor".into(),
            ));
        }
        if !Self::is_open(fd) {
            return Err(PipeError::DeviceUnavailable(format!(
                "fd {fd}: {}",
                io::Error::last_os_error()
            )));
        }
        // SAFETY: ownership was transferred in from_raw_fd and the fd is open
        let owned = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(FdStream::new(owned))
    }
}

impl Drop for FdAccessory {
    fn drop(&mut self) {
        if self.fd >= 0 && Self::is_open(self.fd) {
            // SAFETY: never opened, so we still own the descriptor
            drop(unsafe { OwnedFd::from_raw_fd(self.fd) });
        }
    }
}

/// Accessory stream reading straight from the descriptor with `read(2)`
#[derive(Debug)]
pub struct FdStream {
    fd: OwnedFd,
    closed: AtomicBool,
}

impl FdStream {
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            closed: AtomicBool::new(false),
        }
    }
}

impl ByteStream for FdStream {
    fn read(&self, buf: &mut [u8]) -> io::Result<ReadOutcome> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "accessory stream closed",
            ));
        }

        // SAFETY: buf is valid for writes of buf.len() bytes
        let n = unsafe { libc::read(self.fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        match n {
            n if n > 0 => Ok(ReadOutcome::Data(n as usize)),
            0 => Ok(ReadOutcome::EndOfStream),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Sockets are shut down first, which wakes a blocked reader. The
    /// descriptor is then pointed at `/dev/null` so its number stays taken
    /// until the last reference drops; a reader still holding the stream
    /// sees end of stream instead of another file's data.
    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let fd = self.fd.as_raw_fd();
        // SAFETY: shutdown on a non-socket fails with ENOTSOCK and has no effect
        if unsafe { libc::shutdown(fd, libc::SHUT_RDWR) } == -1 {
            debug!("shutdown on accessory fd skipped: {}", io::Error::last_os_error());
        }

        let null = File::open("/dev/null")?;
        // SAFETY: both descriptors are open; dup2 atomically replaces fd
        if unsafe { libc::dup2(null.as_raw_fd(), fd) } == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
