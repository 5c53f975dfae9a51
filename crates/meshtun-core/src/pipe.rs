//! Tunnel pipe over duplicated host file descriptors.
//!
//! The host keeps ownership of the descriptors it passes in. [`TunnelPipe`]
//! duplicates both of them up front and from then on only ever touches its
//! own copies, so the host may close its originals at any time.

use std::fmt;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::unix::AsyncFd;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::PipeError;

/// Creates independent copies of host descriptors
pub trait HandleDuplicator: Send + Sync {
    /// Duplicate `fd`, returning a descriptor owned by the caller
    fn duplicate(&self, fd: RawFd) -> io::Result<OwnedFd>;
}

/// Duplicates descriptors with `fcntl(F_DUPFD_CLOEXEC)`
#[derive(Debug, Clone, Copy, Default)]
pub struct OsDuplicator;

impl HandleDuplicator for OsDuplicator {
    fn duplicate(&self, fd: RawFd) -> io::Result<OwnedFd> {
        if fd < 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        // SAFETY: fcntl(F_DUPFD_CLOEXEC) reads no memory; it either fails or
        // returns a new descriptor.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup < 0 {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `dup` was just created by the kernel and nothing else owns it.
        Ok(unsafe { OwnedFd::from_raw_fd(dup) })
    }
}

/// Bidirectional byte stream over a duplicated read/write descriptor pair.
///
/// Owns both duplicates exclusively. They are released by [`close`](Self::close),
/// on drop, or by dropping the halves returned from
/// [`into_split`](Self::into_split), whichever comes first.
pub struct TunnelPipe {
    reader: Option<PipeReader>,
    writer: Option<PipeWriter>,
}

impl TunnelPipe {
    /// Duplicate the host's descriptors and open a pipe over the copies.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(read_fd: RawFd, write_fd: RawFd) -> Result<Self, PipeError> {
        Self::open_with(&OsDuplicator, read_fd, write_fd)
    }

    /// [`open`](Self::open) with a caller-supplied duplicator.
    ///
    /// The read descriptor is duplicated first. If the write duplication
    /// fails the read duplicate is closed before returning, and if opening
    /// the pipe fails both duplicates are closed. No descriptor survives a
    /// failed call.
    pub fn open_with(
        duplicator: &dyn HandleDuplicator,
        read_fd: RawFd,
        write_fd: RawFd,
    ) -> Result<Self, PipeError> {
        let read = duplicator
            .duplicate(read_fd)
            .map_err(|source| PipeError::DupRead {
                fd: read_fd,
                source,
            })?;

        let write = match duplicator.duplicate(write_fd) {
            Ok(write) => write,
            Err(source) => {
                drop(read);
                return Err(PipeError::DupWrite {
                    fd: write_fd,
                    source,
                });
            }
        };

        Self::from_owned(read, write).map_err(PipeError::Open)
    }

    /// Open a pipe over descriptors the caller already owns.
    ///
    /// Both descriptors are switched to non-blocking mode and registered
    /// with the runtime's reactor. On error both are closed.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_owned(read: OwnedFd, write: OwnedFd) -> io::Result<Self> {
        set_nonblocking(read.as_raw_fd())?;
        set_nonblocking(write.as_raw_fd())?;

        let reader = PipeReader {
            inner: AsyncFd::new(read)?,
        };
        let writer = PipeWriter {
            inner: AsyncFd::new(write)?,
        };

        Ok(Self {
            reader: Some(reader),
            writer: Some(writer),
        })
    }

    /// Release both descriptors.
    ///
    /// Returns `true` if this call closed them, `false` if the pipe was
    /// already closed. Calling it again is a no-op.
    pub fn close(&mut self) -> bool {
        let reader = self.reader.take();
        let writer = self.writer.take();
        let closed = reader.is_some() || writer.is_some();
        drop(reader);
        drop(writer);
        closed
    }

    /// Whether the descriptors have been released
    pub fn is_closed(&self) -> bool {
        self.reader.is_none() && self.writer.is_none()
    }

    /// The duplicated `(read, write)` descriptors, while open
    pub fn raw_fds(&self) -> Option<(RawFd, RawFd)> {
        match (&self.reader, &self.writer) {
            (Some(r), Some(w)) => Some((r.as_raw_fd(), w.as_raw_fd())),
            _ => None,
        }
    }

    /// Split into independently owned halves
    pub fn into_split(mut self) -> io::Result<(PipeReader, PipeWriter)> {
        match (self.reader.take(), self.writer.take()) {
            (Some(reader), Some(writer)) => Ok((reader, writer)),
            _ => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tunnel pipe is closed",
            )),
        }
    }
}

impl fmt::Debug for TunnelPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelPipe")
            .field("fds", &self.raw_fds())
            .finish()
    }
}

/// Read half of a [`TunnelPipe`]
pub struct PipeReader {
    inner: AsyncFd<OwnedFd>,
}

impl AsRawFd for PipeReader {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            let mut guard = ready!(self.inner.poll_read_ready(cx))?;
            let unfilled = buf.initialize_unfilled();
            match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), unfilled)) {
                Ok(Ok(n)) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Poll::Ready(Err(err)),
                Err(_would_block) => continue,
            }
        }
    }
}

/// Write half of a [`TunnelPipe`]
pub struct PipeWriter {
    inner: AsyncFd<OwnedFd>,
}

impl AsRawFd for PipeWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.get_ref().as_raw_fd()
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            let mut guard = ready!(self.inner.poll_write_ready(cx))?;
            match guard.try_io(|inner| write_fd(inner.get_ref().as_raw_fd(), buf)) {
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(result) => return Poll::Ready(result),
                Err(_would_block) => continue,
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // The descriptor is closed when the half is dropped.
        Poll::Ready(Ok(()))
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL/F_SETFL only read and write descriptor flags.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if flags & libc::O_NONBLOCK == 0 && libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
        {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn read_fd(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: `buf` is a valid, writable region of `buf.len()` bytes.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // Sockets get MSG_NOSIGNAL so a vanished host raises EPIPE instead of
    // SIGPIPE; anything else falls back to write(2).
    // SAFETY: `buf` is a valid, readable region of `buf.len()` bytes.
    let n = unsafe { libc::send(fd, buf.as_ptr().cast(), buf.len(), libc::MSG_NOSIGNAL) };
    if n >= 0 {
        return Ok(n as usize);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() != Some(libc::ENOTSOCK) {
        return Err(err);
    }
    // SAFETY: as above.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn write_fd(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    // SAFETY: `buf` is a valid, readable region of `buf.len()` bytes.
    let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(n as usize)
    }
}

/// Create an OS pipe, returning `(read, write)`.
///
/// Used by tests and by hosts that want to drive a tunnel in-process.
pub fn os_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: `fds` has room for the two descriptors pipe(2) writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: both descriptors were just created and are owned by nobody else.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}
