//! Descriptors shared with the spooler.
//!
//! Print data arrives on stdin or a stored file, printer status goes back on
//! the back channel (fd 3) and out-of-band requests use the side channel
//! (fd 4). Each is a trait so the engine can run against in-memory stand-ins.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::Shutdown;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use nix::fcntl::{FcntlArg, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::stat::{SFlag, fstat};
use tracing::debug;

use crate::protocol::constants::{BACKCHANNEL_FD, SIDECHANNEL_FD};
use crate::protocol::sidechannel::{
    FRAME_HEADER_SIZE, MAX_FRAME_DATA, SideChannelError, SideReply, SideRequest, decode_request,
    encode_frame,
};
use crate::transport::lock;

/// Wait for `events` on `fd`. `None` waits forever.
///
/// Returns `Ok(false)` on timeout. An interrupted wait is reported as
/// [`io::ErrorKind::Interrupted`].
pub fn poll_fd(
    fd: BorrowedFd<'_>,
    events: PollFlags,
    timeout: Option<Duration>,
) -> io::Result<bool> {
    let timeout = match timeout {
        Some(t) => {
            let ms = t.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::MAX)
        }
        None => PollTimeout::NONE,
    };
    let mut fds = [PollFd::new(fd, events)];
    let ready = poll(&mut fds, timeout).map_err(io::Error::from)?;
    Ok(ready > 0)
}

/// Borrow an inherited descriptor if it is open.
fn inherited_fd(fd: RawFd) -> Option<OwnedFd> {
    fcntl(fd, FcntlArg::F_GETFD).ok()?;
    // SAFETY: the descriptor was just checked to be open, and the borrow
    // ends with the duplicate.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    borrowed.try_clone_to_owned().ok()
}

fn is_socket(fd: BorrowedFd<'_>) -> bool {
    match fstat(fd.as_raw_fd()) {
        Ok(stat) => {
            SFlag::from_bits_truncate(stat.st_mode & SFlag::S_IFMT.bits()) == SFlag::S_IFSOCK
        }
        Err(_) => false,
    }
}

/// Where print data comes from.
///
/// Methods take `&self`: the side-channel thread drains the source during a
/// soft reset while the main loop may be blocked waiting on it.
pub trait PrintSource: Send + Sync {
    /// Wait until data (or EOF) is readable. `Ok(false)` on timeout.
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool>;

    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether copies can be produced by rewinding.
    fn is_seekable(&self) -> bool;

    /// Seek back to the start for the next copy.
    fn rewind(&self) -> io::Result<()>;

    /// Throw away whatever is immediately readable.
    fn discard_pending(&self) -> io::Result<usize> {
        let mut buf = [0u8; 8192];
        let mut total = 0;
        while self.wait_readable(Some(Duration::ZERO))? {
            match self.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}

/// Print data on a file descriptor.
#[derive(Debug)]
pub struct FdSource {
    file: File,
    seekable: bool,
}

impl FdSource {
    /// Stream from standard input. Not rewindable.
    pub fn stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self {
            file: File::from(fd),
            seekable: false,
        })
    }

    /// A stored print file.
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path)?,
            seekable: true,
        })
    }

    /// Wrap any readable descriptor, e.g. a pipe.
    pub fn from_fd(fd: OwnedFd, seekable: bool) -> Self {
        Self {
            file: File::from(fd),
            seekable,
        }
    }
}

impl PrintSource for FdSource {
    fn wait_readable(&self, timeout: Option<Duration>) -> io::Result<bool> {
        poll_fd(self.file.as_fd(), PollFlags::POLLIN, timeout)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.file).read(buf)
    }

    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn rewind(&self) -> io::Result<()> {
        (&self.file).seek(SeekFrom::Start(0)).map(|_| ())
    }
}

/// Print data held in memory; always readable.
#[derive(Debug, Default)]
pub struct MemorySource {
    data: Vec<u8>,
    position: Mutex<usize>,
}

impl MemorySource {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            position: Mutex::new(0),
        }
    }
}

impl PrintSource for MemorySource {
    fn wait_readable(&self, _timeout: Option<Duration>) -> io::Result<bool> {
        Ok(true)
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut position = lock(&self.position);
        let rest = &self.data[*position..];
        let n = rest.len().min(buf.len());
        buf[..n].copy_from_slice(&rest[..n]);
        *position += n;
        Ok(n)
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn rewind(&self) -> io::Result<()> {
        *lock(&self.position) = 0;
        Ok(())
    }

    fn discard_pending(&self) -> io::Result<usize> {
        let mut position = lock(&self.position);
        let n = self.data.len() - *position;
        *position = self.data.len();
        Ok(n)
    }
}

/// Sink for data the printer sends back.
pub trait BackChannel: Send + Sync {
    /// Write all of `data`, waiting at most `timeout` for the sink to accept it.
    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<usize>;
}

/// Back channel on an inherited descriptor.
#[derive(Debug)]
pub struct FdBackChannel {
    file: Mutex<File>,
}

impl FdBackChannel {
    /// The spooler's back channel, if the process inherited one.
    pub fn inherited() -> Option<Self> {
        inherited_fd(BACKCHANNEL_FD).map(Self::from_fd)
    }

    pub fn from_fd(fd: OwnedFd) -> Self {
        Self {
            file: Mutex::new(File::from(fd)),
        }
    }
}

impl BackChannel for FdBackChannel {
    fn write(&self, data: &[u8], timeout: Duration) -> io::Result<usize> {
        let mut file = lock(&self.file);
        let mut written = 0;
        while written < data.len() {
            if !poll_fd(file.as_fd(), PollFlags::POLLOUT, Some(timeout))? {
                return Err(io::ErrorKind::TimedOut.into());
            }
            match file.write(&data[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }
}

/// Back channel that keeps everything. Used by tests.
#[derive(Debug, Default)]
pub struct MemoryBackChannel {
    data: Mutex<Vec<u8>>,
}

impl MemoryBackChannel {
    pub fn data(&self) -> Vec<u8> {
        lock(&self.data).clone()
    }
}

impl BackChannel for MemoryBackChannel {
    fn write(&self, data: &[u8], _timeout: Duration) -> io::Result<usize> {
        lock(&self.data).extend_from_slice(data);
        Ok(data.len())
    }
}

/// Out-of-band request channel.
pub trait SideChannel: Send + Sync {
    /// Read one request, waiting at most `timeout`.
    fn read_request(&self, timeout: Duration) -> Result<SideRequest, SideChannelError>;

    fn write_reply(&self, reply: &SideReply, timeout: Duration) -> Result<(), SideChannelError>;

    /// Make pending and future reads fail.
    fn close(&self);
}

/// Side channel over a Unix socket.
#[derive(Debug)]
pub struct SocketSideChannel {
    stream: UnixStream,
    write_lock: Mutex<()>,
}

impl SocketSideChannel {
    /// The spooler's side channel, if fd 4 is an open socket.
    pub fn inherited() -> Option<Self> {
        let fd = inherited_fd(SIDECHANNEL_FD)?;
        if !is_socket(fd.as_fd()) {
            debug!(fd = SIDECHANNEL_FD, "Side channel descriptor is not a socket");
            return None;
        }
        Some(Self::new(UnixStream::from(fd)))
    }

    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            write_lock: Mutex::new(()),
        }
    }
}

impl SideChannel for SocketSideChannel {
    fn read_request(&self, timeout: Duration) -> Result<SideRequest, SideChannelError> {
        match poll_fd(self.stream.as_fd(), PollFlags::POLLIN, Some(timeout)) {
            Ok(true) => {}
            Ok(false) => return Err(SideChannelError::Timeout),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Err(SideChannelError::Timeout);
            }
            Err(e) => return Err(e.into()),
        }

        let mut buf = vec![0u8; FRAME_HEADER_SIZE + MAX_FRAME_DATA];
        let n = loop {
            match (&self.stream).read(&mut buf) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        };
        if n == 0 {
            return Err(SideChannelError::Closed);
        }
        decode_request(&buf[..n])
    }

    fn write_reply(&self, reply: &SideReply, timeout: Duration) -> Result<(), SideChannelError> {
        let frame = encode_frame(reply.command, reply.status, &reply.data)?;
        let _guard = lock(&self.write_lock);
        if !poll_fd(self.stream.as_fd(), PollFlags::POLLOUT, Some(timeout))? {
            return Err(SideChannelError::Timeout);
        }
        (&self.stream).write_all(&frame)?;
        Ok(())
    }

    fn close(&self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!(error = %e, "Side channel shutdown");
        }
    }
}
