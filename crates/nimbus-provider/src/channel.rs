use std::io;
use std::net::Shutdown;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

/// Which way the payload flows, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

/// Connected socket pair carrying one transfer's payload.
///
/// The remote end is handed to the client exactly once; the local end stays
/// with the job. Unused directions are shut down on both ends.
pub struct StreamingChannel {
    local: UnixStream,
    remote: Option<OwnedFd>,
}

impl StreamingChannel {
    pub fn new(direction: Direction) -> io::Result<Self> {
        let (local, remote) = UnixStream::pair()?;
        match direction {
            Direction::Upload => {
                local.shutdown(Shutdown::Write)?;
                remote.shutdown(Shutdown::Read)?;
            }
            Direction::Download => {
                local.shutdown(Shutdown::Read)?;
                remote.shutdown(Shutdown::Write)?;
            }
        }
        local.set_nonblocking(true)?;
        Ok(Self {
            local,
            remote: Some(remote.into()),
        })
    }

    /// The client's end. Yields `Some` only on the first call.
    pub fn take_remote(&mut self) -> Option<OwnedFd> {
        self.remote.take()
    }

    /// Second handle on the retained end, for reads that must not wait on
    /// the runtime's readiness tracking.
    pub fn try_clone_local(&self) -> io::Result<UnixStream> {
        self.local.try_clone()
    }

    /// Register the retained end with the runtime. Drops the remote end if it
    /// was never taken.
    pub fn into_local(self) -> io::Result<tokio::net::UnixStream> {
        tokio::net::UnixStream::from_std(self.local)
    }
}
