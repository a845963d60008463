//! Framed IPC channel over Unix socket pairs.
//!
//! Frames are a 4-byte big-endian length prefix followed by a JSON body.
//! Each channel carries the pid of its remote endpoint so a multiplexer
//! hit maps straight back to a process.

use crate::error::{PoolError, Result};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::unistd::Pid;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, Read, Write};
use std::os::unix::io::AsFd;
use std::os::unix::net::UnixStream;
use std::time::Duration;

/// Poll events that should wake a reader. Hangup and error are included so
/// a dead peer is noticed instead of blocking forever.
const READABLE: PollFlags = PollFlags::POLLIN
    .union(PollFlags::POLLHUP)
    .union(PollFlags::POLLERR);

/// One half of a socket pair, annotated with the pid of the peer.
pub struct Channel {
    stream: UnixStream,
    pid: Pid,
}

impl Channel {
    /// Wrap a stream half, annotating it with the remote endpoint's pid.
    pub fn new(stream: UnixStream, pid: Pid) -> Self {
        Self { stream, pid }
    }

    /// Create a connected pair of channels, pids filled in after the fork.
    pub fn pair() -> Result<(UnixStream, UnixStream)> {
        let (a, b) = UnixStream::pair()
            .map_err(|e| PoolError::Transport(format!("socketpair failed: {}", e)))?;
        Ok((a, b))
    }

    /// Pid of the remote endpoint.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send one value as a length-prefixed frame.
    ///
    /// Blocks until the whole frame is written; partial writes and EINTR
    /// are retried internally.
    pub fn send<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        if body.len() > u32::MAX as usize {
            return Err(PoolError::Transport(format!(
                "frame too large: {} bytes",
                body.len()
            )));
        }
        let header = (body.len() as u32).to_be_bytes();
        self.write_all(&header)?;
        self.write_all(&body)?;
        Ok(())
    }

    /// Receive one frame and deserialize it.
    ///
    /// Returns `Ok(None)` if the peer closed the connection before any
    /// header byte arrived (graceful shutdown). EOF in the middle of a
    /// frame is a transport error.
    pub fn receive<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut header = [0u8; 4];
        if !self.read_exact_or_eof(&mut header)? {
            return Ok(None);
        }
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        if !self.read_exact_or_eof(&mut body)? {
            return Err(PoolError::Transport(
                "connection closed mid-frame".to_string(),
            ));
        }
        Ok(Some(serde_json::from_slice(&body)?))
    }

    /// Wait until this channel has data to read, up to `timeout`.
    pub fn ready(&self, timeout: Duration) -> Result<bool> {
        let mut fds = [PollFd::new(self.stream.as_fd(), READABLE)];
        let n = poll_retrying(&mut fds, timeout)?;
        Ok(n > 0)
    }

    fn write_all(&mut self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            match self.stream.write(buf) {
                Ok(0) => {
                    return Err(PoolError::Transport(
                        "connection closed while writing".to_string(),
                    ));
                }
                Ok(n) => buf = &buf[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PoolError::Transport(format!("write failed: {}", e))),
            }
        }
        Ok(())
    }

    /// Fill `buf` completely. Returns `Ok(false)` on EOF before the first
    /// byte; EOF after a partial read is an error.
    fn read_exact_or_eof(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    if filled == 0 {
                        return Ok(false);
                    }
                    return Err(PoolError::Transport(
                        "connection closed mid-frame".to_string(),
                    ));
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(PoolError::Transport(format!("read failed: {}", e))),
            }
        }
        Ok(true)
    }
}

/// Wait on many channels at once, returning the pids of the readable ones.
///
/// An empty input yields an empty result without blocking.
pub fn select<'a, I>(channels: I, timeout: Duration) -> Result<Vec<Pid>>
where
    I: IntoIterator<Item = &'a Channel>,
{
    let channels: Vec<&Channel> = channels.into_iter().collect();
    if channels.is_empty() {
        return Ok(Vec::new());
    }

    let mut fds: Vec<PollFd> = channels
        .iter()
        .map(|c| PollFd::new(c.stream.as_fd(), READABLE))
        .collect();
    poll_retrying(&mut fds, timeout)?;

    let mut hits = Vec::new();
    for (fd, channel) in fds.iter().zip(&channels) {
        if let Some(revents) = fd.revents()
            && revents.intersects(READABLE)
        {
            hits.push(channel.pid);
        }
    }
    Ok(hits)
}

/// poll(2) with a single transparent retry when a signal interrupts the
/// wait. A second interruption surfaces as zero ready descriptors.
fn poll_retrying(fds: &mut [PollFd], timeout: Duration) -> Result<usize> {
    let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
    let timeout = PollTimeout::try_from(millis)
        .map_err(|e| PoolError::Transport(format!("invalid poll timeout: {}", e)))?;

    match poll(fds, timeout) {
        Ok(n) => Ok(n as usize),
        Err(nix::errno::Errno::EINTR) => match poll(fds, timeout) {
            Ok(n) => Ok(n as usize),
            Err(nix::errno::Errno::EINTR) => Ok(0),
            Err(e) => Err(PoolError::Transport(format!("poll failed: {}", e))),
        },
        Err(e) => Err(PoolError::Transport(format!("poll failed: {}", e))),
    }
}
