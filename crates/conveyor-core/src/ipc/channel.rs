//! Length-prefixed message transport between the coordinator and one worker.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! msg_type (u8) | sender_id (i32) | receiver_id (i32) | data_size (u64) | data
//! ```
//!
//! Both endpoints are configured non-blocking. Receives poll at a 10 ms
//! interval so a worker can notice a shutdown request promptly; the write
//! side is mutex-guarded so multiple coordinator threads can safely send to
//! the same worker.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// Size of the fixed frame header.
pub const FRAME_HEADER_LEN: usize = 17;

/// Interval between read attempts on an empty channel.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Message types carried over a stream channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    ProcessBatch = 1,
    BatchResult = 2,
    HealthCheck = 3,
    Shutdown = 4,
}

impl MsgType {
    fn from_wire(value: u8) -> Result<Self> {
        match value {
            1 => Ok(MsgType::ProcessBatch),
            2 => Ok(MsgType::BatchResult),
            3 => Ok(MsgType::HealthCheck),
            4 => Ok(MsgType::Shutdown),
            other => Err(Error::Transport(format!("unknown message type {other}"))),
        }
    }
}

/// Fixed header of every frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub msg_type: MsgType,
    /// On requests this carries the call epoch; replies echo it back.
    pub sender_id: i32,
    pub receiver_id: i32,
    pub data_size: u64,
}

impl FrameHeader {
    pub fn new(msg_type: MsgType, sender_id: i32, receiver_id: i32, data_size: u64) -> Self {
        FrameHeader {
            msg_type,
            sender_id,
            receiver_id,
            data_size,
        }
    }

    fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0] = self.msg_type as u8;
        buf[1..5].copy_from_slice(&self.sender_id.to_le_bytes());
        buf[5..9].copy_from_slice(&self.receiver_id.to_le_bytes());
        buf[9..17].copy_from_slice(&self.data_size.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8; FRAME_HEADER_LEN]) -> Result<Self> {
        Ok(FrameHeader {
            msg_type: MsgType::from_wire(buf[0])?,
            sender_id: i32::from_le_bytes(buf[1..5].try_into().unwrap()),
            receiver_id: i32::from_le_bytes(buf[5..9].try_into().unwrap()),
            data_size: u64::from_le_bytes(buf[9..17].try_into().unwrap()),
        })
    }
}

/// One side of a byte-stream pair between two processes.
///
/// A channel may own only a read end (response side) or only a write end
/// (request side); the worker holds the mirror image over its stdio fds.
pub struct StreamChannel {
    read_fd: Option<RawFd>,
    write_fd: Option<RawFd>,
    write_lock: Mutex<()>,
    owns_fds: bool,
}

// The fds are plain integers and all mutation goes through the write lock
// or the kernel.
unsafe impl Send for StreamChannel {}
unsafe impl Sync for StreamChannel {}

impl StreamChannel {
    /// Wrap existing descriptors, taking ownership (they are closed on drop).
    pub fn from_fds(read_fd: Option<RawFd>, write_fd: Option<RawFd>) -> Result<Self> {
        let channel = StreamChannel {
            read_fd,
            write_fd,
            write_lock: Mutex::new(()),
            owns_fds: true,
        };
        if let Some(fd) = read_fd {
            set_nonblocking(fd)?;
        }
        if let Some(fd) = write_fd {
            set_nonblocking(fd)?;
        }
        Ok(channel)
    }

    /// Wrap descriptors that belong to the process (stdio); they are left
    /// open on drop.
    pub fn from_borrowed_fds(read_fd: Option<RawFd>, write_fd: Option<RawFd>) -> Result<Self> {
        let mut channel = Self::from_fds(read_fd, write_fd)?;
        channel.owns_fds = false;
        Ok(channel)
    }

    pub fn reader(fd: RawFd) -> Result<Self> {
        Self::from_fds(Some(fd), None)
    }

    pub fn writer(fd: RawFd) -> Result<Self> {
        Self::from_fds(None, Some(fd))
    }

    /// Send one frame. Serialized against concurrent senders; a full pipe
    /// fails immediately with a transport error, senders never block.
    pub fn send_frame(&self, header: FrameHeader, payload: Option<&[u8]>) -> Result<()> {
        let fd = self
            .write_fd
            .ok_or_else(|| Error::Transport("channel has no write end".to_string()))?;

        let payload = payload.unwrap_or(&[]);
        debug_assert_eq!(header.data_size as usize, payload.len());

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(payload);

        let _guard = self.write_lock.lock().unwrap();
        write_full(fd, &frame)
    }

    /// Receive one frame.
    ///
    /// `deadline` bounds the wait for the frame to begin; `None` waits until
    /// data arrives or the peer closes the stream. Once the first header
    /// byte is in, the rest of the frame is read to completion (frames are
    /// small and written in one piece).
    pub fn recv_frame(
        &self,
        max_bytes: usize,
        deadline: Option<Instant>,
    ) -> Result<(FrameHeader, Vec<u8>)> {
        let fd = self
            .read_fd
            .ok_or_else(|| Error::Transport("channel has no read end".to_string()))?;

        let mut header_buf = [0u8; FRAME_HEADER_LEN];
        read_full(fd, &mut header_buf, deadline)?;
        let header = FrameHeader::from_bytes(&header_buf)?;

        if (header.data_size as usize) > max_bytes.saturating_sub(FRAME_HEADER_LEN) {
            return Err(Error::Transport(format!(
                "frame payload of {} bytes exceeds limit of {}",
                header.data_size,
                max_bytes.saturating_sub(FRAME_HEADER_LEN)
            )));
        }

        let mut payload = vec![0u8; header.data_size as usize];
        if !payload.is_empty() {
            read_full(fd, &mut payload, None)?;
        }

        Ok((header, payload))
    }
}

impl Drop for StreamChannel {
    fn drop(&mut self) {
        if !self.owns_fds {
            return;
        }
        for fd in [self.read_fd, self.write_fd].into_iter().flatten() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Transport(format!(
                "failed to configure fd {fd} non-blocking: {}",
                io::Error::last_os_error()
            )));
        }
    }
    Ok(())
}

fn write_full(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let written = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if written > 0 {
            data = &data[written as usize..];
            continue;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            // Frames fit well inside the pipe buffer, so a full pipe means
            // the peer stopped draining; that is a failure, not a reason
            // for the coordinator to wait.
            io::ErrorKind::WouldBlock => {
                return Err(Error::Transport("channel full, peer not draining".to_string()));
            }
            _ => return Err(Error::Transport(format!("write failed: {err}"))),
        }
    }
    Ok(())
}

fn read_full(fd: RawFd, buf: &mut [u8], deadline: Option<Instant>) -> Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = unsafe {
            libc::read(
                fd,
                buf[filled..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - filled,
            )
        };
        if n > 0 {
            filled += n as usize;
            continue;
        }
        if n == 0 {
            return Err(Error::Transport("stream closed by peer".to_string()));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => {
                // The deadline only gates the wait for the frame to start;
                // a frame in flight is drained to completion.
                if filled == 0 {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Err(Error::Timeout);
                        }
                    }
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            _ => return Err(Error::Transport(format!("read failed: {err}"))),
        }
    }
    Ok(())
}
