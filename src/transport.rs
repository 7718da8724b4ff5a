//! Request/reply framing over a duplex byte stream
//!
//! The link carries no end-of-message marker, so a reply is considered
//! complete once the stream has stayed quiet for a configured number of
//! idle intervals. The wait goes through [`IdleClock`] so tests can run the
//! loop without sleeping.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::logger::{Logger, NoopLogger};
use crate::protocol::{timeouts, Request};
use crate::protocol_core::build_frame;

/// A duplex byte stream that can report how many bytes are readable right now
pub trait Transport: Read + Write {
    /// Bytes that a read would return without blocking
    fn bytes_available(&mut self) -> io::Result<usize>;

    /// Release the underlying stream. Later reads and writes must fail.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn bytes_available(&mut self) -> io::Result<usize> {
        (**self).bytes_available()
    }
    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

/// Source of the idle wait between reads
pub trait IdleClock: Send {
    fn sleep(&mut self, d: Duration);
}

pub struct SystemClock;

impl IdleClock for SystemClock {
    fn sleep(&mut self, d: Duration) {
        std::thread::sleep(d);
    }
}

/// Tuning of the receive loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub interval: Duration,
    pub max_idle_retries: u32,
    pub read_chunk: usize,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(timeouts::IDLE_WAIT_MS),
            max_idle_retries: timeouts::IDLE_RETRIES,
            read_chunk: timeouts::READ_CHUNK,
        }
    }
}

/// Half-duplex framer: every `send` must be answered by one `receive`
pub struct Framer<T: Transport> {
    transport: T,
    policy: IdlePolicy,
    clock: Box<dyn IdleClock>,
    logger: Arc<dyn Logger>,
    awaiting_reply: bool,
    closed: bool,
}

impl<T: Transport> Framer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            policy: IdlePolicy::default(),
            clock: Box::new(SystemClock),
            logger: Arc::new(NoopLogger),
            awaiting_reply: false,
            closed: false,
        }
    }

    pub fn with_policy(mut self, policy: IdlePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Box<dyn IdleClock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn logger(&self) -> &Arc<dyn Logger> {
        &self.logger
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Frame and write one command, then flush
    pub fn send(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        if self.closed {
            return Err(Error::closed("problem sending data: connection closed"));
        }
        if self.awaiting_reply {
            return Err(Error::protocol(
                "previous reply has not been received; requests cannot be pipelined",
            ));
        }
        let frame = build_frame(opcode, payload)?;
        self.logger.sent(&frame);
        self.transport
            .write_all(&frame)
            .and_then(|_| self.transport.flush())
            .map_err(|e| Error::transport("problem sending data", e))?;
        self.awaiting_reply = true;
        Ok(())
    }

    /// Accumulate one reply until the stream stays quiet
    pub fn receive(&mut self) -> Result<Vec<u8>> {
        self.awaiting_reply = false;
        if self.closed {
            return Err(Error::closed("problem receiving data: connection closed"));
        }
        let mut buf = vec![0u8; self.policy.read_chunk.max(1)];
        let mut received = Vec::new();
        loop {
            let n = loop {
                match self.transport.read(&mut buf) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(Error::transport("problem receiving data", e)),
                }
            };
            if n == 0 {
                return Err(Error::closed(if received.is_empty() {
                    "end of stream reached before any reply data"
                } else {
                    "end of stream reached mid-reply"
                }));
            }
            received.extend_from_slice(&buf[..n]);
            if !self.wait_for_more()? {
                break;
            }
        }
        self.logger.received(&received);
        Ok(received)
    }

    /// Send a request and read its reply
    pub fn exchange(&mut self, request: &Request) -> Result<Vec<u8>> {
        self.send(request.opcode, &request.payload)?;
        self.receive()
    }

    /// Close the transport. Only the first call reaches the stream.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.transport
            .close()
            .map_err(|e| Error::transport("unable to close connection", e))
    }

    // True when more bytes showed up within the idle allowance
    fn wait_for_more(&mut self) -> Result<bool> {
        let mut waits = 0;
        loop {
            let available = self
                .transport
                .bytes_available()
                .map_err(|e| Error::transport("problem polling stream", e))?;
            if available > 0 {
                return Ok(true);
            }
            if waits >= self.policy.max_idle_retries {
                return Ok(false);
            }
            self.clock.sleep(self.policy.interval);
            waits += 1;
        }
    }
}

impl<T: Transport> Drop for Framer<T> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Transport over any stream backed by a Unix file descriptor: an RFCOMM
/// tty (`/dev/rfcomm0`) or a TCP socket to a phone emulator.
#[cfg(unix)]
pub mod fd {
    use super::Transport;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::net::TcpStream;
    use std::os::fd::AsRawFd;
    use std::path::Path;

    pub struct FdTransport<S> {
        inner: Option<S>,
    }

    fn not_connected() -> io::Error {
        io::Error::new(io::ErrorKind::NotConnected, "stream closed")
    }

    impl<S: Read + Write + AsRawFd> FdTransport<S> {
        pub fn new(inner: S) -> Self {
            Self { inner: Some(inner) }
        }

        fn stream(&mut self) -> io::Result<&mut S> {
            self.inner.as_mut().ok_or_else(not_connected)
        }
    }

    impl FdTransport<File> {
        /// Open a bound RFCOMM device node and switch it to raw mode
        pub fn open_device(path: &Path) -> io::Result<Self> {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            set_raw_mode(&file)?;
            Ok(Self::new(file))
        }
    }

    impl FdTransport<TcpStream> {
        pub fn connect_tcp(addr: &str) -> io::Result<Self> {
            let stream = TcpStream::connect(addr)?;
            stream.set_nodelay(true)?;
            Ok(Self::new(stream))
        }

        /// A second handle whose `shutdown` unblocks an in-flight read
        pub fn interrupt_handle(&self) -> io::Result<TcpStream> {
            self.inner.as_ref().ok_or_else(not_connected)?.try_clone()
        }
    }

    fn set_raw_mode(file: &File) -> io::Result<()> {
        let fd = file.as_raw_fd();
        unsafe {
            if libc::isatty(fd) != 1 {
                return Ok(());
            }
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::cfmakeraw(&mut tio);
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    impl<S: Read + Write + AsRawFd> Read for FdTransport<S> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.stream()?.read(buf)
        }
    }

    impl<S: Read + Write + AsRawFd> Write for FdTransport<S> {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.stream()?.write(buf)
        }
        fn flush(&mut self) -> io::Result<()> {
            self.stream()?.flush()
        }
    }

    impl<S: Read + Write + AsRawFd> Transport for FdTransport<S> {
        fn bytes_available(&mut self) -> io::Result<usize> {
            let fd = self.stream()?.as_raw_fd();
            let mut avail: libc::c_int = 0;
            let r = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut avail as *mut libc::c_int) };
            if r < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(avail.max(0) as usize)
        }

        fn close(&mut self) -> io::Result<()> {
            match self.inner.take() {
                Some(stream) => {
                    drop(stream);
                    Ok(())
                }
                None => Err(not_connected()),
            }
        }
    }
}
