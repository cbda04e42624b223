use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpStream};
use std::time::Duration;

use crate::error::Result;

/// A connected, bidirectional byte stream.
///
/// Both the carrier and every real endpoint a logical connection proxies to
/// are `Duplex` streams. The extra operations beyond `Read + Write` are the
/// ones the pumps need: a second handle for a reader thread, half-close, and a
/// full close that unblocks I/O pending on other handles.
pub trait Duplex: Read + Write + Send {
    /// Clone the handle so that one thread can read while another writes.
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>>;

    /// Signal that no more bytes will be written (half-close).
    fn shutdown_write(&self) -> io::Result<()>;

    /// Shut down both directions.
    ///
    /// Reads pending on cloned handles return EOF or an error afterwards.
    fn close(&self) -> io::Result<()>;

    /// Remote IP address, when the stream is a network socket.
    fn peer_ip(&self) -> Option<IpAddr> {
        None
    }

    /// Set the read timeout of the underlying stream.
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let _ = timeout;
        Ok(())
    }

    /// Set the write timeout of the underlying stream.
    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        let _ = timeout;
        Ok(())
    }
}

impl Duplex for TcpStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        self.peer_addr().ok().map(|addr| addr.ip())
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_write_timeout(self, timeout)
    }
}

#[cfg(unix)]
impl Duplex for std::os::unix::net::UnixStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        Ok(Box::new(self.try_clone()?))
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_read_timeout(self, timeout)
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        std::os::unix::net::UnixStream::set_write_timeout(self, timeout)
    }
}

/// A connected endpoint stream: a TCP socket or a local pipe.
///
/// This is the concrete stream type returned by the listeners and connectors
/// in this crate.
pub struct EndpointStream {
    inner: EndpointStreamInner,
}

enum EndpointStreamInner {
    Tcp(TcpStream),
    #[cfg(unix)]
    Pipe(std::os::unix::net::UnixStream),
}

impl Read for EndpointStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            EndpointStreamInner::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => stream.read(buf),
        }
    }
}

impl Write for EndpointStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.inner {
            EndpointStreamInner::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.inner {
            EndpointStreamInner::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => stream.flush(),
        }
    }
}

impl EndpointStream {
    /// Wrap a connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: EndpointStreamInner::Tcp(stream),
        }
    }

    /// Wrap a connected local pipe stream.
    #[cfg(unix)]
    pub fn from_pipe(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: EndpointStreamInner::Pipe(stream),
        }
    }

    /// A connected pair of local pipe streams.
    #[cfg(unix)]
    pub fn pair() -> Result<(Self, Self)> {
        let (left, right) = std::os::unix::net::UnixStream::pair()?;
        Ok((Self::from_pipe(left), Self::from_pipe(right)))
    }

    /// Short transport name for diagnostics.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            EndpointStreamInner::Tcp(_) => "tcp",
            #[cfg(unix)]
            EndpointStreamInner::Pipe(_) => "pipe",
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            EndpointStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => Ok(Self::from_pipe(stream.try_clone()?)),
        }
    }

    fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match &self.inner {
            EndpointStreamInner::Tcp(stream) => stream.shutdown(how),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => stream.shutdown(how),
        }
    }
}

impl Duplex for EndpointStream {
    fn try_clone_duplex(&self) -> io::Result<Box<dyn Duplex>> {
        match &self.inner {
            EndpointStreamInner::Tcp(stream) => Ok(Box::new(Self::from_tcp(stream.try_clone()?))),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => {
                Ok(Box::new(Self::from_pipe(stream.try_clone()?)))
            }
        }
    }

    fn shutdown_write(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Write)
    }

    fn close(&self) -> io::Result<()> {
        self.shutdown(Shutdown::Both)
    }

    fn peer_ip(&self) -> Option<IpAddr> {
        match &self.inner {
            EndpointStreamInner::Tcp(stream) => stream.peer_addr().ok().map(|addr| addr.ip()),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(_) => None,
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            EndpointStreamInner::Tcp(stream) => stream.set_read_timeout(timeout),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => stream.set_read_timeout(timeout),
        }
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        match &self.inner {
            EndpointStreamInner::Tcp(stream) => stream.set_write_timeout(timeout),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(stream) => stream.set_write_timeout(timeout),
        }
    }
}

impl std::fmt::Debug for EndpointStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            EndpointStreamInner::Tcp(stream) => f
                .debug_struct("EndpointStream")
                .field("type", &"tcp")
                .field("peer", &stream.peer_addr().ok())
                .finish(),
            #[cfg(unix)]
            EndpointStreamInner::Pipe(_) => f
                .debug_struct("EndpointStream")
                .field("type", &"pipe")
                .finish(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn pair_roundtrip_and_kind() {
        let (mut left, mut right) = EndpointStream::pair().unwrap();
        assert_eq!(left.kind(), "pipe");

        left.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn shutdown_write_gives_peer_eof() {
        let (left, mut right) = EndpointStream::pair().unwrap();
        left.shutdown_write().unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(right.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn close_unblocks_cloned_reader() {
        let (left, _right) = EndpointStream::pair().unwrap();
        let mut reader = left.try_clone_duplex().unwrap();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            reader.read(&mut buf)
        });

        std::thread::sleep(Duration::from_millis(20));
        left.close().unwrap();

        let read = handle.join().unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[test]
    fn tcp_peer_ip_is_reported() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let server = EndpointStream::from_tcp(server);
        assert_eq!(server.kind(), "tcp");
        assert_eq!(
            server.peer_ip(),
            Some(IpAddr::from([127, 0, 0, 1])),
            "peer ip should be loopback"
        );
        drop(client);
    }
}
