use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::EndpointStream;

/// TCP listener for carriers and forwarded ports.
pub struct TcpEndpoint {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpEndpoint {
    /// Bind and listen on `address` (`host:port`; port 0 picks a free port).
    pub fn bind(address: &str) -> Result<Self> {
        let listener = TcpListener::bind(address).map_err(|e| TransportError::Bind {
            address: address.to_string(),
            source: e,
        })?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept an incoming connection.
    ///
    /// Accepted streams are blocking with `TCP_NODELAY` set.
    pub fn accept(&self) -> Result<(EndpointStream, SocketAddr)> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok((EndpointStream::from_tcp(stream), peer))
    }

    /// Switch the listener between blocking and nonblocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Connect to `address` with `TCP_NODELAY`.
    pub fn connect(address: &str) -> Result<EndpointStream> {
        let stream = TcpStream::connect(address).map_err(|e| TransportError::Connect {
            address: address.to_string(),
            source: e,
        })?;
        stream.set_nodelay(true)?;
        debug!(address, "connected over tcp");
        Ok(EndpointStream::from_tcp(stream))
    }

    /// Connect to `address`, giving up on each resolved address after `timeout`.
    pub fn connect_timeout(address: &str, timeout: Duration) -> Result<EndpointStream> {
        let connect_err = |source: std::io::Error| TransportError::Connect {
            address: address.to_string(),
            source,
        };
        let mut last_err = None;
        for addr in address.to_socket_addrs().map_err(connect_err)? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    debug!(address, %addr, "connected over tcp");
                    return Ok(EndpointStream::from_tcp(stream));
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(connect_err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "address resolved to nothing",
            )
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn bind_accept_connect() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").expect("bind should succeed");
        let addr = endpoint.local_addr().to_string();

        let handle = std::thread::spawn(move || {
            let mut client = TcpEndpoint::connect(&addr).expect("connect");
            client.write_all(b"carrier").expect("write");
        });

        let (mut server, peer) = endpoint.accept().expect("accept");
        assert!(peer.ip().is_loopback());
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).expect("read");
        assert_eq!(&buf, b"carrier");
        handle.join().expect("client thread should not panic");
    }

    #[test]
    fn connect_refused_reports_address() {
        // Bind then drop to get a port that is very likely closed.
        let port = TcpEndpoint::bind("127.0.0.1:0")
            .expect("bind")
            .local_addr()
            .port();
        let address = format!("127.0.0.1:{port}");
        let err = TcpEndpoint::connect_timeout(&address, Duration::from_millis(500))
            .expect_err("nothing listens on the port");
        assert!(err.to_string().contains(&address));
    }

    #[test]
    fn nonblocking_accept_would_block() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").expect("bind");
        endpoint.set_nonblocking(true).expect("nonblocking");
        match endpoint.accept() {
            Err(TransportError::Accept(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock)
            }
            other => panic!("expected WouldBlock, got {other:?}"),
        }
    }
}
