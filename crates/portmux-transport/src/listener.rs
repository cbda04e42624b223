use std::net::IpAddr;

use crate::error::Result;
#[cfg(unix)]
use crate::pipe::PipeListener;
use crate::tcp::TcpEndpoint;
use crate::traits::EndpointStream;

/// A listener for either transport.
///
/// Forwarders accept carriers and local connections through this type so that
/// the accept loop does not care which transport is configured.
pub enum EndpointListener {
    Tcp(TcpEndpoint),
    #[cfg(unix)]
    Pipe(PipeListener),
}

impl EndpointListener {
    /// Accept one connection. The source IP is known for TCP only.
    pub fn accept(&self) -> Result<(EndpointStream, Option<IpAddr>)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept()?;
                Ok((stream, Some(peer.ip())))
            }
            #[cfg(unix)]
            Self::Pipe(listener) => Ok((listener.accept()?, None)),
        }
    }

    /// Switch between blocking and nonblocking accepts.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            Self::Tcp(listener) => listener.set_nonblocking(nonblocking),
            #[cfg(unix)]
            Self::Pipe(listener) => listener.set_nonblocking(nonblocking),
        }
    }

    /// Human-readable description of the bound endpoint.
    pub fn describe(&self) -> String {
        match self {
            Self::Tcp(listener) => format!("tcp:{}", listener.local_addr()),
            #[cfg(unix)]
            Self::Pipe(listener) => format!("pipe:{}", listener.name()),
        }
    }
}

impl From<TcpEndpoint> for EndpointListener {
    fn from(listener: TcpEndpoint) -> Self {
        Self::Tcp(listener)
    }
}

#[cfg(unix)]
impl From<PipeListener> for EndpointListener {
    fn from(listener: PipeListener) -> Self {
        Self::Pipe(listener)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_tcp() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").expect("bind");
        let port = endpoint.local_addr().port();
        let listener = EndpointListener::from(endpoint);
        assert_eq!(listener.describe(), format!("tcp:127.0.0.1:{port}"));
    }

    #[test]
    fn tcp_accept_reports_source_ip() {
        let endpoint = TcpEndpoint::bind("127.0.0.1:0").expect("bind");
        let addr = endpoint.local_addr().to_string();
        let listener = EndpointListener::from(endpoint);

        let client = std::thread::spawn(move || TcpEndpoint::connect(&addr).expect("connect"));
        let (_stream, source) = listener.accept().expect("accept");
        assert_eq!(source, Some(IpAddr::from([127, 0, 0, 1])));
        drop(client.join().expect("client thread should not panic"));
    }
}
