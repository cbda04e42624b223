//! Multiplexed forwarding over a single carrier.
//!
//! This is the layer that turns frames into forwarded connections:
//! - [`admission`]: which targets and sources are permitted
//! - [`connection`]: logical connections and the per-session correlation table
//! - [`pump`]: demux (carrier to connections), mux (connection to carrier)
//!   and plain copy pumps
//! - [`session`]: one carrier with its pumps and connections
//! - [`forwarder`]: the server and client agents

pub mod admission;
pub mod connection;
pub mod error;
pub mod forwarder;
pub mod pump;
pub mod session;

pub use admission::{
    normalize_pipe_name, Admission, AdmissionControl, AllowList, Firewall, IpRange,
};
pub use connection::{ConnectionTable, LogicalConnection};
pub use error::{Result, TunnelError};
pub use forwarder::client::{
    CarrierConnector, ClientConfig, ClientForwarder, TcpCarrierConnector,
};
#[cfg(unix)]
pub use forwarder::client::PipeCarrierConnector;
pub use forwarder::server::{ServerConfig, ServerForwarder, TargetDialer};
pub use pump::{ConnectionFactory, CopyPump, CorrelateOnly, DemuxExit, DemuxPump, MuxPump};
pub use session::{Session, SessionConfig, SessionExit};

pub use portmux_frame::{ConnectionId, ConnectionTarget};
