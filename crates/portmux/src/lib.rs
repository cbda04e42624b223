//! Forward many TCP ports and local pipes over one multiplexed carrier.
//!
//! A client agent accepts local connections and tunnels them, interleaved as
//! frames, over a single carrier connection to a server agent, which dials the
//! real target for each of them.
//!
//! # Crate Structure
//!
//! - [`transport`]: the `Duplex` stream contract, TCP and local-pipe endpoints
//! - [`queue`]: handoff queue, throttle and the queue-backed byte stream
//! - [`frame`]: the frame codec and the carrier target preamble
//! - [`tunnel`]: sessions, pumps, admission control and the two forwarders

/// Re-export transport types.
pub mod transport {
    pub use portmux_transport::*;
}

/// Re-export queue types.
pub mod queue {
    pub use portmux_queue::*;
}

/// Re-export frame types.
pub mod frame {
    pub use portmux_frame::*;
}

/// Re-export tunnel types.
pub mod tunnel {
    pub use portmux_tunnel::*;
}
