//! The two forwarding agents.
//!
//! - [`server`]: accepts carriers and dials admitted targets
//! - [`client`]: accepts local connections and tunnels them over one carrier

pub mod client;
pub mod server;

use std::io::ErrorKind;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use portmux_transport::{EndpointListener, EndpointStream, TransportError};
use tracing::{debug, warn};

use crate::error::Result;

/// How often an idle accept loop checks for a stop request.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Run `on_accept` for every connection accepted on `listener` until `stop`
/// is set.
///
/// The listener is switched to nonblocking accepts and polled, so setting
/// `stop` ends the loop within one poll interval. The listener is dropped
/// (and a pipe socket removed) when the loop ends.
pub(crate) fn spawn_accept_loop<F>(
    thread_name: String,
    listener: EndpointListener,
    stop: Arc<AtomicBool>,
    poll_interval: Duration,
    mut on_accept: F,
) -> Result<JoinHandle<()>>
where
    F: FnMut(EndpointStream, Option<IpAddr>) + Send + 'static,
{
    listener.set_nonblocking(true)?;
    let handle = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || {
            let endpoint = listener.describe();
            while !stop.load(Ordering::SeqCst) {
                match listener.accept() {
                    Ok((stream, source)) => on_accept(stream, source),
                    Err(TransportError::Accept(err))
                        if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) =>
                    {
                        std::thread::sleep(poll_interval);
                    }
                    Err(err) => {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(%endpoint, error = %err, "accept failed");
                        std::thread::sleep(poll_interval);
                    }
                }
            }
            debug!(%endpoint, "accept loop stopped");
        })?;
    Ok(handle)
}
