//! Target preamble: the one-time string at the start of every carrier.
//!
//! The client names the service all logical connections of the carrier go
//! to, as `tcp:<port>` or `np:<pipe name>`. On the wire the string is UTF-8
//! preceded by its byte length as a 7-bit variable-length integer (low groups
//! first, high bit set on every byte but the last).

use std::fmt;
use std::io::{ErrorKind, Read, Write};
use std::str::FromStr;

use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Longest accepted preamble string, in bytes.
pub const MAX_PREAMBLE_LEN: usize = 1024;

/// Where the server should send a carrier's logical connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionTarget {
    /// A TCP port on the server's target host.
    Tcp(u16),
    /// A local pipe on the server.
    Pipe(String),
}

impl ConnectionTarget {
    /// Short transport name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tcp(_) => "tcp",
            Self::Pipe(_) => "pipe",
        }
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(port) => write!(f, "tcp:{port}"),
            Self::Pipe(name) => write!(f, "np:{name}"),
        }
    }
}

impl FromStr for ConnectionTarget {
    type Err = FrameError;

    /// Parse `tcp:<port>` or `np:<name>`; prefixes are case-insensitive.
    fn from_str(s: &str) -> Result<Self> {
        if let Some(port) = strip_prefix_ignore_case(s, "tcp:") {
            return port
                .trim()
                .parse::<u16>()
                .map(Self::Tcp)
                .map_err(|_| FrameError::InvalidPreamble(format!("invalid tcp port in '{s}'")));
        }
        if let Some(name) = strip_prefix_ignore_case(s, "np:") {
            if name.is_empty() {
                return Err(FrameError::InvalidPreamble("empty pipe name".to_string()));
            }
            return Ok(Self::Pipe(name.to_string()));
        }
        Err(FrameError::InvalidPreamble(format!(
            "unknown target '{s}' (expected tcp:<port> or np:<name>)"
        )))
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

/// Write the target preamble for a carrier and flush.
pub fn write_target_preamble<W: Write>(writer: &mut W, target: &ConnectionTarget) -> Result<()> {
    let text = target.to_string();
    let mut buf = BytesMut::with_capacity(text.len() + 5);
    encode_preamble_string(&text, &mut buf)?;
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read and parse the target preamble at the start of a carrier.
///
/// Reads exactly the preamble bytes, nothing beyond.
pub fn read_target_preamble<R: Read>(reader: &mut R) -> Result<ConnectionTarget> {
    read_preamble_string(reader)?.parse()
}

/// Encode a length-prefixed preamble string.
pub fn encode_preamble_string(text: &str, dst: &mut BytesMut) -> Result<()> {
    if text.len() > MAX_PREAMBLE_LEN {
        return Err(FrameError::PayloadTooLarge {
            size: text.len(),
            max: MAX_PREAMBLE_LEN,
        });
    }
    let mut len = text.len() as u32;
    while len >= 0x80 {
        dst.put_u8((len as u8 & 0x7F) | 0x80);
        len >>= 7;
    }
    dst.put_u8(len as u8);
    dst.put_slice(text.as_bytes());
    Ok(())
}

/// Read a length-prefixed preamble string.
pub fn read_preamble_string<R: Read>(reader: &mut R) -> Result<String> {
    let mut len: usize = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        read_exact_preamble(reader, &mut byte)?;
        len |= ((byte[0] & 0x7F) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(FrameError::InvalidPreamble(
                "length prefix is too long".to_string(),
            ));
        }
    }

    if len > MAX_PREAMBLE_LEN {
        return Err(FrameError::InvalidPreamble(format!(
            "preamble of {len} bytes exceeds {MAX_PREAMBLE_LEN}"
        )));
    }

    let mut text = vec![0u8; len];
    read_exact_preamble(reader, &mut text)?;
    String::from_utf8(text)
        .map_err(|_| FrameError::InvalidPreamble("preamble is not valid UTF-8".to_string()))
}

fn read_exact_preamble<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<()> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        ErrorKind::UnexpectedEof => {
            FrameError::InvalidPreamble("carrier ended inside the preamble".to_string())
        }
        _ => FrameError::Io(err),
    })
}
