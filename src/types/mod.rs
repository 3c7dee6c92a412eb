//! Core data types for the streaming engine.

mod buffer;
mod element;
mod time;
mod value;

pub use buffer::SampleBuffer;
pub use element::{Bit, Element, ElementKind, FileByte, Utf8Byte};
pub use time::{PrecisionTime, SampleTimestamp};
pub use value::Value;

pub(crate) use element::{bytes_of, vec_from_bytes};

use std::time::Duration;

/// Uniform wait policy for blocking APIs.
///
/// Every waiting call in the engine (`get_packet`, `poll_streams`, sized
/// reads) takes one of these rather than a sentinel-encoded float.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Block until data arrives or the port is stopped.
    Indefinite,
    /// Check once and return immediately.
    Poll,
    /// Block up to the given duration.
    Timeout(Duration),
}

impl Wait {
    /// Bounded waits report their deadline as an `Instant`; unbounded and
    /// poll waits have none.
    pub(crate) fn deadline(&self) -> Option<tokio::time::Instant> {
        match self {
            Wait::Indefinite | Wait::Poll => None,
            Wait::Timeout(d) => Some(tokio::time::Instant::now() + *d),
        }
    }

    pub(crate) fn is_poll(&self) -> bool {
        matches!(self, Wait::Poll)
    }
}

impl From<Duration> for Wait {
    fn from(d: Duration) -> Self {
        Wait::Timeout(d)
    }
}
