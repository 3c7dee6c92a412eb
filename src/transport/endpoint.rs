//! Consumer endpoints as seen from the producer side.
//!
//! A [`RemoteEndpoint`] is what an output port connects to: it can be
//! asked about its situation (same process? which host?), offered a
//! transport negotiation, and, as the fallback, used directly as a
//! packet sink.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, StreamError};
use crate::port::InputPort;
use crate::sri::StreamDescriptor;
use crate::types::{Element, PrecisionTime, SampleBuffer};

/// String-keyed negotiation properties exchanged between the two sides.
pub type PropertyMap = BTreeMap<String, String>;

/// Property key carrying the endpoint's host identity.
pub const PROP_HOSTNAME: &str = "hostname";

/// The consumer side of a connection, from the producer's point of view.
#[async_trait]
pub trait RemoteEndpoint<T: Element>: Send + Sync + 'static {
    /// The input port itself, when the endpoint lives in this process.
    /// Enables the direct port-to-port transport.
    fn local_port(&self) -> Option<Arc<InputPort<T>>> {
        None
    }

    /// Properties the endpoint advertises before negotiation, such as
    /// its hostname.
    fn properties(&self) -> PropertyMap {
        PropertyMap::new()
    }

    /// Offer a transport negotiation. The endpoint either sets the
    /// transport up on its side and answers with its own properties, or
    /// fails, in which case the producer tries the next candidate.
    async fn negotiate_transport(&self, kind: &str, props: &PropertyMap) -> Result<PropertyMap>;

    /// Fallback data path: deliver a descriptor announcement.
    async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()>;

    /// Fallback data path: deliver one serialized packet.
    async fn push_packet(
        &self,
        data: Vec<T>,
        time: PrecisionTime,
        eos: bool,
        stream_id: &str,
    ) -> Result<()>;
}

/// The host identity this process advertises and matches against.
pub(crate) fn local_hostname() -> String {
    #[cfg(unix)]
    {
        let mut buf = [0u8; 256];
        // SAFETY: buf is a valid writable buffer of the stated length
        let rc = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
        if rc == 0 {
            let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
            if let Ok(name) = std::str::from_utf8(&buf[..end]) {
                return name.to_string();
            }
        }
        "localhost".to_string()
    }
    #[cfg(not(unix))]
    {
        "localhost".to_string()
    }
}

/// [`RemoteEndpoint`] over an [`InputPort`] in this process.
///
/// The common case in tests and single-process deployments; it also
/// exercises every negotiated transport end to end when the direct
/// port-to-port path is disabled via [`PortEndpoint::opaque`].
pub struct PortEndpoint<T: Element> {
    port: Arc<InputPort<T>>,
    reveal_local: bool,
}

impl<T: Element> PortEndpoint<T> {
    pub fn new(port: Arc<InputPort<T>>) -> Arc<Self> {
        Arc::new(PortEndpoint { port, reveal_local: true })
    }

    /// An endpoint that hides being in-process, forcing negotiation down
    /// the shared-memory or serialized path.
    pub fn opaque(port: Arc<InputPort<T>>) -> Arc<Self> {
        Arc::new(PortEndpoint { port, reveal_local: false })
    }
}

#[async_trait]
impl<T: Element> RemoteEndpoint<T> for PortEndpoint<T> {
    fn local_port(&self) -> Option<Arc<InputPort<T>>> {
        if self.reveal_local {
            Some(Arc::clone(&self.port))
        } else {
            None
        }
    }

    fn properties(&self) -> PropertyMap {
        let mut props = PropertyMap::new();
        props.insert(PROP_HOSTNAME.to_string(), local_hostname());
        props
    }

    async fn negotiate_transport(&self, kind: &str, props: &PropertyMap) -> Result<PropertyMap> {
        match kind {
            #[cfg(unix)]
            "shm" => crate::transport::shm::accept_negotiation(Arc::clone(&self.port), props).await,
            other => Err(StreamError::negotiation(
                "",
                format!("endpoint does not support '{other}' transports"),
            )),
        }
    }

    async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()> {
        self.port.push_sri(sri);
        Ok(())
    }

    async fn push_packet(
        &self,
        data: Vec<T>,
        time: PrecisionTime,
        eos: bool,
        stream_id: &str,
    ) -> Result<()> {
        self.port.queue_packet(SampleBuffer::from_vec(data), time, eos, stream_id).await
    }
}
