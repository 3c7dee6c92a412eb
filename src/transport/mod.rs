//! Transport layer: how packets leave an output port.
//!
//! An [`OutputPort`](crate::port::OutputPort) talks to each connection
//! through a boxed [`OutputTransport`]. Concrete transports are produced
//! by negotiation (see [`negotiation`]): a same-process connection gets a
//! direct port-to-port transport, a same-host connection gets shared
//! memory with a named-pipe control channel, and everything else falls
//! back to pushing serialized packets through the remote endpoint.

use async_trait::async_trait;

use crate::error::Result;
use crate::sri::StreamDescriptor;
use crate::types::{Element, PrecisionTime, SampleBuffer};

pub mod chunk;
pub mod endpoint;
pub mod local;
pub mod negotiation;
pub mod remote;
#[cfg(unix)]
pub mod shm;

pub use chunk::ChunkedTransport;
pub use endpoint::{PortEndpoint, PropertyMap, RemoteEndpoint};
pub use negotiation::{
    ConnectionState, LocalTransportFactory, RemoteTransportFactory, TransportFactory,
    TransportRegistry,
};

/// One packet handed to a transport for delivery.
#[derive(Debug)]
pub struct OutPacket<'a, T: Element> {
    pub data: SampleBuffer<T>,
    pub time: PrecisionTime,
    pub eos: bool,
    pub stream_id: &'a str,
    pub sri: &'a StreamDescriptor,
}

/// Producer-side delivery mechanism for one connection.
///
/// Implementations use interior mutability; the port serializes calls
/// per connection but may hold several transports at once.
#[async_trait]
pub trait OutputTransport<T: Element>: Send + Sync {
    /// Short transport kind tag used in logs ("local", "shm", "remote").
    fn kind(&self) -> &'static str;

    /// Largest payload this transport moves in one unit, in scalars.
    /// `None` means unbounded; `Some` makes the port wrap the transport
    /// in a [`ChunkedTransport`].
    fn max_payload_scalars(&self) -> Option<usize> {
        None
    }

    /// Deliver a descriptor announcement ahead of the data it describes.
    async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()>;

    /// Deliver one packet.
    async fn send_packet(&self, packet: OutPacket<'_, T>) -> Result<()>;

    /// Tear the connection down. Idempotent.
    async fn close(&self) -> Result<()>;
}
