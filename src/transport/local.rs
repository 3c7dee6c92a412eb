//! Direct port-to-port transport for same-process connections.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::port::InputPort;
use crate::sri::StreamDescriptor;
use crate::transport::{OutPacket, OutputTransport};
use crate::types::Element;

/// Hands buffers straight to the consumer's port queue. Buffers are
/// reference counted, so no copy happens on this path.
pub struct LocalTransport<T: Element> {
    connection_id: String,
    port: Arc<InputPort<T>>,
}

impl<T: Element> LocalTransport<T> {
    pub fn new(connection_id: impl Into<String>, port: Arc<InputPort<T>>) -> Self {
        LocalTransport { connection_id: connection_id.into(), port }
    }
}

#[async_trait]
impl<T: Element> OutputTransport<T> for LocalTransport<T> {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()> {
        self.port.push_sri(sri);
        Ok(())
    }

    async fn send_packet(&self, packet: OutPacket<'_, T>) -> Result<()> {
        tracing::trace!(connection = %self.connection_id, stream = %packet.stream_id,
                        scalars = packet.data.len(), "local delivery");
        self.port.queue_packet(packet.data, packet.time, packet.eos, packet.stream_id).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
