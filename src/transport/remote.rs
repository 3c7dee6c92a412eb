//! Serialized fallback transport: push packets through the endpoint.
//!
//! Used whenever no better path exists. Calls are bounded by a timeout
//! so a stuck consumer cannot wedge the producer's send loop, and the
//! payload per call is capped so oversized writes get chunked upstream.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, StreamError};
use crate::sri::StreamDescriptor;
use crate::transport::endpoint::RemoteEndpoint;
use crate::transport::{OutPacket, OutputTransport};
use crate::types::Element;

/// Default cap on one serialized call's payload, in bytes.
pub const DEFAULT_MTU_BYTES: usize = 8 * 1024 * 1024;

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct RemoteTransport<T: Element> {
    connection_id: String,
    endpoint: Arc<dyn RemoteEndpoint<T>>,
    call_timeout: Duration,
    mtu_bytes: usize,
}

impl<T: Element> RemoteTransport<T> {
    pub fn new(connection_id: impl Into<String>, endpoint: Arc<dyn RemoteEndpoint<T>>) -> Self {
        RemoteTransport {
            connection_id: connection_id.into(),
            endpoint,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            mtu_bytes: DEFAULT_MTU_BYTES,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_mtu_bytes(mut self, mtu: usize) -> Self {
        self.mtu_bytes = mtu;
        self
    }

    async fn call<F>(&self, operation: &str, fut: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(|err| StreamError::Transport {
                connection_id: self.connection_id.clone(),
                reason: format!("{operation} failed"),
                source: Some(Box::new(err)),
            }),
            Err(_) => Err(StreamError::Timeout { duration: self.call_timeout }),
        }
    }
}

#[async_trait]
impl<T: Element> OutputTransport<T> for RemoteTransport<T> {
    fn kind(&self) -> &'static str {
        "remote"
    }

    fn max_payload_scalars(&self) -> Option<usize> {
        Some((self.mtu_bytes / std::mem::size_of::<T>()).max(1))
    }

    async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()> {
        self.call("push_sri", self.endpoint.push_sri(sri)).await
    }

    async fn send_packet(&self, packet: OutPacket<'_, T>) -> Result<()> {
        // Serialization copies out of the source buffer here
        let data = packet.data.as_slice().to_vec();
        self.call(
            "push_packet",
            self.endpoint.push_packet(data, packet.time, packet.eos, packet.stream_id),
        )
        .await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
