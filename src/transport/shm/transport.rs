//! Shared-memory transport: zero-copy payloads, piped control messages.
//!
//! The producer writes each payload into a shared-memory allocation (or
//! reuses the allocation a shared buffer already lives in), sends a
//! reference over the control pipe, and waits for the consumer's ack.
//! The consumer maps the referenced segment and wraps the payload as a
//! [`SampleBuffer`] without copying; an allocation failure on the
//! producer side degrades that one packet to inline bytes on the pipe.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{Result, StreamError};
use crate::port::InputPort;
use crate::sri::StreamDescriptor;
use crate::transport::endpoint::{PropertyMap, RemoteEndpoint};
use crate::transport::negotiation::{same_host, shm_enabled, TransportFactory};
use crate::transport::{OutPacket, OutputTransport};
use crate::types::{bytes_of, vec_from_bytes, Element, SampleBuffer};

use super::fifo::{self, PipeChannel};
use super::heap::{HeapClient, ShmHeap};
use super::message::{
    read_message, read_status, write_message, write_status, DataHeader, WireMessage, STATUS_OK,
    STATUS_REJECTED,
};

const PROP_FIFO_IN: &str = "shm.fifo.to_acceptor";
const PROP_FIFO_OUT: &str = "shm.fifo.to_connector";

/// How long the acceptor waits for the connector's sync byte.
const HANDSHAKE_DEADLINE: std::time::Duration = std::time::Duration::from_secs(10);

/// Producer side of a negotiated shared-memory connection.
pub struct ShmOutputTransport<T: Element> {
    connection_id: String,
    heap: Arc<ShmHeap>,
    channel: Mutex<Option<PipeChannel>>,
    _marker: std::marker::PhantomData<fn() -> T>,
}

impl<T: Element> ShmOutputTransport<T> {
    pub fn new(connection_id: impl Into<String>, heap: Arc<ShmHeap>, channel: PipeChannel) -> Self {
        ShmOutputTransport {
            connection_id: connection_id.into(),
            heap,
            channel: Mutex::new(Some(channel)),
            _marker: std::marker::PhantomData,
        }
    }

    /// Build the data message, preferring a shared-memory reference.
    fn build_message(&self, packet: &OutPacket<'_, T>) -> (WireMessage, Option<Arc<super::heap::ShmBlock>>) {
        let header = DataHeader {
            stream_id: packet.stream_id.to_string(),
            scalar_count: packet.data.len() as u64,
            time: packet.time,
            eos: packet.eos,
        };

        if packet.data.is_empty() {
            return (WireMessage::DataInline { header, bytes: Vec::new() }, None);
        }

        // A buffer already backed by shared memory transfers as-is
        if let (Some((mem, window)), Some(block)) =
            (packet.data.shm_location(), packet.data.shm_block())
        {
            block.retain();
            return (
                WireMessage::DataShm { header, mem: mem.clone(), window: window as u64 },
                Some(Arc::clone(block)),
            );
        }

        let bytes = bytes_of(packet.data.as_slice());
        match self.heap.allocate(bytes.len()) {
            Ok(block) => {
                block.copy_from_slice(bytes);
                block.retain();
                let mem = block.memory_ref().clone();
                (WireMessage::DataShm { header, mem, window: 0 }, Some(block))
            }
            Err(err) => {
                warn!(connection = %self.connection_id, error = %err,
                      "shared allocation failed, sending inline");
                (WireMessage::DataInline { header, bytes: bytes.to_vec() }, None)
            }
        }
    }

    async fn exchange(&self, message: &WireMessage) -> Result<()> {
        let mut guard = self.channel.lock().await;
        let channel = guard.as_mut().ok_or_else(|| {
            StreamError::transport(self.connection_id.clone(), "shm channel is closed")
        })?;

        let io_result = async {
            write_message(&mut channel.tx, message).await?;
            read_status(&mut channel.rx).await
        }
        .await;

        match io_result {
            Ok(STATUS_OK) => Ok(()),
            Ok(status) => Err(StreamError::transport(
                self.connection_id.clone(),
                format!("consumer rejected message with status {status}"),
            )),
            Err(err) => {
                // A dead pipe is unrecoverable for this connection
                *guard = None;
                Err(StreamError::Transport {
                    connection_id: self.connection_id.clone(),
                    reason: "control pipe failed".to_string(),
                    source: Some(Box::new(err)),
                })
            }
        }
    }
}

#[async_trait]
impl<T: Element> OutputTransport<T> for ShmOutputTransport<T> {
    fn kind(&self) -> &'static str {
        "shm"
    }

    async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()> {
        self.exchange(&WireMessage::Sri { sri: sri.clone() }).await
    }

    async fn send_packet(&self, packet: OutPacket<'_, T>) -> Result<()> {
        let (message, transfer) = self.build_message(&packet);
        trace!(connection = %self.connection_id, stream = %packet.stream_id,
               scalars = packet.data.len(), shared = transfer.is_some(), "shm send");
        let result = self.exchange(&message).await;
        if result.is_err() {
            // The consumer never adopted the transfer reference
            if let Some(block) = transfer {
                block.release_transfer();
            }
        }
        result
    }

    async fn close(&self) -> Result<()> {
        let mut guard = self.channel.lock().await;
        *guard = None;
        Ok(())
    }
}

/// Consumer side: accept a negotiation and pump received packets into
/// the port until the producer closes the pipe.
pub async fn accept_negotiation<T: Element>(
    port: Arc<InputPort<T>>,
    _props: &PropertyMap,
) -> Result<PropertyMap> {
    let acceptor = fifo::PipeAcceptor::create()?;
    let (to_acceptor, to_connector) = acceptor.paths();

    let mut reply = BTreeMap::new();
    reply.insert(PROP_FIFO_IN.to_string(), to_acceptor.display().to_string());
    reply.insert(PROP_FIFO_OUT.to_string(), to_connector.display().to_string());

    tokio::spawn(async move {
        // A connector that negotiated but never opens the pipes must not
        // pin the acceptor (and its fifo files) forever
        match tokio::time::timeout(HANDSHAKE_DEADLINE, acceptor.accept()).await {
            Ok(Ok(channel)) => receive_loop(channel, port).await,
            Ok(Err(err)) => error!(error = %err, "shm handshake failed"),
            Err(_) => warn!("shm handshake abandoned"),
        }
    });
    Ok(reply)
}

async fn receive_loop<T: Element>(mut channel: PipeChannel, port: Arc<InputPort<T>>) {
    let client = HeapClient::new();
    debug!(port = %port.name(), "shm receive loop running");
    loop {
        let message = match read_message(&mut channel.rx).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                debug!(port = %port.name(), "shm producer closed the channel");
                return;
            }
            Err(err) => {
                error!(port = %port.name(), error = %err, "shm receive failed");
                return;
            }
        };

        let status = match handle_message(&client, &port, message).await {
            Ok(()) => STATUS_OK,
            Err(err) => {
                warn!(port = %port.name(), error = %err, "shm message rejected");
                STATUS_REJECTED
            }
        };
        if write_status(&mut channel.tx, status).await.is_err() {
            return;
        }
    }
}

async fn handle_message<T: Element>(
    client: &HeapClient,
    port: &Arc<InputPort<T>>,
    message: WireMessage,
) -> Result<()> {
    match message {
        WireMessage::Sri { sri } => {
            port.push_sri(&sri);
            Ok(())
        }
        WireMessage::DataInline { header, bytes } => {
            let data: Vec<T> = vec_from_bytes(&bytes);
            deliver(port, header, SampleBuffer::from_vec(data)).await
        }
        WireMessage::DataShm { header, mem, window } => {
            let byte_len = header.scalar_count as usize * std::mem::size_of::<T>();
            let block = client.resolve(&mem, window, byte_len)?;
            let buffer = if (block.payload_ptr() as usize) % std::mem::align_of::<T>() == 0 {
                SampleBuffer::from_shm(block)
            } else {
                // Misaligned window: fall back to one copy
                let bytes = unsafe {
                    std::slice::from_raw_parts(block.payload_ptr(), block.byte_len())
                };
                SampleBuffer::from_vec(vec_from_bytes(bytes))
            };
            deliver(port, header, buffer).await
        }
    }
}

async fn deliver<T: Element>(
    port: &Arc<InputPort<T>>,
    header: DataHeader,
    buffer: SampleBuffer<T>,
) -> Result<()> {
    if buffer.len() != header.scalar_count as usize {
        return Err(StreamError::shm("payload length disagrees with header"));
    }
    port.queue_packet(buffer, header.time, header.eos, &header.stream_id).await
}

/// Negotiates shared memory for same-host endpoints.
pub struct ShmTransportFactory;

#[async_trait]
impl<T: Element> TransportFactory<T> for ShmTransportFactory {
    fn name(&self) -> &'static str {
        "shm"
    }

    fn priority(&self) -> i32 {
        1
    }

    async fn create(
        &self,
        connection_id: &str,
        endpoint: &Arc<dyn RemoteEndpoint<T>>,
    ) -> Result<Option<Box<dyn OutputTransport<T>>>> {
        if !shm_enabled() {
            debug!(connection = %connection_id, "shm disabled by configuration");
            return Ok(None);
        }
        if !same_host(endpoint) {
            return Ok(None);
        }

        let our_props = PropertyMap::new();
        let reply = endpoint.negotiate_transport("shm", &our_props).await?;
        let to_acceptor = reply.get(PROP_FIFO_IN).map(PathBuf::from).ok_or_else(|| {
            StreamError::negotiation(connection_id, "endpoint reply lacks the inbound fifo path")
        })?;
        let to_connector = reply.get(PROP_FIFO_OUT).map(PathBuf::from).ok_or_else(|| {
            StreamError::negotiation(connection_id, "endpoint reply lacks the outbound fifo path")
        })?;

        let channel = fifo::connect(&to_acceptor, &to_connector).await?;
        let heap = ShmHeap::process_heap();
        Ok(Some(Box::new(ShmOutputTransport::<T>::new(connection_id, heap, channel))))
    }
}
