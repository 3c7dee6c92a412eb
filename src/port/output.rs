//! Producer-side port: connections, routing, and packet fanout.
//!
//! An [`OutputPort`] owns a set of negotiated connections and the
//! producer-side stream handles. Every packet a stream emits fans out to
//! all connections the filter table routes it to; a failing connection
//! is logged and skipped so its siblings keep receiving data.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Result, StreamError};
use crate::sri::StreamDescriptor;
use crate::stats::{PortStatistics, StatsReport};
use crate::stream::OutputStream;
use crate::transport::{
    ChunkedTransport, ConnectionState, OutPacket, OutputTransport, RemoteEndpoint,
    TransportRegistry,
};
use crate::types::{Element, PrecisionTime, SampleBuffer};

/// One row of the routing table: `stream_id` on `port_name` goes to
/// `connection_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterEntry {
    pub port_name: String,
    pub connection_id: String,
    pub stream_id: String,
}

struct Connection<T: Element> {
    id: String,
    transport: Box<dyn OutputTransport<T>>,
    state: ConnectionState,
    /// Descriptor version last announced per stream, so metadata is
    /// re-announced exactly when it changes
    sri_versions: HashMap<String, u64>,
    stats: PortStatistics,
}

struct PortInner<T: Element> {
    connections: Vec<Connection<T>>,
    /// Connection IDs reserved while their transport negotiation runs
    negotiating: Vec<String>,
    streams: HashMap<String, OutputStream<T>>,
    filters: Vec<FilterEntry>,
}

/// Producer-side port.
pub struct OutputPort<T: Element> {
    name: String,
    self_ref: Weak<OutputPort<T>>,
    inner: Mutex<PortInner<T>>,
    registry: TransportRegistry<T>,
}

impl<T: Element> OutputPort<T> {
    /// Create a port with the standard transport stack.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Self::with_registry(name, TransportRegistry::standard())
    }

    pub fn with_registry(name: impl Into<String>, registry: TransportRegistry<T>) -> Arc<Self> {
        let name = name.into();
        debug!(port = %name, "creating output port");
        Arc::new_cyclic(|self_ref| OutputPort {
            name,
            self_ref: self_ref.clone(),
            inner: Mutex::new(PortInner {
                connections: Vec::new(),
                negotiating: Vec::new(),
                streams: HashMap::new(),
                filters: Vec::new(),
            }),
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Negotiate a transport to an endpoint and add it as a connection.
    /// Streams already announced reach the new connection when their
    /// next packet flows.
    pub async fn connect(
        &self,
        endpoint: Arc<dyn RemoteEndpoint<T>>,
        connection_id: impl Into<String>,
    ) -> Result<()> {
        let connection_id = connection_id.into();
        {
            let mut inner = self.inner.lock().await;
            if inner.connections.iter().any(|c| c.id == connection_id)
                || inner.negotiating.contains(&connection_id)
            {
                return Err(StreamError::misuse(format!(
                    "connection '{connection_id}' already exists on port '{}'",
                    self.name
                )));
            }
            inner.negotiating.push(connection_id.clone());
        }

        let negotiated = self.registry.negotiate(&connection_id, &endpoint).await;

        let mut inner = self.inner.lock().await;
        inner.negotiating.retain(|id| id != &connection_id);
        let transport = ChunkedTransport::wrap_if_bounded(negotiated?);
        info!(port = %self.name, connection = %connection_id, kind = transport.kind(),
              "connection established");
        inner.connections.push(Connection {
            id: connection_id,
            transport,
            state: ConnectionState::Connected,
            sri_versions: HashMap::new(),
            stats: PortStatistics::new(self.name.clone(), std::mem::size_of::<T>()),
        });
        Ok(())
    }

    /// Tear one connection down. Streams routed to it get a final
    /// end-of-stream first; a consumer too slow to take it is abandoned
    /// rather than blocking the teardown.
    pub async fn disconnect(&self, connection_id: &str) -> Result<()> {
        // Streams lock their own state before the port lock; collect the
        // handles and release the port lock before touching them
        let (mut connection, announced_streams) = {
            let mut inner = self.inner.lock().await;
            let position = inner
                .connections
                .iter()
                .position(|c| c.id == connection_id)
                .ok_or_else(|| {
                    StreamError::misuse(format!(
                        "no connection '{connection_id}' on port '{}'",
                        self.name
                    ))
                })?;
            let connection = inner.connections.remove(position);
            let streams: Vec<OutputStream<T>> = inner
                .streams
                .iter()
                .filter(|(id, _)| connection.sri_versions.contains_key(*id))
                .map(|(_, stream)| stream.clone())
                .collect();
            (connection, streams)
        };
        connection.state = ConnectionState::Disconnected;
        info!(port = %self.name, connection = %connection_id, "disconnecting");

        // Only streams this connection actually saw need an EOS
        let mut announced: Vec<(String, StreamDescriptor)> = Vec::new();
        for stream in announced_streams {
            announced.push((stream.stream_id().to_string(), stream.sri().await));
        }
        for (stream_id, sri) in announced {
            let result = connection
                .transport
                .send_packet(OutPacket {
                    data: SampleBuffer::empty(),
                    time: PrecisionTime::not_set(),
                    eos: true,
                    stream_id: &stream_id,
                    sri: &sri,
                })
                .await;
            match result {
                Ok(()) => {}
                Err(err) if err.is_timeout() => {
                    warn!(port = %self.name, connection = %connection_id, stream = %stream_id,
                          "consumer did not take final end-of-stream in time");
                }
                Err(err) => {
                    warn!(port = %self.name, connection = %connection_id, stream = %stream_id,
                          error = %err, "failed to deliver final end-of-stream");
                }
            }
        }
        connection.transport.close().await
    }

    /// Tear down every connection.
    pub async fn disconnect_all(&self) -> Result<()> {
        let ids: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.connections.iter().map(|c| c.id.clone()).collect()
        };
        for id in ids {
            self.disconnect(&id).await?;
        }
        Ok(())
    }

    pub async fn connection_ids(&self) -> Vec<String> {
        self.inner.lock().await.connections.iter().map(|c| c.id.clone()).collect()
    }

    /// The negotiated transport kind for a connection ("local", "shm",
    /// "remote").
    pub async fn connection_kind(&self, connection_id: &str) -> Option<&'static str> {
        self.inner
            .lock()
            .await
            .connections
            .iter()
            .find(|c| c.id == connection_id)
            .map(|c| c.transport.kind())
    }

    /// Lifecycle state of a connection ID as this port sees it. An ID
    /// the port has never heard of (or has fully torn down) reports
    /// `Unconnected`.
    pub async fn connection_state(&self, connection_id: &str) -> ConnectionState {
        let inner = self.inner.lock().await;
        if inner.negotiating.iter().any(|id| id == connection_id) {
            return ConnectionState::Negotiating;
        }
        inner
            .connections
            .iter()
            .find(|c| c.id == connection_id)
            .map(|c| c.state)
            .unwrap_or(ConnectionState::Unconnected)
    }

    /// Per-connection throughput statistics.
    pub async fn statistics(&self) -> Vec<(String, StatsReport)> {
        let mut inner = self.inner.lock().await;
        inner.connections.iter_mut().map(|c| (c.id.clone(), c.stats.retrieve())).collect()
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Replace the routing table. An empty table (or one with no entries
    /// for this port) routes every stream to every connection.
    pub async fn update_filters(&self, filters: Vec<FilterEntry>) {
        debug!(port = %self.name, entries = filters.len(), "updating filter table");
        self.inner.lock().await.filters = filters;
    }

    fn routes_to(filters: &[FilterEntry], port_name: &str, connection_id: &str, stream_id: &str) -> bool {
        let mut relevant = filters.iter().filter(|f| f.port_name == port_name).peekable();
        if relevant.peek().is_none() {
            return true;
        }
        relevant.any(|f| f.connection_id == connection_id && f.stream_id == stream_id)
    }

    // ------------------------------------------------------------------
    // Streams
    // ------------------------------------------------------------------

    /// Create a stream with default metadata.
    pub async fn create_stream(&self, stream_id: impl Into<String>) -> OutputStream<T> {
        self.create_stream_with(StreamDescriptor::new(stream_id.into())).await
    }

    /// Create a stream from an existing descriptor.
    pub async fn create_stream_with(&self, sri: StreamDescriptor) -> OutputStream<T> {
        let stream = OutputStream::new(sri, self.self_ref.clone());
        let mut inner = self.inner.lock().await;
        inner.streams.insert(stream.stream_id().to_string(), stream.clone());
        stream
    }

    pub async fn stream(&self, stream_id: &str) -> Option<OutputStream<T>> {
        self.inner.lock().await.streams.get(stream_id).cloned()
    }

    pub async fn streams(&self) -> Vec<OutputStream<T>> {
        self.inner.lock().await.streams.values().cloned().collect()
    }

    pub(crate) fn remove_stream(&self, stream_id: &str) {
        // Called from stream close; take the lock without awaiting so it
        // also works from drop-adjacent paths
        if let Ok(mut inner) = self.inner.try_lock() {
            inner.streams.remove(stream_id);
        } else {
            let port = self.self_ref.upgrade();
            let stream_id = stream_id.to_string();
            tokio::spawn(async move {
                if let Some(port) = port {
                    port.inner.lock().await.streams.remove(&stream_id);
                }
            });
        }
    }

    // ------------------------------------------------------------------
    // Fanout
    // ------------------------------------------------------------------

    /// Deliver one packet to every routed connection. The whole fanout is
    /// a single critical section, so packets from concurrent streams
    /// interleave at packet granularity and never tear.
    pub(crate) async fn send_packet(
        &self,
        sri: &StreamDescriptor,
        data: SampleBuffer<T>,
        time: PrecisionTime,
        eos: bool,
    ) -> Result<()> {
        let stream_id = sri.stream_id().to_string();
        let mut inner = self.inner.lock().await;
        let PortInner { connections, filters, .. } = &mut *inner;

        for connection in connections.iter_mut() {
            if connection.state != ConnectionState::Connected {
                continue;
            }
            if !Self::routes_to(filters, &self.name, &connection.id, &stream_id) {
                continue;
            }

            // Re-announce metadata when this connection has not seen the
            // current version
            if connection.sri_versions.get(&stream_id) != Some(&sri.version()) {
                if let Err(err) = connection.transport.push_sri(sri).await {
                    self.note_failure(connection, &stream_id, "push_sri", err);
                    continue;
                }
                connection.sri_versions.insert(stream_id.clone(), sri.version());
            }

            let result = connection
                .transport
                .send_packet(OutPacket {
                    data: data.clone(),
                    time,
                    eos,
                    stream_id: &stream_id,
                    sri,
                })
                .await;
            match result {
                Ok(()) => {
                    connection.stats.update(data.len(), 0.0, &stream_id, eos);
                }
                Err(err) => self.note_failure(connection, &stream_id, "send_packet", err),
            }
            if eos {
                connection.sri_versions.remove(&stream_id);
            }
        }
        Ok(())
    }

    /// A connection failure never aborts the fanout to its siblings.
    /// Retryable errors leave the connection up; fatal ones take it out
    /// of rotation.
    fn note_failure(
        &self,
        connection: &mut Connection<T>,
        stream_id: &str,
        operation: &str,
        err: StreamError,
    ) {
        if err.is_retryable() {
            warn!(port = %self.name, connection = %connection.id, stream = %stream_id,
                  operation, error = %err, "delivery failed, will retry on next packet");
        } else {
            error!(port = %self.name, connection = %connection.id, stream = %stream_id,
                   operation, error = %err, "connection failed, dropping from rotation");
            connection.state = ConnectionState::Disconnected;
        }
    }
}

impl<T: Element> std::fmt::Debug for OutputPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputPort").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::InputPort;
    use crate::transport::{PortEndpoint, RemoteTransportFactory, TransportFactory};
    use crate::types::Wait;

    #[tokio::test]
    async fn local_connection_delivers_sri_and_data() {
        let input = InputPort::<i32>::new("in");
        let output = OutputPort::<i32>::new("out");
        output.connect(PortEndpoint::new(input.clone()), "c1").await.unwrap();

        let stream = output.create_stream("alpha").await;
        stream.write(&[1, 2, 3], PrecisionTime::now()).await.unwrap();

        let packet = input.get_packet(Wait::Poll, None).await.expect("packet delivered");
        assert_eq!(packet.stream_id, "alpha");
        assert_eq!(packet.buffer.as_slice(), &[1, 2, 3]);
        assert!(packet.sri_changed, "first packet carries the announcement");
    }

    #[tokio::test]
    async fn sri_reannounced_only_on_change() {
        let input = InputPort::<i32>::new("in");
        let output = OutputPort::<i32>::new("out");
        output.connect(PortEndpoint::new(input.clone()), "c1").await.unwrap();

        let stream = output.create_stream("s").await;
        stream.write(&[1], PrecisionTime::now()).await.unwrap();
        stream.write(&[2], PrecisionTime::now()).await.unwrap();
        stream.set_xdelta(0.25).await.unwrap();
        stream.write(&[3], PrecisionTime::now()).await.unwrap();

        let first = input.get_packet(Wait::Poll, None).await.unwrap();
        assert!(first.sri_changed);
        let second = input.get_packet(Wait::Poll, None).await.unwrap();
        assert!(!second.sri_changed);
        let third = input.get_packet(Wait::Poll, None).await.unwrap();
        assert!(third.sri_changed);
        assert_eq!(third.sri.xdelta, 0.25);
    }

    #[tokio::test]
    async fn filter_table_scopes_streams_to_connections() {
        let in_a = InputPort::<i32>::new("in-a");
        let in_b = InputPort::<i32>::new("in-b");
        let output = OutputPort::<i32>::new("out");
        output.connect(PortEndpoint::new(in_a.clone()), "conn-a").await.unwrap();
        output.connect(PortEndpoint::new(in_b.clone()), "conn-b").await.unwrap();
        output
            .update_filters(vec![FilterEntry {
                port_name: "out".into(),
                connection_id: "conn-a".into(),
                stream_id: "alpha".into(),
            }])
            .await;

        let stream = output.create_stream("alpha").await;
        stream.write(&[7], PrecisionTime::now()).await.unwrap();

        assert!(in_a.get_packet(Wait::Poll, None).await.is_some());
        assert!(in_b.get_packet(Wait::Poll, None).await.is_none());
    }

    #[tokio::test]
    async fn disconnect_sends_final_eos() {
        let input = InputPort::<i32>::new("in");
        let output = OutputPort::<i32>::new("out");
        output.connect(PortEndpoint::new(input.clone()), "c1").await.unwrap();

        let stream = output.create_stream("s").await;
        stream.write(&[1], PrecisionTime::now()).await.unwrap();
        output.disconnect("c1").await.unwrap();

        let data = input.get_packet(Wait::Poll, None).await.unwrap();
        assert!(!data.eos);
        let fin = input.get_packet(Wait::Poll, None).await.unwrap();
        assert!(fin.eos);
        assert!(fin.buffer.is_empty());
        assert!(output.connection_ids().await.is_empty());
    }

    #[tokio::test]
    async fn duplicate_connection_id_is_refused() {
        let input = InputPort::<i32>::new("in");
        let output = OutputPort::<i32>::new("out");
        output.connect(PortEndpoint::new(input.clone()), "c1").await.unwrap();
        let err = output.connect(PortEndpoint::new(input), "c1").await.unwrap_err();
        assert!(matches!(err, StreamError::Misuse { .. }));
    }

    /// Refuses until released, then defers to the next candidate.
    struct StallingFactory {
        release: Arc<tokio::sync::Notify>,
    }

    #[async_trait::async_trait]
    impl TransportFactory<i32> for StallingFactory {
        fn name(&self) -> &'static str {
            "stalling"
        }

        fn priority(&self) -> i32 {
            0
        }

        async fn create(
            &self,
            _connection_id: &str,
            _endpoint: &Arc<dyn RemoteEndpoint<i32>>,
        ) -> Result<Option<Box<dyn OutputTransport<i32>>>> {
            self.release.notified().await;
            Ok(None)
        }
    }

    #[tokio::test]
    async fn connection_state_tracks_the_lifecycle() {
        let release = Arc::new(tokio::sync::Notify::new());
        let mut registry = TransportRegistry::empty();
        registry.register(Arc::new(StallingFactory { release: Arc::clone(&release) }));
        registry.register(Arc::new(RemoteTransportFactory));

        let input = InputPort::<i32>::new("in");
        let output = OutputPort::with_registry("out", registry);
        assert_eq!(output.connection_state("c1").await, ConnectionState::Unconnected);

        let connect = {
            let output = Arc::clone(&output);
            let input = Arc::clone(&input);
            tokio::spawn(async move { output.connect(PortEndpoint::new(input), "c1").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(output.connection_state("c1").await, ConnectionState::Negotiating);

        release.notify_one();
        connect.await.unwrap().unwrap();
        assert_eq!(output.connection_state("c1").await, ConnectionState::Connected);
    }
}
