//! Transport selection: factories tried in priority order.
//!
//! Each [`TransportFactory`] inspects the endpoint and either refuses
//! (wrong process, wrong host, disabled by configuration) or produces a
//! transport. A factory failure is logged and the next candidate is
//! tried; the serialized remote transport accepts unconditionally, so
//! negotiation only fails when something is deeply wrong.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{Result, StreamError};
use crate::transport::endpoint::{RemoteEndpoint, PROP_HOSTNAME};
use crate::transport::local::LocalTransport;
use crate::transport::remote::RemoteTransport;
use crate::transport::OutputTransport;
use crate::types::Element;

/// Environment variable gating the shared-memory transport. Set to
/// `disable` to force the serialized path even on one host.
pub const SHM_ENV_VAR: &str = "SAMPLEIO_SHM";

/// Lifecycle of one producer-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Negotiating,
    Connected,
    Disconnected,
}

/// Produces a transport for an endpoint, or refuses.
#[async_trait]
pub trait TransportFactory<T: Element>: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower values are tried first.
    fn priority(&self) -> i32;

    /// `Ok(None)` means this factory does not apply to the endpoint;
    /// `Err` means it applied but setup failed. Both fall through to the
    /// next candidate.
    async fn create(
        &self,
        connection_id: &str,
        endpoint: &Arc<dyn RemoteEndpoint<T>>,
    ) -> Result<Option<Box<dyn OutputTransport<T>>>>;
}

/// Ordered set of transport factories.
pub struct TransportRegistry<T: Element> {
    factories: Vec<Arc<dyn TransportFactory<T>>>,
}

impl<T: Element> TransportRegistry<T> {
    pub fn empty() -> Self {
        TransportRegistry { factories: Vec::new() }
    }

    /// The built-in stack: direct port-to-port, shared memory where the
    /// platform has it, serialized push as the last resort.
    pub fn standard() -> Self {
        let mut registry = TransportRegistry::empty();
        registry.register(Arc::new(LocalTransportFactory));
        #[cfg(unix)]
        registry.register(Arc::new(crate::transport::shm::ShmTransportFactory));
        registry.register(Arc::new(RemoteTransportFactory));
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn TransportFactory<T>>) {
        self.factories.push(factory);
        self.factories.sort_by_key(|f| f.priority());
    }

    /// Try each factory in priority order until one produces a transport.
    pub async fn negotiate(
        &self,
        connection_id: &str,
        endpoint: &Arc<dyn RemoteEndpoint<T>>,
    ) -> Result<Box<dyn OutputTransport<T>>> {
        for factory in &self.factories {
            match factory.create(connection_id, endpoint).await {
                Ok(Some(transport)) => {
                    info!(connection = %connection_id, transport = factory.name(),
                          "transport negotiated");
                    return Ok(transport);
                }
                Ok(None) => {
                    debug!(connection = %connection_id, transport = factory.name(),
                           "factory not applicable");
                }
                Err(err) => {
                    debug!(connection = %connection_id, transport = factory.name(),
                           error = %err, "factory failed, trying next");
                }
            }
        }
        Err(StreamError::negotiation(connection_id, "no transport factory produced a transport"))
    }
}

/// Direct port-to-port delivery when producer and consumer share a
/// process.
pub struct LocalTransportFactory;

#[async_trait]
impl<T: Element> TransportFactory<T> for LocalTransportFactory {
    fn name(&self) -> &'static str {
        "local"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn create(
        &self,
        connection_id: &str,
        endpoint: &Arc<dyn RemoteEndpoint<T>>,
    ) -> Result<Option<Box<dyn OutputTransport<T>>>> {
        match endpoint.local_port() {
            Some(port) => Ok(Some(Box::new(LocalTransport::new(connection_id, port)))),
            None => Ok(None),
        }
    }
}

/// Serialized packet push through the endpoint itself. Always applies.
pub struct RemoteTransportFactory;

#[async_trait]
impl<T: Element> TransportFactory<T> for RemoteTransportFactory {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn priority(&self) -> i32 {
        100
    }

    async fn create(
        &self,
        connection_id: &str,
        endpoint: &Arc<dyn RemoteEndpoint<T>>,
    ) -> Result<Option<Box<dyn OutputTransport<T>>>> {
        Ok(Some(Box::new(RemoteTransport::new(connection_id, Arc::clone(endpoint)))))
    }
}

/// Whether configuration allows the shared-memory transport.
#[cfg(unix)]
pub(crate) fn shm_enabled() -> bool {
    match std::env::var(SHM_ENV_VAR) {
        Ok(value) => !value.eq_ignore_ascii_case("disable"),
        Err(_) => true,
    }
}

/// Whether the endpoint advertises the same host as this process.
pub(crate) fn same_host<T: Element>(endpoint: &Arc<dyn RemoteEndpoint<T>>) -> bool {
    endpoint
        .properties()
        .get(PROP_HOSTNAME)
        .is_some_and(|host| *host == crate::transport::endpoint::local_hostname())
}
