//! Typed streaming-data transport between signal-processing components.
//!
//! Sampleio moves streams of numeric samples (and a few degenerate
//! payload kinds) from producer ports to consumer ports, with stream
//! metadata riding alongside the data and the fastest viable transport
//! negotiated per connection.
//!
//! # Features
//!
//! - **Typed streams**: one element type per port, checked at compile time
//! - **Sized reads**: span packets, overlap via consume, synthesized
//!   timestamps for mid-packet starts
//! - **Metadata tracking**: descriptor changes surface exactly once, as
//!   flags on the first affected block
//! - **Transport negotiation**: direct port-to-port in process, shared
//!   memory on one host, serialized push everywhere else
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use sampleio::{InputPort, OutputPort, PortEndpoint, PrecisionTime, Wait};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let input = InputPort::<f32>::new("samples_in");
//!     let output = OutputPort::<f32>::new("samples_out");
//!     output.connect(PortEndpoint::new(input.clone()), "connection_1").await?;
//!
//!     let stream = output.create_stream("tone").await;
//!     stream.set_xdelta(1.0 / 48_000.0).await?;
//!     stream.write(&[0.0, 0.5, 1.0, 0.5], PrecisionTime::now()).await?;
//!
//!     if let Some(reader) = input.current_stream(Wait::Indefinite).await {
//!         if let Some(block) = reader.read(4).await {
//!             println!("{} samples at xdelta {}", block.sample_count(), block.xdelta());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod block;
mod error;
pub mod sri;
pub mod stats;
pub mod types;

// Ports, streams, and the transports underneath them
pub mod port;
pub mod stream;
pub mod transport;

pub use block::DataBlock;
pub use error::{Result, StreamError};
pub use port::{FilterEntry, InputPort, OutputPort, Packet, PortState};
pub use sri::{SriChangeFlags, StreamDescriptor};
pub use stream::{BlockFeed, InputStream, OutputStream};
pub use transport::{PortEndpoint, RemoteEndpoint};
pub use types::{Element, ElementKind, PrecisionTime, SampleBuffer, SampleTimestamp, Value, Wait};
