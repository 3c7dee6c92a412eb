//! Same-host zero-copy transport over POSIX shared memory.
//!
//! Payloads travel through a shared-memory heap ([`heap`]); references
//! to them, stream metadata, and acks travel over a pair of named pipes
//! ([`fifo`]) in a small framed format ([`message`]). The [`transport`]
//! module ties the pieces into the negotiation machinery.

pub mod fifo;
pub mod heap;
pub mod message;
pub mod transport;

pub use heap::{HeapClient, MemoryRef, ShmHeap};
pub use transport::{accept_negotiation, ShmOutputTransport, ShmTransportFactory};
