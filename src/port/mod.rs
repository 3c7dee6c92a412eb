//! Ports: the component-facing connection points.

mod input;
mod output;

pub use input::{InputPort, Packet, PortState, DEFAULT_QUEUE_DEPTH};
pub use output::{FilterEntry, OutputPort};
