//! Stream handles: the per-stream API over ports.

mod feed;
mod input;
mod output;

pub use feed::BlockFeed;
pub use input::InputStream;
pub use output::OutputStream;
