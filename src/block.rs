//! Data blocks: the consumer-visible result of a read.

use crate::sri::{SriChangeFlags, StreamDescriptor};
use crate::types::{Element, SampleBuffer, SampleTimestamp};

/// An immutable block of data returned from a stream read.
///
/// Wraps the assembled buffer, a snapshot of the stream's descriptor at
/// read time, one or more offset-tagged timestamps (the first always at
/// offset 0), and the change flags observed since the previous read.
#[derive(Debug, Clone)]
pub struct DataBlock<T: Element> {
    buffer: SampleBuffer<T>,
    sri: StreamDescriptor,
    timestamps: Vec<SampleTimestamp>,
    sri_change_flags: SriChangeFlags,
    input_queue_flushed: bool,
}

impl<T: Element> DataBlock<T> {
    pub(crate) fn new(buffer: SampleBuffer<T>, sri: StreamDescriptor) -> Self {
        DataBlock {
            buffer,
            sri,
            timestamps: Vec::new(),
            sri_change_flags: SriChangeFlags::NONE,
            input_queue_flushed: false,
        }
    }

    pub(crate) fn add_timestamp(&mut self, ts: SampleTimestamp) {
        debug_assert!(
            self.timestamps.last().map(|prev| prev.offset <= ts.offset).unwrap_or(ts.offset == 0),
            "timestamps must be offset-ordered with the first at 0"
        );
        self.timestamps.push(ts);
    }

    pub(crate) fn set_sri_change_flags(&mut self, flags: SriChangeFlags) {
        self.sri_change_flags = flags;
    }

    pub(crate) fn set_input_queue_flushed(&mut self, flushed: bool) {
        self.input_queue_flushed = flushed;
    }

    /// The block's data as scalars.
    pub fn data(&self) -> &[T] {
        self.buffer.as_slice()
    }

    /// The underlying buffer (cheap to clone, zero-copy to slice).
    pub fn buffer(&self) -> &SampleBuffer<T> {
        &self.buffer
    }

    /// Number of scalars in the block.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of samples: scalar count halved for complex-mode streams.
    pub fn sample_count(&self) -> usize {
        self.buffer.len() / self.sri.scalars_per_sample()
    }

    /// Whether the block's descriptor marks the data as complex.
    pub fn complex(&self) -> bool {
        self.sri.complex
    }

    /// Sample spacing from the block's descriptor snapshot.
    pub fn xdelta(&self) -> f64 {
        self.sri.xdelta
    }

    /// The descriptor snapshot taken at read time.
    pub fn sri(&self) -> &StreamDescriptor {
        &self.sri
    }

    /// Offset-tagged timestamps. The entry at offset 0 is always present
    /// for non-empty blocks; later entries mark packet-join boundaries
    /// where timing was recomputed.
    pub fn timestamps(&self) -> &[SampleTimestamp] {
        &self.timestamps
    }

    /// The timestamp of the first sample.
    pub fn start_time(&self) -> Option<SampleTimestamp> {
        self.timestamps.first().copied()
    }

    /// Which descriptor fields changed since the previous block, if any.
    pub fn sri_change_flags(&self) -> SriChangeFlags {
        self.sri_change_flags
    }

    pub fn sri_changed(&self) -> bool {
        !self.sri_change_flags.is_empty()
    }

    /// Whether the port discarded queued data (queue flush) before this
    /// block was read.
    pub fn input_queue_flushed(&self) -> bool {
        self.input_queue_flushed
    }
}
