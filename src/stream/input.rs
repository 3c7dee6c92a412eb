//! Consumer-side stream cursor: sized reads, overlap, end-of-stream.
//!
//! An [`InputStream`] is a cloneable handle onto one stream flowing
//! through an [`InputPort`](crate::port::InputPort). It maintains a local
//! read queue ahead of the port queue so that sized reads can span packet
//! boundaries, overlap via a smaller consume length, and synthesize
//! timestamps for data that starts mid-packet.
//!
//! Reads never cross a metadata-change or queue-flush boundary: a packet
//! carrying either indication terminates the readable segment, and the
//! indications are surfaced on the first block read at or past that point.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::trace;

use crate::block::DataBlock;
use crate::port::{InputPort, Packet};
use crate::sri::{SriChangeFlags, StreamDescriptor};
use crate::types::{Element, SampleBuffer, SampleTimestamp, Wait};

/// Where this stream stands in its end-of-stream lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EosState {
    /// No end-of-stream packet seen yet
    None,
    /// An end-of-stream packet was fetched but data may remain queued
    Received,
    /// All data up to end-of-stream has been consumed
    Reached,
    /// The consumer has observed the end-of-stream (stream retired)
    Reported,
}

struct ReadState<T: Element> {
    /// Last descriptor surfaced to the consumer, baseline for change flags
    sri: StreamDescriptor,
    eos_state: EosState,
    new_stream: bool,
    queue: VecDeque<Packet<T>>,
    /// Packet held back because it carries flags and the queue is not
    /// drained yet
    pending: Option<Packet<T>>,
    scalars_queued: usize,
    /// Read position within the front packet, in scalars
    scalar_offset: usize,
}

struct Inner<T: Element> {
    stream_id: String,
    port: Weak<InputPort<T>>,
    enabled: AtomicBool,
    state: tokio::sync::Mutex<ReadState<T>>,
}

/// Cloneable consumer-side handle onto one stream.
pub struct InputStream<T: Element> {
    inner: Arc<Inner<T>>,
}

impl<T: Element> Clone for InputStream<T> {
    fn clone(&self) -> Self {
        InputStream { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Element> PartialEq for InputStream<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<T: Element> std::fmt::Debug for InputStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputStream")
            .field("stream_id", &self.inner.stream_id)
            .field("enabled", &self.enabled())
            .finish()
    }
}

impl<T: Element> InputStream<T> {
    pub(crate) fn new(sri: StreamDescriptor, port: &Arc<InputPort<T>>) -> Self {
        InputStream {
            inner: Arc::new(Inner {
                stream_id: sri.stream_id().to_string(),
                port: Arc::downgrade(port),
                enabled: AtomicBool::new(true),
                state: tokio::sync::Mutex::new(ReadState {
                    sri,
                    eos_state: EosState::None,
                    new_stream: true,
                    queue: VecDeque::new(),
                    pending: None,
                    scalars_queued: 0,
                    scalar_offset: 0,
                }),
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Snapshot of the last descriptor surfaced to this consumer.
    pub async fn sri(&self) -> StreamDescriptor {
        self.inner.state.lock().await.sri.clone()
    }

    pub fn enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Resume delivery after [`disable`](Self::disable).
    pub fn enable(&self) {
        self.inner.enabled.store(true, Ordering::Release);
    }

    /// Stop delivery: buffered data is dropped and arriving packets are
    /// discarded at the port, though a later end-of-stream still tears the
    /// stream down.
    pub async fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Release);
        let mut state = self.inner.state.lock().await;
        if state.eos_state == EosState::None {
            if let Some(port) = self.inner.port.upgrade() {
                port.discard_packets_for_stream(&self.inner.stream_id);
            }
        }
        state.queue.clear();
        state.pending = None;
        state.scalars_queued = 0;
        state.scalar_offset = 0;
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Read the remaining data of the next packet, waiting for one to
    /// arrive. Returns `None` at end-of-stream or when the port stops.
    pub async fn read_packet(&self) -> Option<DataBlock<T>> {
        self.read_packet_with(Wait::Indefinite).await
    }

    /// Non-waiting variant of [`read_packet`](Self::read_packet).
    pub async fn tryread_packet(&self) -> Option<DataBlock<T>> {
        self.read_packet_with(Wait::Poll).await
    }

    /// Read exactly `count` samples, waiting for them to arrive. Returns
    /// a short block when end-of-stream or a metadata boundary intervenes,
    /// `None` when no data remains.
    pub async fn read(&self, count: usize) -> Option<DataBlock<T>> {
        self.read_with(count, count, Wait::Indefinite).await
    }

    /// Read `count` samples but advance the read position by only
    /// `consume` samples, leaving the overlap readable again. A `consume`
    /// of zero peeks without consuming anything. `consume` larger than
    /// `count` is clamped to `count`.
    pub async fn read_consume(&self, count: usize, consume: usize) -> Option<DataBlock<T>> {
        self.read_with(count, consume, Wait::Indefinite).await
    }

    /// Non-waiting variant of [`read`](Self::read). When the shortfall
    /// is only data not having arrived yet (no end-of-stream or metadata
    /// boundary), returns `None` and leaves the data queued.
    pub async fn tryread(&self, count: usize) -> Option<DataBlock<T>> {
        self.read_with(count, count, Wait::Poll).await
    }

    /// Non-waiting variant of [`read_consume`](Self::read_consume).
    pub async fn tryread_consume(&self, count: usize, consume: usize) -> Option<DataBlock<T>> {
        self.read_with(count, consume, Wait::Poll).await
    }

    /// Discard up to `count` samples without producing a block, pulling
    /// further packets until the count is met or a break intervenes.
    /// Returns the number of samples actually discarded.
    pub async fn skip(&self, count: usize) -> usize {
        let mut state = self.inner.state.lock().await;
        if state.scalars_queued == 0 && !self.fetch_packet(&mut state, Wait::Indefinite).await {
            self.maybe_report_eos(&mut state);
            return 0;
        }
        Self::normalize_front(&mut state);
        let item = Self::front_item_size(&state);
        let count_s = count * item;
        while state.scalars_queued < count_s {
            if !self.fetch_packet(&mut state, Wait::Indefinite).await {
                break;
            }
            Self::normalize_front(&mut state);
        }
        let scalars = count_s.min(state.scalars_queued);
        Self::consume_data(&mut state, scalars);
        self.maybe_report_eos(&mut state);
        scalars / item
    }

    async fn read_packet_with(&self, wait: Wait) -> Option<DataBlock<T>> {
        let mut state = self.inner.state.lock().await;
        if state.scalars_queued == 0 && !self.fetch_packet(&mut state, wait).await {
            self.maybe_report_eos(&mut state);
            return None;
        }
        if state.scalars_queued == 0 {
            self.maybe_report_eos(&mut state);
            return None;
        }
        Self::normalize_front(&mut state);
        let remaining = match state.queue.front() {
            Some(front) => front.buffer.len() - state.scalar_offset,
            None => return None,
        };
        let block = self.assemble_block(&mut state, remaining, remaining);
        self.maybe_report_eos(&mut state);
        block
    }

    async fn read_with(&self, count: usize, consume: usize, wait: Wait) -> Option<DataBlock<T>> {
        if count == 0 {
            return None;
        }
        let peek = consume == 0;
        let consume = consume.min(count);

        let mut state = self.inner.state.lock().await;
        if state.scalars_queued == 0 && !self.fetch_packet(&mut state, wait).await {
            self.maybe_report_eos(&mut state);
            return None;
        }
        if state.scalars_queued == 0 {
            self.maybe_report_eos(&mut state);
            return None;
        }
        Self::normalize_front(&mut state);

        // Complex data doubles the scalar count per sample
        let item = Self::front_item_size(&state);
        let count_s = count * item;
        let consume_s = consume * item;

        while state.scalars_queued < count_s {
            if !self.fetch_packet(&mut state, wait).await {
                break;
            }
            Self::normalize_front(&mut state);
        }
        if state.scalars_queued == 0 {
            self.maybe_report_eos(&mut state);
            return None;
        }
        // A non-blocking read that comes up short with no break in the
        // data (no held-back indication, no end-of-stream) leaves the
        // data queued; a future read may return the full amount
        if wait.is_poll()
            && state.scalars_queued < count_s
            && state.pending.is_none()
            && state.eos_state == EosState::None
        {
            return None;
        }

        let available = Self::available_to_boundary(&state);
        let take_s = count_s.min(available);
        if take_s == 0 {
            self.maybe_report_eos(&mut state);
            return None;
        }
        // Short reads consume everything returned, except an explicit peek
        let consume_s = if peek {
            0
        } else if take_s < count_s {
            take_s
        } else {
            consume_s
        };

        let block = self.assemble_block(&mut state, take_s, consume_s);
        self.maybe_report_eos(&mut state);
        block
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Samples readable right now without crossing a metadata boundary,
    /// including data still sitting on the port queue.
    pub async fn samples_available(&self) -> usize {
        let state = self.inner.state.lock().await;
        let item = Self::front_item_size(&state);
        let local = (state.scalars_queued) / item;

        let Some(port) = self.inner.port.upgrade() else { return local };

        if state.pending.is_some() {
            if !state.queue.is_empty() {
                // Boundary between queue and pending: port data unreachable
                return local;
            }
            let pending_item = match &state.pending {
                Some(p) if p.sri.complex => 2,
                _ => 1,
            };
            let pending = state.pending.as_ref().map_or(0, |p| p.buffer.len()) / pending_item;
            return pending + port.samples_available(&self.inner.stream_id, false);
        }
        let first = state.queue.is_empty();
        local + port.samples_available(&self.inner.stream_id, first)
    }

    /// True when at least one sample can be read without waiting.
    pub async fn ready(&self) -> bool {
        self.samples_available().await > 0
    }

    /// True when data or indications are buffered locally (already pulled
    /// off the port queue).
    pub async fn has_buffered_data(&self) -> bool {
        let state = self.inner.state.lock().await;
        !state.queue.is_empty() || state.pending.is_some()
    }

    /// True once end-of-stream has been reached and all data consumed.
    /// Checking retires the stream from its port the first time it
    /// reports true.
    pub async fn eos(&self) -> bool {
        let mut state = self.inner.state.lock().await;
        if state.queue.is_empty() && state.pending.is_none() {
            // An unseen end-of-stream may be sitting on the port queue
            let _ = self.fetch_packet(&mut state, Wait::Poll).await;
        }
        self.maybe_report_eos(&mut state);
        state.eos_state == EosState::Reported
    }

    // ------------------------------------------------------------------
    // Internal machinery
    // ------------------------------------------------------------------

    fn front_item_size(state: &ReadState<T>) -> usize {
        let complex = match state.queue.front() {
            Some(front) => front.sri.complex,
            None => match &state.pending {
                Some(pending) => pending.sri.complex,
                None => state.sri.complex,
            },
        };
        if complex { 2 } else { 1 }
    }

    /// Pull one more packet into the local queue. Returns false when no
    /// packet is obtainable (nothing queued at the port, end-of-stream
    /// already seen, or a held-back packet blocks further fetches).
    async fn fetch_packet(&self, state: &mut ReadState<T>, wait: Wait) -> bool {
        if state.eos_state != EosState::None {
            return false;
        }
        if let Some(pending) = state.pending.take() {
            if state.queue.is_empty() {
                if pending.eos {
                    state.eos_state = EosState::Received;
                }
                Self::queue_local(state, pending);
                return true;
            }
            state.pending = Some(pending);
            return false;
        }
        let Some(port) = self.inner.port.upgrade() else { return false };
        let Some(packet) = port.next_packet(wait, Some(&self.inner.stream_id)).await else {
            return false;
        };
        let bridgeable = !(packet.sri_changed || packet.input_queue_flushed);
        if state.queue.is_empty() || bridgeable {
            if packet.eos {
                state.eos_state = EosState::Received;
            }
            Self::queue_local(state, packet);
            true
        } else {
            // Hold back until the consumer drains the data queued before
            // this indication
            trace!(stream = %self.inner.stream_id, "holding back flagged packet");
            state.pending = Some(packet);
            false
        }
    }

    fn queue_local(state: &mut ReadState<T>, packet: Packet<T>) {
        if packet.eos && packet.buffer.is_empty() {
            // Data-less end-of-stream folds onto whatever is already
            // queued; with nothing queued the end is reached immediately
            if let Some(last) = state.queue.back_mut() {
                last.eos = true;
            } else {
                state.eos_state = EosState::Reached;
            }
            return;
        }
        state.scalars_queued += packet.buffer.len();
        state.queue.push_back(packet);
    }

    /// Fold a zero-length indication packet at the front of the queue into
    /// the packet behind it, so reads always start on data.
    fn normalize_front(state: &mut ReadState<T>) {
        while state.queue.len() > 1 {
            let front_is_marker = state
                .queue
                .front()
                .is_some_and(|p| p.buffer.is_empty() && !p.eos);
            if !front_is_marker {
                break;
            }
            let Some(marker) = state.queue.pop_front() else { break };
            if let Some(next) = state.queue.front_mut() {
                next.sri_changed |= marker.sri_changed;
                next.input_queue_flushed |= marker.input_queue_flushed;
                next.eos |= marker.eos;
            }
        }
    }

    /// Contiguous scalars readable from the current position without
    /// crossing a packet that carries indications.
    fn available_to_boundary(state: &ReadState<T>) -> usize {
        let mut scalars = 0usize;
        for (index, packet) in state.queue.iter().enumerate() {
            if index > 0 && (packet.sri_changed || packet.input_queue_flushed) {
                break;
            }
            let start = if index == 0 { state.scalar_offset } else { 0 };
            scalars += packet.buffer.len() - start;
        }
        scalars
    }

    fn assemble_block(
        &self,
        state: &mut ReadState<T>,
        take_s: usize,
        consume_s: usize,
    ) -> Option<DataBlock<T>> {
        let front = state.queue.front()?;
        let front_sri = front.sri.clone();
        let front_avail = front.buffer.len() - state.scalar_offset;

        let mut flags = SriChangeFlags::NONE;
        if state.new_stream {
            flags |= SriChangeFlags::STREAMID;
        }
        if front.sri_changed {
            flags |= StreamDescriptor::compare_fields(&state.sri, &front_sri);
        }
        let flushed = front.input_queue_flushed;

        let buffer = if take_s <= front_avail {
            front.buffer.slice(state.scalar_offset, state.scalar_offset + take_s)
        } else {
            let mut data: Vec<T> = Vec::with_capacity(take_s);
            for (index, packet) in state.queue.iter().enumerate() {
                if data.len() >= take_s {
                    break;
                }
                let start = if index == 0 { state.scalar_offset } else { 0 };
                let slice = &packet.buffer.as_slice()[start..];
                let n = slice.len().min(take_s - data.len());
                data.extend_from_slice(&slice[..n]);
            }
            SampleBuffer::from_vec(data)
        };

        let mut block = DataBlock::new(buffer, front_sri.clone());
        block.set_sri_change_flags(flags);
        block.set_input_queue_flushed(flushed);

        // One timestamp per contributing packet; the first is advanced by
        // the scalars already consumed from that packet and marked
        // synthetic when it no longer matches a received timestamp
        let mut output_offset = 0usize;
        for (index, packet) in state.queue.iter().enumerate() {
            if output_offset >= take_s {
                break;
            }
            let start = if index == 0 { state.scalar_offset } else { 0 };
            let contributed = (packet.buffer.len() - start).min(take_s - output_offset);
            if contributed == 0 {
                continue;
            }
            let item = if packet.sri.complex { 2 } else { 1 };
            let time_offset = start as f64 * packet.sri.xdelta / item as f64;
            block.add_timestamp(SampleTimestamp {
                time: packet.time + time_offset,
                offset: output_offset / item,
                synthetic: time_offset > 0.0,
            });
            output_offset += contributed;
        }

        // The indications are now surfaced; clear them and move the
        // change baseline forward
        if let Some(front) = state.queue.front_mut() {
            front.sri_changed = false;
            front.input_queue_flushed = false;
        }
        state.sri = front_sri;
        state.new_stream = false;

        if consume_s > 0 {
            Self::consume_data(state, consume_s);
        }
        Some(block)
    }

    fn consume_data(state: &mut ReadState<T>, mut count: usize) {
        while count > 0 {
            let Some(front) = state.queue.front() else { break };
            let front_len = front.buffer.len();
            let avail = front_len - state.scalar_offset;
            if avail == 0 {
                // Exhausted or zero-length packet in the path of a skip
                state.queue.pop_front();
                state.scalar_offset = 0;
                continue;
            }
            let pass = count.min(avail);
            state.scalar_offset += pass;
            state.scalars_queued -= pass;
            count -= pass;
            if state.scalar_offset >= front_len {
                state.queue.pop_front();
                state.scalar_offset = 0;
            }
        }
    }

    /// Advance the end-of-stream machine and retire the stream from its
    /// port once the end has been reached and reported.
    fn maybe_report_eos(&self, state: &mut ReadState<T>) {
        if state.eos_state == EosState::Received
            && state.scalars_queued == 0
            && state.pending.is_none()
        {
            // Any remaining zero-length indications are moot past the end
            state.queue.clear();
            state.eos_state = EosState::Reached;
        }
        if state.eos_state == EosState::Reached {
            trace!(stream = %self.inner.stream_id, "end-of-stream reported");
            state.eos_state = EosState::Reported;
            if let Some(port) = self.inner.port.upgrade() {
                port.remove_stream(&self.inner.stream_id);
            }
        }
    }
}
