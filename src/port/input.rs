//! Consumer-side port: bounded packet queue and stream demultiplexing.
//!
//! An [`InputPort`] owns one bounded queue for all streams flowing into a
//! component. Arriving packets are tagged with the stream's descriptor
//! state (change pending, queue flushed) and demultiplexed to
//! [`InputStream`](crate::stream::InputStream) cursors by stream ID.
//!
//! Overflow policy depends on the active descriptors: when any active
//! stream is marked `blocking`, producers wait for queue space; otherwise
//! the queue is flushed: data packets are dropped but the most recent
//! pending end-of-stream and metadata-change indications per stream are
//! preserved so consumers still observe them.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::sri::StreamDescriptor;
use crate::stats::{PortStatistics, StatsReport};
use crate::stream::InputStream;
use crate::types::{Element, PrecisionTime, SampleBuffer, Wait};

/// Default queue high-water mark, in packets.
pub const DEFAULT_QUEUE_DEPTH: usize = 100;

/// One transport unit on the input queue.
#[derive(Debug, Clone)]
pub struct Packet<T: Element> {
    pub buffer: SampleBuffer<T>,
    pub time: PrecisionTime,
    pub eos: bool,
    pub stream_id: String,
    /// Descriptor snapshot taken at enqueue time
    pub sri: StreamDescriptor,
    /// A metadata change was pending when this packet arrived
    pub sri_changed: bool,
    /// The queue was flushed before this packet was surfaced
    pub input_queue_flushed: bool,
}

/// Port activity, derived from queue depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Queue empty
    Idle,
    /// Queue partially full
    Active,
    /// Queue at the high-water mark
    Busy,
}

struct QueueState<T: Element> {
    queue: VecDeque<Packet<T>>,
    max_depth: usize,
    /// True while any active descriptor requests blocking backpressure
    blocking: bool,
}

struct SriEntry {
    sri: StreamDescriptor,
    /// A change is pending; the next packet surfaces it
    changed: bool,
    /// An end-of-stream packet for this instance has been queued; later
    /// announcements and data under the same ID belong to a successor
    eos_queued: bool,
}

struct SriState {
    table: HashMap<String, SriEntry>,
}

struct StreamTable<T: Element> {
    active: HashMap<String, InputStream<T>>,
    /// Streams whose ID collides with an active stream that has received
    /// EOS but not finished draining; promoted on removal of the old one
    pending: Vec<(String, InputStream<T>)>,
}

/// Consumer-side port owning the packet queue for all inbound streams.
pub struct InputPort<T: Element> {
    name: String,
    self_ref: Weak<InputPort<T>>,
    queue: Mutex<QueueState<T>>,
    sri_state: Mutex<SriState>,
    streams: Mutex<StreamTable<T>>,
    data_available: Notify,
    queue_available: Notify,
    cancel: Mutex<CancellationToken>,
    stats: Mutex<PortStatistics>,
}

impl<T: Element> InputPort<T> {
    /// Create a port with the default queue depth.
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        debug!(port = %name, max_depth = DEFAULT_QUEUE_DEPTH, "creating input port");
        Arc::new_cyclic(|self_ref| InputPort {
            stats: Mutex::new(PortStatistics::new(name.clone(), std::mem::size_of::<T>())),
            name,
            self_ref: self_ref.clone(),
            queue: Mutex::new(QueueState {
                queue: VecDeque::new(),
                max_depth: DEFAULT_QUEUE_DEPTH,
                blocking: false,
            }),
            sri_state: Mutex::new(SriState { table: HashMap::new() }),
            streams: Mutex::new(StreamTable { active: HashMap::new(), pending: Vec::new() }),
            data_available: Notify::new(),
            queue_available: Notify::new(),
            cancel: Mutex::new(CancellationToken::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current queue high-water mark.
    pub fn max_queue_depth(&self) -> usize {
        self.queue.lock().unwrap().max_depth
    }

    pub fn set_max_queue_depth(&self, depth: usize) {
        self.queue.lock().unwrap().max_depth = depth;
    }

    pub fn current_queue_depth(&self) -> usize {
        self.queue.lock().unwrap().queue.len()
    }

    /// Port activity derived from queue depth.
    pub fn state(&self) -> PortState {
        let queue = self.queue.lock().unwrap();
        if queue.queue.len() >= queue.max_depth {
            PortState::Busy
        } else if queue.queue.is_empty() {
            PortState::Idle
        } else {
            PortState::Active
        }
    }

    /// Snapshot of the port's throughput statistics.
    pub fn statistics(&self) -> StatsReport {
        self.stats.lock().unwrap().retrieve()
    }

    pub fn enable_stats(&self, enabled: bool) {
        self.stats.lock().unwrap().set_enabled(enabled);
    }

    /// Descriptors of all streams the port currently knows about.
    pub fn active_sris(&self) -> Vec<StreamDescriptor> {
        self.sri_state.lock().unwrap().table.values().map(|entry| entry.sri.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Ingress
    // ------------------------------------------------------------------

    /// Announce (or re-announce) stream metadata.
    ///
    /// A first announcement for an unseen stream ID creates the stream; a
    /// changed announcement for a known ID marks the change pending so the
    /// next packet surfaces it. An announcement arriving after the current
    /// instance's end-of-stream starts a successor instance, queued until
    /// the old one finishes draining.
    pub fn push_sri(&self, sri: &StreamDescriptor) {
        if sri.blocking {
            self.queue.lock().unwrap().blocking = true;
        }

        let stream_id = sri.stream_id().to_string();
        let created = {
            let mut state = self.sri_state.lock().unwrap();
            match state.table.get_mut(&stream_id) {
                None => {
                    debug!(port = %self.name, stream = %stream_id, "new stream descriptor");
                    state.table.insert(
                        stream_id.clone(),
                        SriEntry { sri: sri.clone(), changed: true, eos_queued: false },
                    );
                    true
                }
                Some(entry) if entry.eos_queued => {
                    debug!(port = %self.name, stream = %stream_id,
                           "descriptor for successor of an ended stream");
                    *entry = SriEntry { sri: sri.clone(), changed: true, eos_queued: false };
                    true
                }
                Some(entry) => {
                    if !StreamDescriptor::compare_fields(&entry.sri, sri).is_empty() {
                        trace!(port = %self.name, stream = %stream_id, "descriptor changed");
                        entry.sri.update(sri);
                        entry.changed = true;
                    }
                    false
                }
            }
        };
        if created {
            self.create_stream(&stream_id, sri.clone());
        }
    }

    /// Enqueue a packet for a stream.
    ///
    /// Packets for disabled streams are discarded (a disabled stream's EOS
    /// still tears the stream down). When the queue is at its high-water
    /// mark this either waits for space (blocking mode) or flushes.
    pub async fn queue_packet(
        &self,
        buffer: SampleBuffer<T>,
        time: PrecisionTime,
        eos: bool,
        stream_id: &str,
    ) -> Result<()> {
        if !self.is_stream_enabled(stream_id) {
            trace!(port = %self.name, stream = %stream_id, "discarding packet for disabled stream");
            if eos {
                // Acknowledge end-of-stream so the disabled stream is torn
                // down and a successor with the same ID can activate
                if let Some(entry) = self.sri_state.lock().unwrap().table.get_mut(stream_id) {
                    entry.eos_queued = true;
                }
                self.retire_descriptor(stream_id);
                self.remove_stream(stream_id);
            }
            return Ok(());
        }

        if self.max_queue_depth() == 0 {
            return Ok(());
        }

        let (sri, sri_changed) = self.consume_sri_state(stream_id, eos);

        let mut packet = Packet {
            buffer,
            time,
            eos,
            stream_id: stream_id.to_string(),
            sri,
            sri_changed,
            input_queue_flushed: false,
        };

        loop {
            let notified = self.queue_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.queue.lock().unwrap();
                if queue.queue.len() < queue.max_depth {
                    self.push_locked(&mut queue, packet);
                    break;
                }
                if !queue.blocking {
                    self.flush_locked(&mut queue, &mut packet);
                    self.push_locked(&mut queue, packet);
                    break;
                }
                // Blocking mode: wait for the consumer to free space
            }

            let cancel = self.cancel_token();
            tokio::select! {
                () = &mut notified => {}
                () = cancel.cancelled() => {
                    trace!(port = %self.name, "queue_packet released by port stop");
                    return Ok(());
                }
            }
        }

        self.data_available.notify_waiters();
        Ok(())
    }

    fn push_locked(&self, queue: &mut QueueState<T>, packet: Packet<T>) {
        let depth_fraction = (queue.queue.len() + 1) as f64 / queue.max_depth.max(1) as f64;
        self.stats.lock().unwrap().update(
            packet.buffer.len(),
            depth_fraction,
            &packet.stream_id,
            packet.eos,
        );
        trace!(port = %self.name, stream = %packet.stream_id, depth = queue.queue.len() + 1,
               eos = packet.eos, "enqueued packet");
        queue.queue.push_back(packet);
    }

    /// Drop all queued packets, preserving each affected stream's most
    /// recent pending EOS and metadata-change indication. The incoming
    /// packet's stream folds its preserved flags into the incoming packet;
    /// other streams get a synthesized zero-length control packet.
    fn flush_locked(&self, queue: &mut QueueState<T>, incoming: &mut Packet<T>) {
        warn!(port = %self.name, dropped = queue.queue.len(), "input queue flush");

        #[derive(Default)]
        struct Pendings {
            eos: bool,
            sri_changed: bool,
        }
        let mut preserved: HashMap<String, Pendings> = HashMap::new();
        let mut order: Vec<String> = Vec::new();
        for packet in queue.queue.drain(..) {
            let entry = preserved.entry(packet.stream_id.clone()).or_insert_with(|| {
                order.push(packet.stream_id.clone());
                Pendings::default()
            });
            entry.eos |= packet.eos;
            entry.sri_changed |= packet.sri_changed;
        }
        self.queue_available.notify_waiters();

        incoming.input_queue_flushed = true;
        if let Some(own) = preserved.remove(&incoming.stream_id) {
            incoming.eos |= own.eos;
            incoming.sri_changed |= own.sri_changed;
        }

        let sri_state = self.sri_state.lock().unwrap();
        for stream_id in order {
            let Some(flags) = preserved.get(&stream_id) else { continue };
            if !flags.eos && !flags.sri_changed {
                // Nothing to preserve for a stream that only lost data
                continue;
            }
            let sri = sri_state
                .table
                .get(&stream_id)
                .map(|entry| entry.sri.clone())
                .unwrap_or_else(|| StreamDescriptor::new(stream_id.clone()));
            queue.queue.push_back(Packet {
                buffer: SampleBuffer::empty(),
                time: PrecisionTime::not_set(),
                eos: flags.eos,
                stream_id,
                sri,
                sri_changed: flags.sri_changed,
                input_queue_flushed: true,
            });
        }
    }

    fn consume_sri_state(&self, stream_id: &str, eos: bool) -> (StreamDescriptor, bool) {
        let created;
        let result;
        {
            let mut state = self.sri_state.lock().unwrap();
            match state.table.get_mut(stream_id) {
                Some(entry) if entry.eos_queued => {
                    // Data after the current instance's end-of-stream with
                    // no fresh announcement; the existing descriptor seeds
                    // a successor instance
                    debug!(port = %self.name, stream = %stream_id,
                           "data for successor of an ended stream");
                    entry.changed = false;
                    entry.eos_queued = eos;
                    result = (entry.sri.clone(), true);
                    created = Some(entry.sri.clone());
                }
                Some(entry) => {
                    result = (entry.sri.clone(), entry.changed);
                    entry.changed = false;
                    entry.eos_queued |= eos;
                    created = None;
                }
                None => {
                    // Data arrived before any descriptor announcement;
                    // register a default descriptor and flag the change
                    warn!(port = %self.name, stream = %stream_id,
                          "received data for stream with no descriptor");
                    let sri = StreamDescriptor::new(stream_id);
                    state.table.insert(
                        stream_id.to_string(),
                        SriEntry { sri: sri.clone(), changed: false, eos_queued: eos },
                    );
                    result = (sri.clone(), true);
                    created = Some(sri);
                }
            }
        }
        if let Some(sri) = created {
            self.create_stream(stream_id, sri);
        }
        result
    }

    // ------------------------------------------------------------------
    // Egress
    // ------------------------------------------------------------------

    /// Fetch the next packet, optionally filtered by stream ID.
    ///
    /// `Wait::Poll` returns immediately; `Wait::Indefinite` blocks until a
    /// packet arrives or the port is stopped.
    pub async fn get_packet(&self, wait: Wait, stream_id: Option<&str>) -> Option<Packet<T>> {
        self.next_packet(wait, stream_id).await
    }

    pub(crate) async fn next_packet(
        &self,
        wait: Wait,
        stream_id: Option<&str>,
    ) -> Option<Packet<T>> {
        let cancel = self.cancel_token();
        if cancel.is_cancelled() {
            return None;
        }
        let deadline = wait.deadline();

        loop {
            let notified = self.data_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(packet) = self.try_fetch(stream_id) {
                self.queue_available.notify_waiters();
                self.handle_eos_bookkeeping(&packet);
                return Some(packet);
            }

            if wait.is_poll() {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep_until(deadline) => return None,
                    }
                }
                None => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    fn try_fetch(&self, stream_id: Option<&str>) -> Option<Packet<T>> {
        let mut queue = self.queue.lock().unwrap();
        match stream_id {
            None => queue.queue.pop_front(),
            Some(id) => {
                let pos = queue.queue.iter().position(|p| p.stream_id == id)?;
                queue.queue.remove(pos)
            }
        }
    }

    /// On end-of-stream, retire the descriptor and drop port-level
    /// blocking if no remaining descriptor requests it.
    fn handle_eos_bookkeeping(&self, packet: &Packet<T>) {
        if !packet.eos {
            return;
        }
        self.retire_descriptor(&packet.stream_id);
    }

    fn retire_descriptor(&self, stream_id: &str) {
        let mut turn_off_blocking = false;
        {
            let mut state = self.sri_state.lock().unwrap();
            // A successor instance may have replaced the entry already;
            // its descriptor must survive the old instance's end
            let ended = state.table.get(stream_id).is_some_and(|entry| entry.eos_queued);
            if ended {
                if let Some(entry) = state.table.remove(stream_id) {
                    if entry.sri.blocking {
                        turn_off_blocking =
                            !state.table.values().any(|other| other.sri.blocking);
                    }
                }
            }
        }
        if turn_off_blocking {
            self.queue.lock().unwrap().blocking = false;
        }
    }

    /// Wait until any packet is queued and report its stream ID without
    /// dequeuing it.
    async fn peek_stream_id(&self, wait: Wait) -> Option<String> {
        let cancel = self.cancel_token();
        let deadline = wait.deadline();
        loop {
            let notified = self.data_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(id) = {
                let queue = self.queue.lock().unwrap();
                queue.queue.front().map(|p| p.stream_id.clone())
            } {
                return Some(id);
            }

            if wait.is_poll() {
                return None;
            }
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return None,
                        () = tokio::time::sleep_until(deadline) => return None,
                    }
                }
                None => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    /// Scalars queued for a stream, stopping at the first packet carrying
    /// a metadata change or flush marker (unless it is the first packet
    /// considered), divided down to samples for complex streams.
    pub(crate) fn samples_available(&self, stream_id: &str, mut first: bool) -> usize {
        let queue = self.queue.lock().unwrap();
        let mut scalars = 0usize;
        let mut item_size = 1usize;
        for packet in queue.queue.iter() {
            if packet.stream_id != stream_id {
                continue;
            }
            if (packet.sri_changed || packet.input_queue_flushed) && !first {
                break;
            }
            first = false;
            if packet.sri.complex {
                item_size = 2;
            }
            scalars += packet.buffer.len();
        }
        scalars / item_size
    }

    /// Drop queued packets for one stream, stopping after (and including)
    /// an end-of-stream packet: anything behind it belongs to the next
    /// stream instance.
    pub(crate) fn discard_packets_for_stream(&self, stream_id: &str) {
        let mut queue = self.queue.lock().unwrap();
        let mut kept = VecDeque::with_capacity(queue.queue.len());
        let mut stopped = false;
        for packet in queue.queue.drain(..) {
            if !stopped && packet.stream_id == stream_id {
                self.queue_available.notify_waiters();
                if packet.eos {
                    stopped = true;
                }
                continue;
            }
            kept.push_back(packet);
        }
        queue.queue = kept;
    }

    // ------------------------------------------------------------------
    // Stream discovery
    // ------------------------------------------------------------------

    fn create_stream(&self, stream_id: &str, sri: StreamDescriptor) {
        let Some(port) = self.self_ref.upgrade() else { return };
        let stream = InputStream::new(sri, &port);
        let mut table = self.streams.lock().unwrap();
        if table.active.contains_key(stream_id) {
            // Same ID as an active stream that has not yet drained its
            // end-of-stream; activate once the old one is removed
            debug!(port = %self.name, stream = %stream_id, "queueing pending stream");
            table.pending.push((stream_id.to_string(), stream));
        } else {
            debug!(port = %self.name, stream = %stream_id, "creating stream");
            table.active.insert(stream_id.to_string(), stream);
            self.data_available.notify_waiters();
        }
    }

    /// Remove a drained stream; a pending stream with the same ID becomes
    /// active.
    pub(crate) fn remove_stream(&self, stream_id: &str) {
        let mut table = self.streams.lock().unwrap();
        debug!(port = %self.name, stream = %stream_id, "removing stream");
        table.active.remove(stream_id);
        if let Some(pos) = table.pending.iter().position(|(id, _)| id == stream_id) {
            let (id, stream) = table.pending.remove(pos);
            debug!(port = %self.name, stream = %id, "activating pending stream");
            table.active.insert(id, stream);
        }
        self.data_available.notify_waiters();
    }

    pub(crate) fn is_stream_enabled(&self, stream_id: &str) -> bool {
        let table = self.streams.lock().unwrap();
        if table.pending.iter().any(|(id, _)| id == stream_id) {
            // The active stream got EOS; arriving packets belong to the
            // pending instance and must not be dropped
            return true;
        }
        match table.active.get(stream_id) {
            Some(stream) => stream.enabled(),
            None => true,
        }
    }

    /// Look up an active stream by ID.
    pub fn stream(&self, stream_id: &str) -> Option<InputStream<T>> {
        self.streams.lock().unwrap().active.get(stream_id).cloned()
    }

    /// All currently active streams.
    pub fn streams(&self) -> Vec<InputStream<T>> {
        self.streams.lock().unwrap().active.values().cloned().collect()
    }

    /// The stream that should be serviced next: one with buffered data if
    /// any, otherwise the owner of the next queued packet (waiting per
    /// `wait` for one to arrive).
    pub async fn current_stream(&self, wait: Wait) -> Option<InputStream<T>> {
        for stream in self.streams() {
            if stream.has_buffered_data().await {
                return Some(stream);
            }
        }
        let stream_id = self.peek_stream_id(wait).await?;
        self.stream(&stream_id)
    }

    /// Wait for any stream to become ready. With `samples == 0` a stream
    /// is ready when it has any data pending; otherwise when at least
    /// `samples` samples are available.
    pub async fn poll_streams(&self, samples: usize, wait: Wait) -> Vec<InputStream<T>> {
        self.poll_streams_filtered(None, samples, wait).await
    }

    /// Like [`poll_streams`](Self::poll_streams), restricted to a
    /// candidate set.
    pub async fn poll_streams_in(
        &self,
        pollset: &[InputStream<T>],
        samples: usize,
        wait: Wait,
    ) -> Vec<InputStream<T>> {
        self.poll_streams_filtered(Some(pollset), samples, wait).await
    }

    async fn poll_streams_filtered(
        &self,
        pollset: Option<&[InputStream<T>]>,
        samples: usize,
        wait: Wait,
    ) -> Vec<InputStream<T>> {
        let cancel = self.cancel_token();
        let deadline = wait.deadline();
        loop {
            let notified = self.data_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let candidates: Vec<InputStream<T>> = match pollset {
                Some(set) => set.to_vec(),
                None => self.streams(),
            };
            let mut ready = Vec::new();
            for stream in candidates {
                let is_ready = if samples == 0 {
                    stream.ready().await
                } else {
                    stream.samples_available().await >= samples
                };
                if is_ready {
                    ready.push(stream);
                }
            }
            if !ready.is_empty() {
                return ready;
            }

            if wait.is_poll() {
                return ready;
            }
            match deadline {
                Some(deadline) => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return Vec::new(),
                        () = tokio::time::sleep_until(deadline) => return Vec::new(),
                    }
                }
                None => {
                    tokio::select! {
                        () = &mut notified => {}
                        () = cancel.cancelled() => return Vec::new(),
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Backpressure control
    // ------------------------------------------------------------------

    fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().unwrap().clone()
    }

    /// Stop accepting and delivering packets: wakes every blocked waiter
    /// so it observes the stopped state and returns empty immediately.
    pub fn block(&self) {
        debug!(port = %self.name, "blocking port");
        self.cancel.lock().unwrap().cancel();
        self.data_available.notify_waiters();
        self.queue_available.notify_waiters();
    }

    /// Resume accepting and delivering packets.
    pub fn unblock(&self) {
        debug!(port = %self.name, "unblocking port");
        *self.cancel.lock().unwrap() = CancellationToken::new();
    }

    pub fn blocked(&self) -> bool {
        self.cancel.lock().unwrap().is_cancelled()
    }

    /// Alias used by component shutdown paths.
    pub fn stop_port(&self) {
        self.block();
    }

    /// Alias used by component startup paths.
    pub fn start_port(&self) {
        self.unblock();
    }
}

impl<T: Element> std::fmt::Debug for InputPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputPort")
            .field("name", &self.name)
            .field("depth", &self.current_queue_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet_data(n: usize) -> SampleBuffer<i16> {
        SampleBuffer::from_vec((0..n as i16).collect())
    }

    #[tokio::test]
    async fn poll_returns_none_on_empty_queue() {
        let port = InputPort::<i16>::new("in");
        assert!(port.get_packet(Wait::Poll, None).await.is_none());
    }

    #[tokio::test]
    async fn first_packet_without_sri_gets_default_descriptor() {
        let port = InputPort::<i16>::new("in");
        port.queue_packet(packet_data(4), PrecisionTime::now(), false, "orphan").await.unwrap();
        let packet = port.get_packet(Wait::Poll, None).await.expect("packet queued");
        assert_eq!(packet.stream_id, "orphan");
        assert!(packet.sri_changed, "implicit descriptor counts as a change");
        assert_eq!(packet.sri.xdelta, 1.0);
    }

    #[tokio::test]
    async fn stream_filter_skips_other_streams() {
        let port = InputPort::<i16>::new("in");
        port.push_sri(&StreamDescriptor::new("a"));
        port.push_sri(&StreamDescriptor::new("b"));
        port.queue_packet(packet_data(1), PrecisionTime::now(), false, "a").await.unwrap();
        port.queue_packet(packet_data(2), PrecisionTime::now(), false, "b").await.unwrap();

        let packet = port.get_packet(Wait::Poll, Some("b")).await.expect("packet for b");
        assert_eq!(packet.stream_id, "b");
        assert_eq!(packet.buffer.len(), 2);
        // Packet for "a" is still queued
        assert_eq!(port.current_queue_depth(), 1);
    }

    #[tokio::test]
    async fn overflow_flush_preserves_eos_and_sri_change() {
        let port = InputPort::<i16>::new("in");
        port.set_max_queue_depth(3);
        port.push_sri(&StreamDescriptor::new("a"));
        port.push_sri(&StreamDescriptor::new("b"));

        // Fill: data for "a", an EOS for "a", data for "b"
        port.queue_packet(packet_data(8), PrecisionTime::now(), false, "a").await.unwrap();
        port.queue_packet(packet_data(0), PrecisionTime::now(), true, "a").await.unwrap();
        port.queue_packet(packet_data(8), PrecisionTime::now(), false, "b").await.unwrap();
        // Overflow triggers the flush
        port.queue_packet(packet_data(8), PrecisionTime::now(), false, "b").await.unwrap();

        let mut saw_a_eos = false;
        let mut saw_b = false;
        while let Some(packet) = port.get_packet(Wait::Poll, None).await {
            if packet.stream_id == "a" {
                assert!(packet.eos, "a's pending EOS must survive the flush");
                assert!(packet.input_queue_flushed);
                saw_a_eos = true;
            } else {
                assert!(packet.input_queue_flushed);
                saw_b = true;
            }
        }
        assert!(saw_a_eos);
        assert!(saw_b);
    }

    #[tokio::test]
    async fn block_wakes_blocked_reader_with_none() {
        let port = InputPort::<i16>::new("in");
        let reader = {
            let port = port.clone();
            tokio::spawn(async move { port.get_packet(Wait::Indefinite, None).await })
        };
        tokio::task::yield_now().await;
        port.block();
        let result = reader.await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn timed_get_packet_returns_none_after_deadline() {
        let port = InputPort::<i16>::new("in");
        let start = tokio::time::Instant::now();
        let result =
            port.get_packet(Wait::Timeout(std::time::Duration::from_millis(20)), None).await;
        assert!(result.is_none());
        assert!(start.elapsed() >= std::time::Duration::from_millis(20));
    }

    #[tokio::test]
    async fn sri_after_eos_starts_a_successor_descriptor() {
        let port = InputPort::<i16>::new("in");
        port.push_sri(&StreamDescriptor::new("a"));
        port.queue_packet(packet_data(1), PrecisionTime::now(), true, "a").await.unwrap();

        // Announce again under the same ID before the EOS is dequeued
        let mut sri = StreamDescriptor::new("a");
        sri.xdelta = 2.0;
        port.push_sri(&sri);

        // Dequeuing the old instance's EOS must not retire the successor
        let packet = port.get_packet(Wait::Poll, None).await.expect("eos packet");
        assert!(packet.eos);
        let sris = port.active_sris();
        assert_eq!(sris.len(), 1);
        assert_eq!(sris[0].xdelta, 2.0);
    }

    #[tokio::test]
    async fn eos_retires_descriptor() {
        let port = InputPort::<i16>::new("in");
        port.push_sri(&StreamDescriptor::new("a"));
        assert_eq!(port.active_sris().len(), 1);
        port.queue_packet(packet_data(0), PrecisionTime::now(), true, "a").await.unwrap();
        let _ = port.get_packet(Wait::Poll, None).await.expect("eos packet");
        assert!(port.active_sris().is_empty());
    }
}
