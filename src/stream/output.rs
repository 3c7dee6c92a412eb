//! Producer-side stream handle: metadata, buffered writes, close.
//!
//! An [`OutputStream`] is a cloneable handle onto one stream published
//! through an [`OutputPort`](crate::port::OutputPort). Writes either pass
//! straight through or accumulate in an internal buffer that is emitted
//! in fixed-size packets; metadata changes take effect at packet
//! boundaries, so any buffered data is flushed before a change applies.

use std::sync::{Arc, Weak};

use tracing::debug;

use crate::error::{Result, StreamError};
use crate::port::OutputPort;
use crate::sri::StreamDescriptor;
use crate::types::{Element, PrecisionTime, SampleBuffer, SampleTimestamp};
use crate::Value;

struct OutState<T: Element> {
    sri: StreamDescriptor,
    buffer: Vec<T>,
    buffer_time: PrecisionTime,
    /// Internal buffer capacity in samples; zero writes through
    buffer_size: usize,
    closed: bool,
}

struct Inner<T: Element> {
    stream_id: String,
    port: Weak<OutputPort<T>>,
    state: tokio::sync::Mutex<OutState<T>>,
}

/// Cloneable producer-side handle onto one stream.
pub struct OutputStream<T: Element> {
    inner: Arc<Inner<T>>,
}

impl<T: Element> Clone for OutputStream<T> {
    fn clone(&self) -> Self {
        OutputStream { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Element> std::fmt::Debug for OutputStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream").field("stream_id", &self.inner.stream_id).finish()
    }
}

impl<T: Element> OutputStream<T> {
    pub(crate) fn new(sri: StreamDescriptor, port: Weak<OutputPort<T>>) -> Self {
        OutputStream {
            inner: Arc::new(Inner {
                stream_id: sri.stream_id().to_string(),
                port,
                state: tokio::sync::Mutex::new(OutState {
                    sri,
                    buffer: Vec::new(),
                    buffer_time: PrecisionTime::not_set(),
                    buffer_size: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    /// Snapshot of the stream's current descriptor.
    pub async fn sri(&self) -> StreamDescriptor {
        self.inner.state.lock().await.sri.clone()
    }

    // ------------------------------------------------------------------
    // Metadata
    // ------------------------------------------------------------------

    /// Replace all mutable descriptor fields at once. Buffered data is
    /// flushed first so the change lands on a packet boundary.
    pub async fn set_sri(&self, sri: &StreamDescriptor) -> Result<()> {
        self.modify_sri(|current| current.update(sri)).await
    }

    pub async fn set_xdelta(&self, xdelta: f64) -> Result<()> {
        self.modify_sri(|sri| sri.modify(|s| s.xdelta = xdelta)).await
    }

    pub async fn set_complex(&self, complex: bool) -> Result<()> {
        self.modify_sri(|sri| sri.modify(|s| s.complex = complex)).await
    }

    pub async fn set_subsize(&self, subsize: u32) -> Result<()> {
        self.modify_sri(|sri| sri.modify(|s| s.subsize = subsize)).await
    }

    pub async fn set_blocking(&self, blocking: bool) -> Result<()> {
        self.modify_sri(|sri| sri.modify(|s| s.blocking = blocking)).await
    }

    pub async fn set_xstart(&self, xstart: f64) -> Result<()> {
        self.modify_sri(|sri| sri.modify(|s| s.xstart = xstart)).await
    }

    pub async fn set_xunits(&self, xunits: i16) -> Result<()> {
        self.modify_sri(|sri| sri.modify(|s| s.xunits = xunits)).await
    }

    pub async fn set_keyword(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.modify_sri(|sri| sri.set_keyword(name, value)).await
    }

    pub async fn erase_keyword(&self, name: &str) -> Result<()> {
        self.modify_sri(|sri| sri.erase_keyword(name)).await
    }

    async fn modify_sri<F: FnOnce(&mut StreamDescriptor)>(&self, f: F) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.buffer.is_empty() {
            self.flush_locked(&mut state, false).await?;
        }
        f(&mut state.sri);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buffering
    // ------------------------------------------------------------------

    /// Internal buffer capacity in samples. Zero means writes pass
    /// straight through.
    pub async fn buffer_size(&self) -> usize {
        self.inner.state.lock().await.buffer_size
    }

    /// Resize the internal buffer. Shrinking below the amount currently
    /// buffered flushes first.
    pub async fn set_buffer_size(&self, samples: usize) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let scalars = samples * state.sri.scalars_per_sample();
        if state.buffer.len() > scalars && !state.buffer.is_empty() {
            self.flush_locked(&mut state, false).await?;
        }
        state.buffer_size = samples;
        Ok(())
    }

    /// Emit whatever is buffered as one packet.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.buffer.is_empty() {
            return Ok(());
        }
        self.flush_locked(&mut state, false).await
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write scalar data with the timestamp of its first sample.
    pub async fn write(&self, data: &[T], time: PrecisionTime) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        self.write_locked(&mut state, data, time).await
    }

    /// Write an already-materialized buffer, passing it through without
    /// copying when the stream is unbuffered. A shared-memory backed
    /// buffer keeps its backing allocation all the way to the wire, so
    /// forwarding a received block between shared-memory connections
    /// never touches the samples. With internal buffering active the
    /// data accumulates like a plain write.
    pub async fn write_buffer(&self, buffer: SampleBuffer<T>, time: PrecisionTime) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(StreamError::misuse(format!(
                "write to closed stream '{}'",
                self.inner.stream_id
            )));
        }
        if state.buffer_size == 0 {
            if !state.buffer.is_empty() {
                self.flush_locked(&mut state, false).await?;
            }
            return self.send(&mut state, buffer, time, false).await;
        }
        self.write_locked(&mut state, buffer.as_slice(), time).await
    }

    /// Write complex sample pairs. Fails on a stream whose descriptor is
    /// not marked complex.
    pub async fn write_complex(&self, data: &[[T; 2]], time: PrecisionTime) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if !state.sri.complex {
            return Err(StreamError::misuse(format!(
                "complex write to real stream '{}'",
                self.inner.stream_id
            )));
        }
        // Pairs are layout-compatible with an even run of scalars
        let scalars =
            unsafe { std::slice::from_raw_parts(data.as_ptr().cast::<T>(), data.len() * 2) };
        self.write_locked(&mut state, scalars, time).await
    }

    /// Write one span of data carrying several timestamps. Offsets are in
    /// samples; the list must start at offset 0, strictly increase, and
    /// stay inside the data.
    pub async fn write_multiple(&self, data: &[T], times: &[SampleTimestamp]) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let sps = state.sri.scalars_per_sample();
        let total_samples = data.len() / sps;

        let Some(first) = times.first() else {
            return Err(StreamError::misuse("write requires at least one timestamp"));
        };
        if first.offset != 0 {
            return Err(StreamError::misuse("first timestamp must be at sample offset 0"));
        }
        for pair in times.windows(2) {
            if pair[1].offset <= pair[0].offset {
                return Err(StreamError::misuse("timestamp offsets must strictly increase"));
            }
        }
        if let Some(last) = times.last() {
            if last.offset >= total_samples.max(1) {
                return Err(StreamError::misuse("timestamp offset past the end of the data"));
            }
        }

        for (index, ts) in times.iter().enumerate() {
            let start = ts.offset * sps;
            let end = match times.get(index + 1) {
                Some(next) => next.offset * sps,
                None => data.len(),
            };
            self.write_locked(&mut state, &data[start..end], ts.time).await?;
        }
        Ok(())
    }

    async fn write_locked(
        &self,
        state: &mut OutState<T>,
        data: &[T],
        time: PrecisionTime,
    ) -> Result<()> {
        if state.closed {
            return Err(StreamError::misuse(format!(
                "write to closed stream '{}'",
                self.inner.stream_id
            )));
        }
        let sps = state.sri.scalars_per_sample();
        let cap = state.buffer_size * sps;
        if cap == 0 {
            if !state.buffer.is_empty() {
                self.flush_locked(state, false).await?;
            }
            return self.send(state, SampleBuffer::from_slice(data), time, false).await;
        }

        let mut offset = 0usize;
        while offset < data.len() {
            if state.buffer.is_empty() {
                // First data into an empty buffer carries the buffer's
                // timestamp, advanced past what this call already emitted
                state.buffer_time =
                    time + (offset as f64 / sps as f64) * state.sri.xdelta;
            }
            let take = (cap - state.buffer.len()).min(data.len() - offset);
            state.buffer.extend_from_slice(&data[offset..offset + take]);
            offset += take;
            if state.buffer.len() >= cap {
                self.flush_locked(state, false).await?;
            }
        }
        Ok(())
    }

    async fn flush_locked(&self, state: &mut OutState<T>, eos: bool) -> Result<()> {
        let data = std::mem::take(&mut state.buffer);
        let time = state.buffer_time;
        self.send(state, SampleBuffer::from_vec(data), time, eos).await
    }

    async fn send(
        &self,
        state: &mut OutState<T>,
        buffer: SampleBuffer<T>,
        time: PrecisionTime,
        eos: bool,
    ) -> Result<()> {
        let Some(port) = self.inner.port.upgrade() else {
            return Err(StreamError::misuse(format!(
                "stream '{}' outlived its output port",
                self.inner.stream_id
            )));
        };
        port.send_packet(&state.sri, buffer, time, eos).await
    }

    /// End the stream: flush buffered data, emit end-of-stream, and
    /// retire the stream from its port. Further writes fail.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Ok(());
        }
        debug!(stream = %self.inner.stream_id, "closing output stream");
        let result = if state.buffer.is_empty() {
            self.send(&mut state, SampleBuffer::empty(), PrecisionTime::not_set(), true).await
        } else {
            self.flush_locked(&mut state, true).await
        };
        state.closed = true;
        if let Some(port) = self.inner.port.upgrade() {
            port.remove_stream(&self.inner.stream_id);
        }
        result
    }
}
