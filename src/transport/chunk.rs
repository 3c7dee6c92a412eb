//! Splits oversized packets to fit a transport's payload cap.
//!
//! Chunk boundaries are quantized to whole samples, and for framed
//! streams to whole frames, so no consumer ever sees a torn sample.
//! End-of-stream rides only on the final chunk and follow-on chunks get
//! timestamps advanced by the samples already sent.

use async_trait::async_trait;
use tracing::trace;

use crate::error::Result;
use crate::sri::StreamDescriptor;
use crate::transport::{OutPacket, OutputTransport};
use crate::types::Element;

pub struct ChunkedTransport<T: Element> {
    inner: Box<dyn OutputTransport<T>>,
    max_scalars: usize,
}

impl<T: Element> ChunkedTransport<T> {
    pub fn new(inner: Box<dyn OutputTransport<T>>, max_scalars: usize) -> Self {
        ChunkedTransport { inner, max_scalars: max_scalars.max(1) }
    }

    /// Wrap a transport in chunking when it declares a payload cap.
    pub fn wrap_if_bounded(inner: Box<dyn OutputTransport<T>>) -> Box<dyn OutputTransport<T>> {
        match inner.max_payload_scalars() {
            Some(max) => Box::new(ChunkedTransport::new(inner, max)),
            None => inner,
        }
    }

    /// Scalars per indivisible unit for this stream: a sample, or a
    /// whole frame for framed element kinds.
    fn unit_scalars(sri: &StreamDescriptor) -> usize {
        if !T::KIND.framed() {
            // Degenerate kinds move raw scalars with no sample structure
            return 1;
        }
        let per_sample = if T::KIND.supports_complex() && sri.complex { 2 } else { 1 };
        if sri.subsize > 0 {
            sri.subsize as usize * per_sample
        } else {
            per_sample
        }
    }
}

#[async_trait]
impl<T: Element> OutputTransport<T> for ChunkedTransport<T> {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()> {
        self.inner.push_sri(sri).await
    }

    async fn send_packet(&self, packet: OutPacket<'_, T>) -> Result<()> {
        if packet.data.len() <= self.max_scalars {
            return self.inner.send_packet(packet).await;
        }

        let unit = Self::unit_scalars(packet.sri);
        // Whole units per chunk; a unit larger than the cap goes out
        // oversized rather than torn
        let chunk_scalars = (self.max_scalars - self.max_scalars % unit).max(unit);
        let total = packet.data.len();
        trace!(stream = %packet.stream_id, total, chunk_scalars, "chunking packet");

        let sample_scalars =
            if T::KIND.supports_complex() && packet.sri.complex { 2 } else { 1 };
        let mut offset = 0usize;
        while offset < total {
            let end = (offset + chunk_scalars).min(total);
            let samples_before = offset / sample_scalars;
            self.inner
                .send_packet(OutPacket {
                    data: packet.data.slice(offset, end),
                    time: packet.time + samples_before as f64 * packet.sri.xdelta,
                    eos: packet.eos && end == total,
                    stream_id: packet.stream_id,
                    sri: packet.sri,
                })
                .await?;
            offset = end;
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PrecisionTime, SampleBuffer};
    use std::sync::Mutex;

    struct Recorder {
        sent: Mutex<Vec<(usize, bool, PrecisionTime)>>,
    }

    #[async_trait]
    impl OutputTransport<f32> for Recorder {
        fn kind(&self) -> &'static str {
            "test"
        }

        async fn push_sri(&self, _sri: &StreamDescriptor) -> Result<()> {
            Ok(())
        }

        async fn send_packet(&self, packet: OutPacket<'_, f32>) -> Result<()> {
            self.sent.lock().unwrap().push((packet.data.len(), packet.eos, packet.time));
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn harness(max: usize) -> (ChunkedTransport<f32>, std::sync::Arc<Recorder>) {
        let recorder = std::sync::Arc::new(Recorder { sent: Mutex::new(Vec::new()) });
        let boxed: Box<dyn OutputTransport<f32>> = Box::new(RecorderRef(recorder.clone()));
        (ChunkedTransport::new(boxed, max), recorder)
    }

    struct RecorderRef(std::sync::Arc<Recorder>);

    #[async_trait]
    impl OutputTransport<f32> for RecorderRef {
        fn kind(&self) -> &'static str {
            "test"
        }

        async fn push_sri(&self, sri: &StreamDescriptor) -> Result<()> {
            self.0.push_sri(sri).await
        }

        async fn send_packet(&self, packet: OutPacket<'_, f32>) -> Result<()> {
            self.0.send_packet(packet).await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    #[tokio::test]
    async fn splits_on_cap_with_eos_on_last_chunk() {
        let (chunker, recorder) = harness(4);
        let sri = StreamDescriptor::new("s");
        chunker
            .send_packet(OutPacket {
                data: SampleBuffer::from_vec((0..10).map(|v| v as f32).collect()),
                time: PrecisionTime::new(0.0, 0.0),
                eos: true,
                stream_id: "s",
                sri: &sri,
            })
            .await
            .unwrap();
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.iter().map(|s| s.0).collect::<Vec<_>>(), vec![4, 4, 2]);
        assert_eq!(sent.iter().map(|s| s.1).collect::<Vec<_>>(), vec![false, false, true]);
    }

    #[tokio::test]
    async fn complex_chunks_hold_whole_samples() {
        let (chunker, recorder) = harness(5);
        let mut sri = StreamDescriptor::new("c");
        sri.complex = true;
        sri.xdelta = 0.5;
        chunker
            .send_packet(OutPacket {
                data: SampleBuffer::from_vec((0..12).map(|v| v as f32).collect()),
                time: PrecisionTime::new(100.0, 0.0),
                eos: false,
                stream_id: "c",
                sri: &sri,
            })
            .await
            .unwrap();
        let sent = recorder.sent.lock().unwrap();
        // Cap of 5 scalars rounds down to 4 (two complex samples)
        assert_eq!(sent.iter().map(|s| s.0).collect::<Vec<_>>(), vec![4, 4, 4]);
        // Second chunk starts two samples in
        assert_eq!(sent[1].2, PrecisionTime::new(101.0, 0.0));
    }

    #[tokio::test]
    async fn framed_chunks_hold_whole_frames() {
        let (chunker, recorder) = harness(7);
        let mut sri = StreamDescriptor::new("f");
        sri.subsize = 3;
        chunker
            .send_packet(OutPacket {
                data: SampleBuffer::from_vec((0..9).map(|v| v as f32).collect()),
                time: PrecisionTime::new(0.0, 0.0),
                eos: false,
                stream_id: "f",
                sri: &sri,
            })
            .await
            .unwrap();
        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.iter().map(|s| s.0).collect::<Vec<_>>(), vec![6, 3]);
    }

    #[tokio::test]
    async fn small_packets_pass_through_untouched() {
        let (chunker, recorder) = harness(100);
        let sri = StreamDescriptor::new("s");
        chunker
            .send_packet(OutPacket {
                data: SampleBuffer::from_vec(vec![1.0, 2.0]),
                time: PrecisionTime::new(0.0, 0.0),
                eos: false,
                stream_id: "s",
                sri: &sri,
            })
            .await
            .unwrap();
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);
    }
}
