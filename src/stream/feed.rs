//! `futures::Stream` adapter over an input stream.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use pin_project_lite::pin_project;

use crate::block::DataBlock;
use crate::stream::InputStream;
use crate::types::Element;

type ReadFuture<T> = Pin<Box<dyn Future<Output = Option<DataBlock<T>>> + Send>>;

pin_project! {
    /// Yields one [`DataBlock`] per arriving packet and ends at
    /// end-of-stream, so a consumer can drive a stream with ordinary
    /// `StreamExt` combinators.
    pub struct BlockFeed<T: Element> {
        stream: InputStream<T>,
        in_flight: Option<ReadFuture<T>>,
    }
}

impl<T: Element> BlockFeed<T> {
    pub fn new(stream: InputStream<T>) -> Self {
        BlockFeed { stream, in_flight: None }
    }
}

impl<T: Element> Stream for BlockFeed<T> {
    type Item = DataBlock<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<DataBlock<T>>> {
        let this = self.project();
        loop {
            if let Some(fut) = this.in_flight.as_mut() {
                return match fut.as_mut().poll(cx) {
                    Poll::Ready(block) => {
                        *this.in_flight = None;
                        Poll::Ready(block)
                    }
                    Poll::Pending => Poll::Pending,
                };
            }
            let stream = this.stream.clone();
            *this.in_flight = Some(Box::pin(async move { stream.read_packet().await }));
        }
    }
}

impl<T: Element> InputStream<T> {
    /// Consume this handle as a stream of blocks.
    pub fn into_blocks(self) -> BlockFeed<T> {
        BlockFeed::new(self)
    }
}
