//! End-to-end pipelines over the in-process transport: an output port
//! connected to an input port in the same process, exercised through the
//! public stream APIs on both sides.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use sampleio::{
    FilterEntry, InputPort, OutputPort, PortEndpoint, PrecisionTime, SampleTimestamp,
    SriChangeFlags, StreamDescriptor, Wait,
};

fn ramp(start: f32, len: usize) -> Vec<f32> {
    (0..len).map(|i| start + i as f32).collect()
}

#[tokio::test]
async fn local_connection_streams_data_to_eos() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<f32>::new("samples_out");
    let input = InputPort::<f32>::new("samples_in");
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;
    assert_eq!(output.connection_kind("conn-1").await, Some("local"));

    let stream = output.create_stream("tone").await;
    stream.set_xdelta(0.5).await?;
    stream.write(&ramp(0.0, 4), PrecisionTime::new(100.0, 0.0)).await?;
    stream.write(&ramp(4.0, 4), PrecisionTime::new(102.0, 0.0)).await?;

    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    assert_eq!(reader.stream_id(), "tone");

    let first = reader.read_packet().await.unwrap();
    assert_eq!(first.data(), ramp(0.0, 4).as_slice());
    assert_eq!(first.xdelta(), 0.5);
    assert!(first.sri_change_flags().contains(SriChangeFlags::STREAMID));
    assert_eq!(first.start_time().unwrap().time, PrecisionTime::new(100.0, 0.0));

    let second = reader.read_packet().await.unwrap();
    assert_eq!(second.data(), ramp(4.0, 4).as_slice());
    assert!(!second.sri_changed());

    stream.close().await?;
    assert!(reader.read_packet().await.is_none());
    assert!(reader.eos().await);
    Ok(())
}

#[tokio::test]
async fn metadata_changes_travel_with_the_data() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<i16>::new("out");
    let input = InputPort::<i16>::new("in");
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;

    let stream = output.create_stream("chan").await;
    stream.write(&[1, 2, 3], PrecisionTime::new(0.0, 0.0)).await?;
    stream.set_xdelta(2.0).await?;
    stream.write(&[4, 5, 6], PrecisionTime::new(6.0, 0.0)).await?;

    let reader = input.current_stream(Wait::Indefinite).await.unwrap();

    // A sized read spanning the change must stop at the boundary
    let before = reader.read(6).await.unwrap();
    assert_eq!(before.data(), &[1, 2, 3]);
    assert_eq!(before.xdelta(), 1.0);

    let after = reader.read(3).await.unwrap();
    assert_eq!(after.data(), &[4, 5, 6]);
    assert_eq!(after.xdelta(), 2.0);
    assert!(after.sri_change_flags().contains(SriChangeFlags::XDELTA));
    Ok(())
}

#[tokio::test]
async fn blocking_stream_backpressures_the_producer() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<f32>::new("out");
    let input = InputPort::<f32>::new("in");
    input.set_max_queue_depth(1);
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;

    let mut sri = StreamDescriptor::new("steady");
    sri.blocking = true;
    let stream = output.create_stream_with(sri).await;
    stream.write(&[1.0], PrecisionTime::new(0.0, 0.0)).await?;

    // Queue full: the second write must park until the reader drains it
    let writer = {
        let stream = stream.clone();
        tokio::spawn(async move { stream.write(&[2.0], PrecisionTime::new(1.0, 0.0)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    let first = reader.read_packet().await.unwrap();
    assert_eq!(first.data(), &[1.0]);

    tokio::time::timeout(Duration::from_secs(5), writer).await???;
    let second = reader.read_packet().await.unwrap();
    assert_eq!(second.data(), &[2.0]);
    Ok(())
}

#[tokio::test]
async fn queue_overflow_is_reported_on_the_next_block() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<f32>::new("out");
    let input = InputPort::<f32>::new("in");
    input.set_max_queue_depth(2);
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;

    let stream = output.create_stream("bursty").await;
    for i in 0..3 {
        stream.write(&ramp(i as f32 * 4.0, 4), PrecisionTime::new(i as f64, 0.0)).await?;
    }

    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    let block = reader.read_packet().await.unwrap();
    assert!(block.input_queue_flushed());
    // Only the packet that triggered the flush survives
    assert_eq!(block.data(), ramp(8.0, 4).as_slice());
    assert!(reader.tryread_packet().await.is_none());
    Ok(())
}

#[tokio::test]
async fn write_multiple_carries_interior_timestamps() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<f32>::new("out");
    let input = InputPort::<f32>::new("in");
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;

    let stream = output.create_stream("stamped").await;
    let times = vec![
        SampleTimestamp::new(PrecisionTime::new(10.0, 0.0), 0, false),
        SampleTimestamp::new(PrecisionTime::new(20.0, 0.0), 4, false),
    ];
    stream.write_multiple(&ramp(0.0, 6), &times).await?;

    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    let block = reader.read(6).await.unwrap();
    assert_eq!(block.data(), ramp(0.0, 6).as_slice());
    assert_eq!(block.timestamps().len(), 2);
    assert_eq!(block.timestamps()[0].offset, 0);
    assert_eq!(block.timestamps()[1].offset, 4);
    assert_eq!(block.timestamps()[1].time, PrecisionTime::new(20.0, 0.0));
    Ok(())
}

#[tokio::test]
async fn filters_scope_streams_per_connection() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<f32>::new("splitter");
    let left = InputPort::<f32>::new("left");
    let right = InputPort::<f32>::new("right");
    output.connect(PortEndpoint::new(Arc::clone(&left)), "conn-left").await?;
    output.connect(PortEndpoint::new(Arc::clone(&right)), "conn-right").await?;
    output
        .update_filters(vec![
            FilterEntry {
                port_name: "splitter".into(),
                connection_id: "conn-left".into(),
                stream_id: "alpha".into(),
            },
            FilterEntry {
                port_name: "splitter".into(),
                connection_id: "conn-right".into(),
                stream_id: "beta".into(),
            },
        ])
        .await;

    let alpha = output.create_stream("alpha").await;
    let beta = output.create_stream("beta").await;
    alpha.write(&[1.0], PrecisionTime::new(0.0, 0.0)).await?;
    beta.write(&[2.0], PrecisionTime::new(0.0, 0.0)).await?;

    let left_reader = left.current_stream(Wait::Indefinite).await.unwrap();
    assert_eq!(left_reader.stream_id(), "alpha");
    assert_eq!(left_reader.read_packet().await.unwrap().data(), &[1.0]);
    assert!(left.stream("beta").is_none());

    let right_reader = right.current_stream(Wait::Indefinite).await.unwrap();
    assert_eq!(right_reader.stream_id(), "beta");
    assert_eq!(right_reader.read_packet().await.unwrap().data(), &[2.0]);
    Ok(())
}

#[tokio::test]
async fn buffered_output_accumulates_until_the_threshold() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<f32>::new("out");
    let input = InputPort::<f32>::new("in");
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;

    let stream = output.create_stream("batched").await;
    stream.set_buffer_size(8).await?;
    stream.write(&ramp(0.0, 3), PrecisionTime::new(0.0, 0.0)).await?;
    stream.write(&ramp(3.0, 3), PrecisionTime::new(3.0, 0.0)).await?;

    // Below the threshold nothing has been sent yet
    let polled = input.poll_streams(1, Wait::Timeout(Duration::from_millis(50))).await;
    assert!(polled.is_empty());

    stream.write(&ramp(6.0, 3), PrecisionTime::new(6.0, 0.0)).await?;
    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    let block = reader.read_packet().await.unwrap();
    assert_eq!(block.len(), 8);
    assert_eq!(block.data(), ramp(0.0, 8).as_slice());

    stream.flush().await?;
    let tail = reader.read_packet().await.unwrap();
    assert_eq!(tail.data(), &[8.0]);
    Ok(())
}

#[tokio::test]
async fn disconnect_finishes_announced_streams() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let output = OutputPort::<f32>::new("out");
    let input = InputPort::<f32>::new("in");
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;

    let stream = output.create_stream("short_lived").await;
    stream.write(&[1.0, 2.0], PrecisionTime::new(0.0, 0.0)).await?;
    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    assert_eq!(reader.read_packet().await.unwrap().data(), &[1.0, 2.0]);

    output.disconnect("conn-1").await?;
    assert!(reader.read_packet().await.is_none());
    assert!(reader.eos().await);
    assert!(output.connection_ids().await.is_empty());
    Ok(())
}
