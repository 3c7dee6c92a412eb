//! Negotiated transports between two ports that pretend not to share a
//! process: the shared-memory path with its named-pipe control channel,
//! and the serialized fallback.

#![cfg(unix)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use sampleio::transport::negotiation::{RemoteTransportFactory, SHM_ENV_VAR};
use sampleio::transport::TransportRegistry;
use sampleio::{InputPort, OutputPort, PortEndpoint, PrecisionTime, Wait};

/// Serializes the tests that read or write the transport environment
/// variable.
static ENV_LOCK: Mutex<()> = Mutex::new(());

fn env_guard() -> std::sync::MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|i| i as f32).collect()
}

#[tokio::test]
async fn shm_connection_delivers_without_copying() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let _env = env_guard();

    let output = OutputPort::<f32>::new("producer");
    let input = InputPort::<f32>::new("consumer");
    // An opaque endpoint hides the in-process port, forcing negotiation
    output.connect(PortEndpoint::opaque(Arc::clone(&input)), "conn-1").await?;
    assert_eq!(output.connection_kind("conn-1").await, Some("shm"));

    let stream = output.create_stream("wide").await;
    let payload = ramp(4096);
    stream.write(&payload, PrecisionTime::new(50.0, 0.0)).await?;

    let reader = tokio::time::timeout(
        Duration::from_secs(5),
        input.current_stream(Wait::Indefinite),
    )
    .await?
    .unwrap();
    let block = reader.read_packet().await.unwrap();
    assert_eq!(block.data(), payload.as_slice());
    assert_eq!(block.start_time().unwrap().time, PrecisionTime::new(50.0, 0.0));
    // The payload is a view into the producer's shared segment
    assert!(block.buffer().is_shared());

    stream.close().await?;
    assert!(reader.read_packet().await.is_none());
    assert!(reader.eos().await);
    Ok(())
}

#[tokio::test]
async fn shm_disabled_falls_back_to_serialized_push() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let _env = env_guard();
    // SAFETY: ENV_LOCK serializes every test that touches this variable
    unsafe { std::env::set_var(SHM_ENV_VAR, "disable") };

    let output = OutputPort::<f32>::new("producer");
    let input = InputPort::<f32>::new("consumer");
    let connected = output.connect(PortEndpoint::opaque(Arc::clone(&input)), "conn-1").await;
    // Restore before asserting so a failure does not poison later tests
    unsafe { std::env::remove_var(SHM_ENV_VAR) };
    connected?;
    assert_eq!(output.connection_kind("conn-1").await, Some("remote"));

    let stream = output.create_stream("narrow").await;
    stream.write(&ramp(16), PrecisionTime::new(0.0, 0.0)).await?;

    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    let block = reader.read_packet().await.unwrap();
    assert_eq!(block.data(), ramp(16).as_slice());
    assert!(!block.buffer().is_shared());
    Ok(())
}

#[tokio::test]
async fn forwarded_block_keeps_its_shared_allocation() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let _env = env_guard();

    let first_out = OutputPort::<f32>::new("producer");
    let relay_in = InputPort::<f32>::new("relay_in");
    let relay_out = OutputPort::<f32>::new("relay_out");
    let sink = InputPort::<f32>::new("sink");
    first_out.connect(PortEndpoint::opaque(Arc::clone(&relay_in)), "hop-1").await?;
    relay_out.connect(PortEndpoint::opaque(Arc::clone(&sink)), "hop-2").await?;

    let source = first_out.create_stream("relayed").await;
    source.write(&ramp(1024), PrecisionTime::new(10.0, 0.0)).await?;

    let reader = tokio::time::timeout(
        Duration::from_secs(5),
        relay_in.current_stream(Wait::Indefinite),
    )
    .await?
    .unwrap();
    let block = reader.read_packet().await.unwrap();
    let (origin, origin_window) = block.buffer().shm_location().expect("shared payload");
    let origin = origin.clone();

    // Forward the block unchanged over the second hop
    let relayed = relay_out.create_stream("relayed").await;
    relayed.write_buffer(block.buffer().clone(), PrecisionTime::new(10.0, 0.0)).await?;

    let tail = tokio::time::timeout(
        Duration::from_secs(5),
        sink.current_stream(Wait::Indefinite),
    )
    .await?
    .unwrap();
    let forwarded = tail.read_packet().await.unwrap();
    assert_eq!(forwarded.data(), ramp(1024).as_slice());
    // The relay never copied: the sink sees the producer's allocation
    let (mem, window) = forwarded.buffer().shm_location().expect("shared payload");
    assert_eq!(*mem, origin);
    assert_eq!(window, origin_window);
    Ok(())
}

#[tokio::test]
async fn custom_registry_restricts_the_candidates() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let mut registry = TransportRegistry::empty();
    registry.register(Arc::new(RemoteTransportFactory));

    let output = OutputPort::<i16>::with_registry("producer", registry);
    let input = InputPort::<i16>::new("consumer");
    // Even a fully local endpoint takes the serialized path
    output.connect(PortEndpoint::new(Arc::clone(&input)), "conn-1").await?;
    assert_eq!(output.connection_kind("conn-1").await, Some("remote"));

    let stream = output.create_stream("s").await;
    stream.write(&[7, 8, 9], PrecisionTime::new(0.0, 0.0)).await?;
    let reader = input.current_stream(Wait::Indefinite).await.unwrap();
    assert_eq!(reader.read_packet().await.unwrap().data(), &[7, 8, 9]);
    Ok(())
}

#[tokio::test]
async fn shm_consumer_survives_metadata_and_eos() -> Result<()> {
    let _ = tracing_subscriber::fmt::try_init();
    let _env = env_guard();

    let output = OutputPort::<f32>::new("producer");
    let input = InputPort::<f32>::new("consumer");
    output.connect(PortEndpoint::opaque(Arc::clone(&input)), "conn-1").await?;

    let stream = output.create_stream("retuned").await;
    stream.write(&ramp(256), PrecisionTime::new(0.0, 0.0)).await?;
    stream.set_xdelta(0.25).await?;
    stream.write(&ramp(256), PrecisionTime::new(64.0, 0.0)).await?;
    stream.close().await?;

    let reader = tokio::time::timeout(
        Duration::from_secs(5),
        input.current_stream(Wait::Indefinite),
    )
    .await?
    .unwrap();

    let first = reader.read_packet().await.unwrap();
    assert_eq!(first.xdelta(), 1.0);
    let second = reader.read_packet().await.unwrap();
    assert_eq!(second.xdelta(), 0.25);
    assert!(second.sri_changed());
    assert!(reader.read_packet().await.is_none());
    assert!(reader.eos().await);
    Ok(())
}
