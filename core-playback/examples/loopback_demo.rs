//! # Loopback Playback Example
//!
//! Opens a driver against the in-memory loopback server and walks through
//! the three ways a request can play: from the sample cache, after an upload,
//! and as a direct stream.
//!
//! Run with: `cargo run --example loopback_demo --package core-playback`

use bridge_loopback::{LoopbackServer, StaticSoundLookup};
use bridge_traits::{keys, LogLevel, PropList, SampleFormat, SampleSpec};
use bytes::Bytes;
use core_playback::Driver;
use core_runtime::config::DriverConfig;
use core_runtime::events::EventBus;
use core_runtime::logging::{init_logging, LogFormat, LoggingConfig};
use std::sync::{mpsc, Arc};
use std::time::Duration;

fn tone(frames: usize) -> Bytes {
    let mut data = Vec::with_capacity(frames * 4);
    for i in 0..frames {
        let t = i as f64 / 44_100.0;
        let sample = ((2.0 * std::f64::consts::PI * 880.0 * t).sin() * 8_000.0) as i16;
        data.extend_from_slice(&sample.to_ne_bytes());
        data.extend_from_slice(&sample.to_ne_bytes());
    }
    Bytes::from(data)
}

fn main() -> anyhow::Result<()> {
    init_logging(
        LoggingConfig::default()
            .with_format(LogFormat::Compact)
            .with_level(LogLevel::Debug),
    )?;

    let spec = SampleSpec::new(SampleFormat::S16Ne, 2, 44_100);
    let server = LoopbackServer::new();
    let lookup = StaticSoundLookup::new()
        .with_sound("bell", spec, tone(4_410))
        .with_sound("message-new-instant", spec, tone(22_050));

    let bus = EventBus::default();
    let mut events = bus.subscribe();

    let config = DriverConfig::builder()
        .client_name("loopback-demo")
        .server(Arc::new(server.clone()))
        .lookup(Arc::new(lookup))
        .props(Arc::new(
            PropList::new().with(keys::APPLICATION_NAME, "Loopback Demo"),
        ))
        .event_bus(bus)
        .build()?;
    let driver = Driver::open(config)?;

    let (tx, rx) = mpsc::channel();

    println!("Uploading and playing 'bell' from the sample cache...");
    let bell = PropList::new()
        .with(keys::EVENT_ID, "bell")
        .with(keys::CACHE_CONTROL, "volatile")
        .with(keys::VOLUME, "-6");
    let done = tx.clone();
    driver.play_with_callback(1, &bell, move |id, result| {
        let _ = done.send((id, result));
    })?;
    server.finish_all_sink_inputs();
    println!("  finished: {:?}", rx.recv_timeout(Duration::from_secs(5))?);

    println!("Streaming 'message-new-instant' directly...");
    let message = PropList::new().with(keys::EVENT_ID, "message-new-instant");
    let done = tx.clone();
    driver.play_with_callback(2, &message, move |id, result| {
        let _ = done.send((id, result));
    })?;
    println!("  finished: {:?}", rx.recv_timeout(Duration::from_secs(5))?);

    println!("Canceling a cached play...");
    driver.play_with_callback(3, &bell, move |id, result| {
        let _ = tx.send((id, result));
    })?;
    driver.cancel(3)?;
    println!("  finished: {:?}", rx.recv_timeout(Duration::from_secs(5))?);

    driver.close()?;

    println!("Events:");
    while let Ok(event) = events.try_recv() {
        println!("  {} {:?}", event.description(), event);
    }
    Ok(())
}
