//! Integration tests for the bridging hubs
//!
//! These drive the client and serial hubs through the library surface with
//! the in-memory serial backend standing in for hardware.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde_json::Value;
use serialbridge_core::{BridgeError, Envelope, MemoryMode};
use serialbridge_hardware::{MockBackend, PortFilter};
use serialbridged::hub::{
    Broadcaster, ClientHub, ClientSession, ReclaimPolicy, SerialHub, SerialHubSettings,
};
use serialbridged::logging::log_channel;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, Barrier};

const PORT: &str = "/dev/ttyACM0";

fn bridge() -> (Arc<ClientHub>, Arc<MockBackend>) {
    let backend = Arc::new(MockBackend::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let serial = Arc::new(SerialHub::new(
        backend.clone(),
        PortFilter::new("acm|usb").unwrap(),
        broadcaster.clone(),
        Arc::new(ReclaimPolicy::new(MemoryMode::Default)),
        SerialHubSettings::default(),
    ));
    let (log, _rx) = log_channel(16);
    (Arc::new(ClientHub::new(broadcaster, serial, log)), backend)
}

async fn connect(hub: &ClientHub, capacity: usize) -> mpsc::Receiver<Arc<str>> {
    let (session, rx) = ClientSession::new(capacity);
    hub.register(session).await.unwrap();
    rx
}

async fn next_event(rx: &mut mpsc::Receiver<Arc<str>>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("session closed");
    serde_json::from_str(&text).unwrap()
}

/// Concatenate hardware data for `port` until `len` bytes have arrived
async fn collect_data(rx: &mut mpsc::Receiver<Arc<str>>, port: &str, len: usize) -> String {
    let mut out = String::new();
    while out.len() < len {
        let event = next_event(rx).await;
        if event["kind"] == "hardware_data" && event["port"] == port {
            out.push_str(event["data"].as_str().unwrap());
        }
    }
    out
}

#[tokio::test]
async fn test_concurrent_open_exactly_one_succeeds() -> Result<()> {
    let (hub, backend) = bridge();
    backend.add_loopback(PORT);

    let attempts = 16;
    let barrier = Arc::new(Barrier::new(attempts));
    let mut tasks = Vec::new();
    for _ in 0..attempts {
        let hub = hub.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            hub.serial().open(PORT, Some(115200)).await
        }));
    }

    let mut opened = 0;
    let mut already_open = 0;
    for task in tasks {
        match task.await? {
            Ok(_) => opened += 1,
            Err(BridgeError::AlreadyOpen(port)) => {
                assert_eq!(port, PORT);
                already_open += 1;
            }
            Err(e) => panic!("Unexpected error: {}", e),
        }
    }

    assert_eq!(opened, 1);
    assert_eq!(already_open, attempts - 1);
    assert_eq!(backend.open_count(), 1);
    assert_eq!(hub.serial().open_ports().await, vec![PORT.to_string()]);

    hub.serial().close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_device_data_reaches_every_session() -> Result<()> {
    let (hub, backend) = bridge();
    let mut device = backend.attach(PORT);

    let mut sessions = Vec::new();
    for _ in 0..5 {
        sessions.push(connect(&hub, 64).await);
    }

    hub.serial().open(PORT, None).await?;
    device.write_all(b"hello from the board").await?;

    for rx in sessions.iter_mut() {
        let opened = next_event(rx).await;
        assert_eq!(opened["kind"], "opened");
        assert_eq!(opened["baud"], 9600);
        assert_eq!(collect_data(rx, PORT, 20).await, "hello from the board");
    }

    hub.serial().close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_per_port_ordering() -> Result<()> {
    let (hub, backend) = bridge();
    let mut device = backend.attach(PORT);
    let mut rx = connect(&hub, 1024).await;
    hub.serial().open(PORT, None).await?;

    // Device to clients
    let mut expected = String::new();
    for i in 0..100 {
        let line = format!("{}\n", i);
        device.write_all(line.as_bytes()).await?;
        expected.push_str(&line);
        if i % 10 == 0 {
            tokio::task::yield_now().await;
        }
    }
    assert_eq!(collect_data(&mut rx, PORT, expected.len()).await, expected);

    // Clients to device
    let mut written = String::new();
    for i in 0..50 {
        let chunk = format!("cmd{};", i);
        hub.serial().write(PORT, Bytes::from(chunk.clone())).await?;
        written.push_str(&chunk);
    }
    let mut received = vec![0u8; written.len()];
    tokio::time::timeout(Duration::from_secs(2), device.read_exact(&mut received)).await??;
    assert_eq!(String::from_utf8(received)?, written);

    hub.serial().close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_character_split_across_reads_arrives_whole() -> Result<()> {
    let (hub, backend) = bridge();
    let mut device = backend.attach(PORT);
    let mut rx = connect(&hub, 64).await;
    hub.serial().open(PORT, None).await?;
    assert_eq!(next_event(&mut rx).await["kind"], "opened");

    // "é" is 0xC3 0xA9; the reader sees each byte in a separate read
    device.write_all(&[b'T', b'=', 0xC3]).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    device.write_all(&[0xA9, b'\n']).await?;

    assert_eq!(collect_data(&mut rx, PORT, 5).await, "T=\u{e9}\n");

    hub.serial().close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_close_unblocks_reader_and_updates_listing() -> Result<()> {
    let (hub, backend) = bridge();
    // The device stays attached and silent, so the reader is parked in read
    let mut device = backend.attach(PORT);
    let mut rx = connect(&hub, 64).await;
    hub.serial().open(PORT, Some(57600)).await?;

    let listing = hub.serial().list(None).await;
    assert!(listing.iter().any(|p| p.descriptor.name == PORT && p.is_open));

    tokio::time::timeout(Duration::from_secs(5), hub.serial().close(PORT)).await??;

    assert!(!hub.serial().is_open(PORT).await);
    let listing = hub.serial().list(None).await;
    let port = listing.iter().find(|p| p.descriptor.name == PORT).unwrap();
    assert!(!port.is_open);
    assert_eq!(port.baud, None);

    // The bridge end of the pipe has been released
    let mut buf = [0u8; 8];
    let n = tokio::time::timeout(Duration::from_secs(2), device.read(&mut buf)).await??;
    assert_eq!(n, 0);

    assert_eq!(next_event(&mut rx).await["kind"], "opened");
    let closed = next_event(&mut rx).await;
    assert_eq!(closed["kind"], "closed");
    assert_eq!(closed["port"], PORT);

    assert!(matches!(
        hub.serial().close(PORT).await,
        Err(BridgeError::NotOpen(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_unplugged_device_is_reported_and_removed() -> Result<()> {
    let (hub, backend) = bridge();
    let device = backend.attach(PORT);
    let mut rx = connect(&hub, 64).await;
    hub.serial().open(PORT, None).await?;
    assert_eq!(next_event(&mut rx).await["kind"], "opened");

    drop(device);

    let closed = next_event(&mut rx).await;
    assert_eq!(closed["kind"], "closed");
    let error = next_event(&mut rx).await;
    assert_eq!(error["kind"], "error");
    assert_eq!(error["port"], PORT);
    assert!(!hub.serial().is_open(PORT).await);

    // The port can be opened again once it comes back
    let _device = backend.attach(PORT);
    hub.serial().open(PORT, None).await?;
    hub.serial().close_all().await;
    Ok(())
}

#[tokio::test]
async fn test_overflowing_session_is_disconnected() -> Result<()> {
    let (hub, _backend) = bridge();
    let mut slow = connect(&hub, 2).await;
    let mut fast = connect(&hub, 64).await;
    assert_eq!(hub.client_count().await, 2);

    for i in 0..10 {
        hub.broadcast(&Envelope::log(format!("line {}", i))).await;
    }

    assert_eq!(hub.client_count().await, 1);
    for i in 0..10 {
        let event = next_event(&mut fast).await;
        assert_eq!(event["line"], format!("line {}", i));
    }

    // The slow session keeps what was queued, then sees its channel close
    assert_eq!(next_event(&mut slow).await["line"], "line 0");
    assert_eq!(next_event(&mut slow).await["line"], "line 1");
    assert!(slow.recv().await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_websocket_commands_route_through_hub() -> Result<()> {
    let (hub, backend) = bridge();
    backend.add_loopback(PORT);
    let (session, mut rx) = ClientSession::new(64);
    let id = hub.register(session).await?;

    hub.route_inbound(id, &format!("open {} 115200", PORT)).await;
    hub.route_inbound(id, &format!("send {} ping", PORT)).await;

    let mut kinds = Vec::new();
    let echoed = loop {
        let event = next_event(&mut rx).await;
        kinds.push(event["kind"].as_str().unwrap_or_default().to_string());
        if event["kind"] == "hardware_data" {
            break event["data"].as_str().unwrap_or_default().to_string();
        }
    };
    assert!(kinds.contains(&"command".to_string()));
    assert!(kinds.contains(&"opened".to_string()));
    assert!(echoed.starts_with('p'));

    hub.serial().close_all().await;
    Ok(())
}
