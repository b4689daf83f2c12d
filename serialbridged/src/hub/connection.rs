//! One open serial port and its two I/O tasks
//!
//! The read task forwards every chunk to the broadcaster as soon as it
//! arrives, holding back a UTF-8 sequence cut off at the end of a read until
//! the rest of it shows up. The writer task drains a bounded queue, coalescing whatever is
//! already waiting into a single hardware write. Both stop when the
//! connection's `watch` flag flips.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use serialbridge_core::{BridgeError, Envelope, Result};
use serialbridge_hardware::{is_disconnect_io, SerialIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::memory::IoHook;
use super::serial_hub::HubShared;

/// An open hardware port owned by the serial hub
pub struct SerialConnection {
    id: u64,
    port: String,
    baud: u32,
    open: AtomicBool,
    outbound: mpsc::Sender<Bytes>,
    stop: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SerialConnection {
    /// Take ownership of `io` and start the read and writer tasks
    pub(crate) fn spawn(
        id: u64,
        port: &str,
        baud: u32,
        io: Box<dyn SerialIo>,
        shared: &Arc<HubShared>,
    ) -> Arc<Self> {
        let (outbound, queue) = mpsc::channel(shared.settings.write_queue.max(1));
        let (stop, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id,
            port: port.to_string(),
            baud,
            open: AtomicBool::new(true),
            outbound,
            stop,
            tasks: Mutex::new(Vec::with_capacity(2)),
        });

        let (reader, writer) = tokio::io::split(io);
        let read_task = tokio::spawn(run_reader(
            Arc::clone(&conn),
            reader,
            Arc::clone(shared),
            conn.stop.subscribe(),
        ));
        let write_task = tokio::spawn(run_writer(
            Arc::clone(&conn),
            writer,
            queue,
            Arc::clone(shared),
            conn.stop.subscribe(),
        ));

        if let Ok(mut tasks) = conn.tasks.lock() {
            tasks.push(read_task);
            tasks.push(write_task);
        }
        conn
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Queue bytes for the writer task, waiting for room if the queue is full
    pub async fn enqueue(&self, data: Bytes) -> Result<()> {
        if !self.is_open() {
            return Err(BridgeError::NotOpen(self.port.clone()));
        }
        self.outbound
            .send(data)
            .await
            .map_err(|_| BridgeError::NotOpen(self.port.clone()))
    }

    /// Flag the connection closed and wake both tasks
    fn signal_stop(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.stop.send(true);
    }

    /// Stop both tasks, waiting up to `timeout` for each before aborting it
    ///
    /// The hardware handle is released once both tasks have returned.
    pub async fn shutdown(&self, timeout: Duration) {
        self.signal_stop();

        let tasks = match self.tasks.lock() {
            Ok(mut tasks) => std::mem::take(&mut *tasks),
            Err(_) => Vec::new(),
        };
        for mut task in tasks {
            if tokio::time::timeout(timeout, &mut task).await.is_err() {
                warn!("Serial task for {} did not stop in time, aborting", self.port);
                task.abort();
            }
        }
    }
}

/// Remove `conn` from the hub after the device went away and tell clients
///
/// Does nothing if the connection was already closed on request.
async fn connection_lost(conn: &SerialConnection, shared: &HubShared, err: BridgeError) {
    let removed = {
        let mut table = shared.table.lock().await;
        match table.open.get(conn.port()) {
            Some(current) if current.id() == conn.id() => table.open.remove(conn.port()).is_some(),
            _ => false,
        }
    };
    if !removed {
        return;
    }

    conn.signal_stop();
    warn!("Serial port {} closed: {}", conn.port(), err);
    shared
        .broadcaster
        .broadcast(&Envelope::Closed {
            port: conn.port().to_string(),
        })
        .await;
    shared.broadcaster.broadcast(&Envelope::error(&err)).await;
}

async fn run_reader(
    conn: Arc<SerialConnection>,
    mut reader: ReadHalf<Box<dyn SerialIo>>,
    shared: Arc<HubShared>,
    mut stop: watch::Receiver<bool>,
) {
    let chunk = shared.settings.read_chunk.max(1);
    let mut buf = BytesMut::with_capacity(chunk);
    let mut tracker = shared.policy.tracker();

    loop {
        shared
            .policy
            .apply(IoHook::PreReceive, &mut buf, chunk, &mut tracker);
        buf.reserve(chunk);

        let result = tokio::select! {
            _ = stop.changed() => break,
            result = reader.read_buf(&mut buf) => result,
        };

        match result {
            Ok(0) => {
                if !buf.is_empty() {
                    let rest = buf.split().freeze();
                    shared
                        .broadcaster
                        .broadcast(&Envelope::hardware_data(conn.port(), rest))
                        .await;
                }
                connection_lost(
                    &conn,
                    &shared,
                    BridgeError::DeviceDisconnected(conn.port().to_string()),
                )
                .await;
                break;
            }
            Ok(n) => {
                trace!("{} bytes from {}", n, conn.port());
                let complete = utf8_complete_len(&buf);
                if complete > 0 {
                    let data = buf.split_to(complete).freeze();
                    shared
                        .broadcaster
                        .broadcast(&Envelope::hardware_data(conn.port(), data))
                        .await;
                }
                shared
                    .policy
                    .apply(IoHook::PostReceive, &mut buf, chunk, &mut tracker);
            }
            Err(e) => {
                let err = if is_disconnect_io(&e) {
                    BridgeError::DeviceDisconnected(conn.port().to_string())
                } else {
                    BridgeError::Serial(format!("read from {} failed: {}", conn.port(), e))
                };
                connection_lost(&conn, &shared, err).await;
                break;
            }
        }
    }
    debug!("Read task for {} finished", conn.port());
}

/// Length of the prefix of `data` that does not stop inside a UTF-8 sequence
///
/// Invalid bytes count as complete and are passed on as they are.
fn utf8_complete_len(data: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&data[start..]) {
            Ok(_) => return data.len(),
            Err(e) => match e.error_len() {
                Some(invalid) => start += e.valid_up_to() + invalid,
                None => return start + e.valid_up_to(),
            },
        }
    }
}

async fn run_writer(
    conn: Arc<SerialConnection>,
    mut writer: WriteHalf<Box<dyn SerialIo>>,
    mut queue: mpsc::Receiver<Bytes>,
    shared: Arc<HubShared>,
    mut stop: watch::Receiver<bool>,
) {
    let baseline = shared.settings.read_chunk.max(1);
    let mut staging = BytesMut::with_capacity(baseline);
    let mut tracker = shared.policy.tracker();

    loop {
        let first = tokio::select! {
            _ = stop.changed() => break,
            next = queue.recv() => match next {
                Some(data) => data,
                None => break,
            },
        };

        shared
            .policy
            .apply(IoHook::PreSend, &mut staging, baseline, &mut tracker);
        staging.extend_from_slice(&first);
        while let Ok(more) = queue.try_recv() {
            staging.extend_from_slice(&more);
        }

        let result = match writer.write_all(&staging).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        trace!("{} bytes to {}", staging.len(), conn.port());
        staging.clear();
        shared
            .policy
            .apply(IoHook::PostSend, &mut staging, baseline, &mut tracker);

        if let Err(e) = result {
            let err = BridgeError::WriteFailed {
                port: conn.port().to_string(),
                reason: e.to_string(),
            };
            if is_disconnect_io(&e) {
                connection_lost(&conn, &shared, err).await;
                break;
            }
            warn!("{}", err);
            shared.broadcaster.broadcast(&Envelope::error(&err)).await;
        }
    }
    debug!("Writer task for {} finished", conn.port());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_text_is_not_held_back() {
        assert_eq!(utf8_complete_len(b""), 0);
        assert_eq!(utf8_complete_len(b"ok\n"), 3);
        assert_eq!(utf8_complete_len("temp 21\u{b0}C".as_bytes()), 10);
    }

    #[test]
    fn test_cut_sequence_is_held_back() {
        assert_eq!(utf8_complete_len(&[0xC3]), 0);
        assert_eq!(utf8_complete_len(&[b'a', b'b', 0xE2, 0x82]), 2);
        assert_eq!(utf8_complete_len(&[b'x', 0xF0, 0x9F, 0x98]), 1);
    }

    #[test]
    fn test_invalid_bytes_pass_through() {
        assert_eq!(utf8_complete_len(&[0xFF, b'a']), 2);
        assert_eq!(utf8_complete_len(&[0xC3, b'a', 0xC3]), 2);
        assert_eq!(utf8_complete_len(&[0x80, 0x80]), 2);
    }
}
