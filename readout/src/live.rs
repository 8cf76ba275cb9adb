/*!
Live mirror of the read-out data over TCP.

Every published chunk becomes one frame:

```text
[u32 LE header length][JSON header][u32 LE payload length][payload: u32 LE words]
```

Publishing never blocks: frames go through a bounded queue and are dropped
when it is full. A dedicated thread runs a tokio runtime that accepts
subscribers and fans frames out over a broadcast channel; subscribers that
fall behind skip frames.
*/

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Socket send buffer for subscribers
const SEND_BUFFER_BYTES: usize = 1024 * 1024;

/// Metadata part of a live frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveHeader {
    pub name: String,
    pub dtype: String,
    pub shape: Vec<usize>,
    pub timestamp_start: f64,
    pub timestamp_stop: f64,
    pub readout_error: u32,
    pub scan_parameters: BTreeMap<String, i64>,
}

impl LiveHeader {
    pub fn readout_data(
        words: usize,
        timestamp_start: f64,
        timestamp_stop: f64,
        readout_error: u32,
        scan_parameters: BTreeMap<String, i64>,
    ) -> Self {
        Self {
            name: String::from("ReadoutData"),
            dtype: String::from("<u4"),
            shape: vec![words],
            timestamp_start,
            timestamp_stop,
            readout_error,
            scan_parameters,
        }
    }
}

/// Serialize one frame
pub fn encode_frame(header: &LiveHeader, words: &[u32]) -> Result<Bytes, serde_json::Error> {
    let header = serde_json::to_vec(header)?;
    let mut frame = BytesMut::with_capacity(8 + header.len() + 4 * words.len());
    frame.put_u32_le(header.len() as u32);
    frame.put_slice(&header);
    frame.put_u32_le((4 * words.len()) as u32);
    for &word in words {
        frame.put_u32_le(word);
    }
    Ok(frame.freeze())
}

/// Read one frame from a subscriber stream
pub fn read_frame<R: Read>(reader: &mut R) -> std::io::Result<(LiveHeader, Vec<u32>)> {
    let header = read_part(reader)?;
    let header: LiveHeader = serde_json::from_slice(&header)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let mut payload = Bytes::from(read_part(reader)?);
    let mut words = Vec::with_capacity(payload.len() / 4);
    while payload.remaining() >= 4 {
        words.push(payload.get_u32_le());
    }
    Ok((header, words))
}

fn read_part<R: Read>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut length = [0u8; 4];
    reader.read_exact(&mut length)?;
    let mut part = vec![0u8; u32::from_le_bytes(length) as usize];
    reader.read_exact(&mut part)?;
    Ok(part)
}

/// Best-effort TCP publisher
pub struct LivePublisher {
    queue: mpsc::Sender<Bytes>,
    local_addr: SocketAddr,
    dropped: Arc<AtomicU64>,
    subscribers: Arc<AtomicUsize>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl LivePublisher {
    /// Bind the publish socket, `queue_capacity` frames may be pending
    pub fn bind(addr: &str, queue_capacity: usize) -> std::io::Result<Self> {
        let listener = std::net::TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let runtime = Runtime::new()?;

        let (queue, frames) = mpsc::channel::<Bytes>(queue_capacity.max(1));
        let (shutdown, shutdown_rx) = oneshot::channel();
        let subscribers = Arc::new(AtomicUsize::new(0));
        let subscriber_count = Arc::clone(&subscribers);

        let handle = thread::spawn(move || {
            runtime.block_on(async move {
                match TcpListener::from_std(listener) {
                    Ok(listener) => serve(listener, frames, shutdown_rx, queue_capacity, subscriber_count).await,
                    Err(e) => error!("Live publisher failed to start: {}", e),
                }
            })
        });
        info!("📡 Live publisher listening on {}", local_addr);

        Ok(Self {
            queue,
            local_addr,
            dropped: Arc::new(AtomicU64::new(0)),
            subscribers,
            shutdown: Some(shutdown),
            handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load(Ordering::SeqCst)
    }

    /// Frames dropped because the outbound queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Queue one chunk. Returns false if the frame was dropped.
    pub fn publish(&self, header: &LiveHeader, words: &[u32]) -> bool {
        let frame = match encode_frame(header, words) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode live frame: {}", e);
                return false;
            }
        };
        match self.queue.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 1000 == 0 {
                    warn!("Live queue full, {} frame(s) dropped so far", dropped);
                }
                false
            }
        }
    }
}

impl Drop for LivePublisher {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Live publisher thread panicked");
            }
        }
        info!("📡 Live publisher closed, {} frame(s) dropped", self.dropped());
    }
}

async fn serve(
    listener: TcpListener,
    mut frames: mpsc::Receiver<Bytes>,
    mut shutdown: oneshot::Receiver<()>,
    capacity: usize,
    subscribers: Arc<AtomicUsize>,
) {
    let (fanout, _) = broadcast::channel::<Bytes>(capacity.max(1));
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("Live subscriber connected from {}", peer);
                    let receiver = fanout.subscribe();
                    subscribers.fetch_add(1, Ordering::SeqCst);
                    let subscribers = Arc::clone(&subscribers);
                    tokio::spawn(async move {
                        subscriber(stream, receiver).await;
                        subscribers.fetch_sub(1, Ordering::SeqCst);
                        debug!("Live subscriber {} disconnected", peer);
                    });
                }
                Err(e) => warn!("Live accept error: {}", e),
            },
            frame = frames.recv() => match frame {
                // no subscribers is not an error
                Some(frame) => { let _ = fanout.send(frame); }
                None => break,
            },
        }
    }
}

async fn subscriber(mut stream: TcpStream, mut frames: broadcast::Receiver<Bytes>) {
    let sock_ref = socket2::SockRef::from(&stream);
    if let Err(e) = sock_ref.set_send_buffer_size(SEND_BUFFER_BYTES) {
        debug!("Could not set live send buffer: {}", e);
    }
    let _ = stream.set_nodelay(true);

    loop {
        match frames.recv().await {
            Ok(frame) => {
                if stream.write_all(&frame).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Live subscriber lagging, skipped {} frame(s)", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
