//! A single peer connection after the handshake: a reader task that
//! dispatches inbound packets, a writer task that drains an outbound queue,
//! and a pinger that drops the connection after too many silent intervals.
//! Closing is cooperative; whichever side initiates sends `Disconnecting`
//! with a reason first.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::io::{AsyncWriteExt as _, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::PoolEvent;
use super::packet::{
    Disconnecting, DisconnectReason, Envelope, Hello, Packet, WireError, read_frame, write_frame,
};
use crate::constants::{MAX_MISSED_PINGS, PING_INTERVAL};
use crate::market::{NodePubKey, PairId, monotonic_ms};

/// Snapshot of a connected peer for listings.
#[derive(Debug, Clone, Serialize)]
pub struct PeerInfo {
    pub pub_key: NodePubKey,
    pub address: String,
    pub inbound: bool,
    pub version: String,
    pub pairs: Vec<PairId>,
    pub connected_at: u64,
}

/// Invoked exactly once when the connection tasks wind down. Arguments:
/// connection id, pub key, inbound flag, locally chosen reason, reason
/// received from the remote.
pub(crate) type OnClose = Box<
    dyn FnOnce(Uuid, NodePubKey, bool, Option<DisconnectReason>, Option<DisconnectReason>)
        + Send
        + 'static,
>;

#[derive(Clone)]
pub(crate) struct PeerHandle {
    pub conn_id: Uuid,
    pub pub_key: NodePubKey,
    pub address: SocketAddr,
    pub inbound: bool,
    pub version: String,
    pub connected_at: u64,
    pairs: Arc<Mutex<HashSet<PairId>>>,
    tx: mpsc::UnboundedSender<Envelope>,
    close: watch::Sender<Option<DisconnectReason>>,
}

impl PeerHandle {
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }

    pub fn close(&self, reason: DisconnectReason) {
        let _ = self.close.send(Some(reason));
    }

    pub fn advertises_pair(&self, pair_id: &str) -> bool {
        self.pairs.lock().expect("pair set poisoned").contains(pair_id)
    }

    pub fn info(&self) -> PeerInfo {
        let mut pairs: Vec<PairId> = self
            .pairs
            .lock()
            .expect("pair set poisoned")
            .iter()
            .cloned()
            .collect();
        pairs.sort();
        PeerInfo {
            pub_key: self.pub_key.clone(),
            address: self.address.to_string(),
            inbound: self.inbound,
            version: self.version.clone(),
            pairs,
            connected_at: self.connected_at,
        }
    }
}

/// Take over a handshaken connection and run it until either side closes.
pub(crate) fn spawn_peer(
    stream: TcpStream,
    address: SocketAddr,
    hello: Hello,
    inbound: bool,
    events: mpsc::UnboundedSender<PoolEvent>,
    on_close: OnClose,
) -> PeerHandle {
    let conn_id = Uuid::new_v4();
    let pub_key = hello.pub_key.clone();
    let pairs = Arc::new(Mutex::new(hello.pairs.iter().cloned().collect::<HashSet<_>>()));
    let (tx, rx) = mpsc::unbounded_channel();
    let (close_tx, close_rx) = watch::channel(None);
    let missed_pings = Arc::new(AtomicU32::new(0));

    let (reader, writer) = tokio::io::split(stream);
    let writer_task = tokio::spawn(run_writer(writer, rx));
    let pinger_task = tokio::spawn(run_pinger(
        tx.clone(),
        close_tx.clone(),
        close_rx.clone(),
        missed_pings.clone(),
    ));
    tokio::spawn(run_reader(ReaderContext {
        reader,
        conn_id,
        pub_key: pub_key.clone(),
        inbound,
        pairs: pairs.clone(),
        tx: tx.clone(),
        close_rx,
        missed_pings,
        events,
        on_close,
        writer_task,
        pinger_task,
    }));

    PeerHandle {
        conn_id,
        pub_key,
        address,
        inbound,
        version: hello.version,
        connected_at: monotonic_ms(),
        pairs,
        tx,
        close: close_tx,
    }
}

async fn run_writer(mut writer: WriteHalf<TcpStream>, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let closing = matches!(envelope.packet, Packet::Disconnecting(_));
        if let Err(err) = write_frame(&mut writer, &envelope).await {
            tracing::debug!(error = %err, "peer write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Send a ping every interval; close the connection once too many go
/// unanswered. The reader resets the counter on every pong.
async fn run_pinger(
    tx: mpsc::UnboundedSender<Envelope>,
    close_tx: watch::Sender<Option<DisconnectReason>>,
    mut close_rx: watch::Receiver<Option<DisconnectReason>>,
    missed_pings: Arc<AtomicU32>,
) {
    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if missed_pings.fetch_add(1, Ordering::SeqCst) >= MAX_MISSED_PINGS {
                    let _ = close_tx.send(Some(DisconnectReason::ConnectionTimeout));
                    break;
                }
                if tx.send(Envelope::new(Packet::Ping)).is_err() {
                    break;
                }
            }
            _ = close_rx.changed() => break,
        }
    }
}

struct ReaderContext {
    reader: ReadHalf<TcpStream>,
    conn_id: Uuid,
    pub_key: NodePubKey,
    inbound: bool,
    pairs: Arc<Mutex<HashSet<PairId>>>,
    tx: mpsc::UnboundedSender<Envelope>,
    close_rx: watch::Receiver<Option<DisconnectReason>>,
    missed_pings: Arc<AtomicU32>,
    events: mpsc::UnboundedSender<PoolEvent>,
    on_close: OnClose,
    writer_task: tokio::task::JoinHandle<()>,
    pinger_task: tokio::task::JoinHandle<()>,
}

async fn run_reader(ctx: ReaderContext) {
    let ReaderContext {
        mut reader,
        conn_id,
        pub_key,
        inbound,
        pairs,
        tx,
        mut close_rx,
        missed_pings,
        events,
        on_close,
        writer_task,
        pinger_task,
    } = ctx;

    let mut local_reason: Option<DisconnectReason> = None;
    let mut remote_reason: Option<DisconnectReason> = None;

    loop {
        tokio::select! {
            res = read_frame(&mut reader) => match res {
                Ok(envelope) => match envelope.packet {
                    Packet::Ping => {
                        let _ = tx.send(Envelope::response_to(Packet::Pong, envelope.id));
                    }
                    Packet::Pong => missed_pings.store(0, Ordering::SeqCst),
                    Packet::Disconnecting(d) => {
                        tracing::debug!(peer = %pub_key, reason = ?d.reason, "peer disconnecting");
                        remote_reason = Some(d.reason);
                        break;
                    }
                    // a second Hello after the handshake carries nothing new
                    Packet::Hello(_) => {}
                    Packet::NodeStateUpdate(state) => {
                        *pairs.lock().expect("pair set poisoned") =
                            state.pairs.into_iter().collect();
                    }
                    _ => {
                        let _ = events.send(PoolEvent::Packet {
                            pub_key: pub_key.clone(),
                            envelope,
                        });
                    }
                },
                Err(WireError::Io(err)) => {
                    tracing::debug!(peer = %pub_key, error = %err, "peer connection lost");
                    break;
                }
                Err(err) => {
                    tracing::warn!(peer = %pub_key, error = %err, "malformed packet from peer");
                    local_reason = Some(DisconnectReason::MalformedPacket);
                    send_disconnecting(&tx, DisconnectReason::MalformedPacket);
                    break;
                }
            },
            _ = close_rx.changed() => {
                local_reason = *close_rx.borrow();
                if let Some(reason) = local_reason {
                    send_disconnecting(&tx, reason);
                }
                break;
            }
        }
    }

    // closing the queue lets the writer drain the goodbye and exit
    drop(tx);
    pinger_task.abort();
    let _ = writer_task.await;
    on_close(conn_id, pub_key, inbound, local_reason, remote_reason);
}

fn send_disconnecting(tx: &mpsc::UnboundedSender<Envelope>, reason: DisconnectReason) {
    let _ = tx.send(Envelope::new(Packet::Disconnecting(Disconnecting {
        reason,
        payload: None,
    })));
}
