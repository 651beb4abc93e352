//! Node runtime: threads, sockets and the engine worker.
//!
//! Three threads cooperate. A reader thread pulls datagrams off the
//! UDP socket and pushes them into a lock-free SPSC ring. The AOS
//! clock thread publishes ticks on a channel. The worker thread owns
//! both engines outright, draining the ring, the control channel and
//! the tick channel in turn — so every piece of session state is
//! mutated from exactly one thread and timer expiry is a two-step
//! handoff, never a callback into the clock thread.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use aphelion_ltp::receiver::{DeliveredBlock, Receiver as ReceiverEngine, ReceiverEvent};
use aphelion_ltp::sender::{Sender as SenderEngine, SenderEvent};
use aphelion_ltp::stats::{ReceiverStats, SenderStats};
use aphelion_ltp::wire::{Color, Segment};
use bytes::Bytes;
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use quanta::Instant;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::AosClock;
use crate::config::NodeConfig;

/// Inbound datagram ring capacity.
const RING_CAPACITY: usize = 1024;

/// Undelivered-block channel capacity toward the client.
const DELIVERY_CAPACITY: usize = 256;

/// How often the worker publishes a statistics snapshot.
const STATS_INTERVAL: Duration = Duration::from_millis(200);

/// Error returned when an SDU cannot reach the worker thread.
#[derive(Debug)]
pub enum SduSendError {
    Disconnected,
}

/// Control messages for the worker (infrequent).
enum ControlMessage {
    SendSdu { data: Bytes, color: Color },
    Shutdown,
}

/// Counters aggregated across both engines and the socket path.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeStats {
    pub sender: SenderStats,
    pub receiver: ReceiverStats,
    /// Datagrams read off the socket.
    pub datagrams_in: u64,
    /// Datagrams written to the socket.
    pub datagrams_out: u64,
    /// Datagrams that did not decode to a segment.
    pub decode_failures: u64,
    /// Datagrams dropped because the inbound ring was full.
    pub ring_drops: u64,
    /// Blocks dropped because the client stopped consuming.
    pub delivery_drops: u64,
}

/// Thread-safe handle to a running LTP node.
///
/// Dropping the runtime triggers a graceful shutdown of all threads.
pub struct NodeRuntime {
    control_tx: Sender<ControlMessage>,
    delivery_rx: Receiver<DeliveredBlock>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<Mutex<NodeStats>>,
    clock: AosClock,
    local_addr: SocketAddr,
    worker: Option<thread::JoinHandle<()>>,
    reader: Option<thread::JoinHandle<()>>,
}

impl NodeRuntime {
    /// Binds the socket and starts the reader, clock and worker
    /// threads.
    pub fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(config.bind)?;
        socket.connect(config.peer)?;
        let local_addr = socket.local_addr()?;
        let reader_socket = socket.try_clone()?;

        let (datagram_tx, datagram_rx) = rtrb::RingBuffer::new(RING_CAPACITY);
        let (control_tx, control_rx) = bounded(64);
        let (tick_tx, tick_rx) = bounded(8);
        let (delivery_tx, delivery_rx) = bounded(DELIVERY_CAPACITY);

        let stats = Arc::new(Mutex::new(NodeStats::default()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let clock = AosClock::start(tick_tx);

        let stats_clone = stats.clone();
        let shutdown_clone = shutdown.clone();
        let sender_config = config.sender.clone();
        let receiver_config = config.receiver.clone();
        let worker = thread::Builder::new()
            .name("aphelion-worker".into())
            .spawn(move || {
                worker_loop(
                    datagram_rx,
                    control_rx,
                    tick_rx,
                    socket,
                    delivery_tx,
                    stats_clone,
                    shutdown_clone,
                    sender_config,
                    receiver_config,
                )
            })?;

        let stats_clone = stats.clone();
        let shutdown_clone = shutdown.clone();
        let reader = thread::Builder::new()
            .name("aphelion-reader".into())
            .spawn(move || reader_loop(reader_socket, datagram_tx, stats_clone, shutdown_clone))?;

        info!(bind = %local_addr, peer = %config.peer, "ltp node running");
        Ok(Self {
            control_tx,
            delivery_rx,
            shutdown,
            stats,
            clock,
            local_addr,
            worker: Some(worker),
            reader: Some(reader),
        })
    }

    /// Local socket address, useful when binding to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queues one service data unit for transmission.
    pub fn send_sdu(&self, data: Bytes, color: Color) -> Result<(), SduSendError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(SduSendError::Disconnected);
        }
        self.control_tx
            .send(ControlMessage::SendSdu { data, color })
            .map_err(|_| SduSendError::Disconnected)
    }

    /// Channel of blocks reassembled from the peer.
    pub fn deliveries(&self) -> &Receiver<DeliveredBlock> {
        &self.delivery_rx
    }

    /// Marks link acquisition up or down. While down, the AOS counter
    /// pauses and no session deadline can expire.
    pub fn set_aos(&self, up: bool) {
        self.clock.set_counting(up);
    }

    /// Latest statistics snapshot.
    pub fn stats(&self) -> NodeStats {
        self.stats.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Gracefully shuts down all threads. Idempotent.
    pub fn shutdown(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        let _ = self.control_tx.send(ControlMessage::Shutdown);
        self.clock.stop();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for NodeRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn reader_loop(
    socket: UdpSocket,
    mut datagram_tx: rtrb::Producer<Bytes>,
    stats: Arc<Mutex<NodeStats>>,
    shutdown: Arc<AtomicBool>,
) {
    if let Err(e) = socket.set_read_timeout(Some(Duration::from_millis(100))) {
        warn!(error = %e, "failed to set socket read timeout");
        return;
    }
    let mut buf = [0u8; 65536];
    let mut drops: u64 = 0;
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                if datagram_tx.push(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    drops += 1;
                    if drops.is_power_of_two() {
                        warn!(drops, "inbound ring full, dropping datagram");
                    }
                    if let Ok(mut s) = stats.lock() {
                        s.ring_drops = drops;
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                debug!(error = %e, "socket recv error");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn worker_loop(
    mut datagram_rx: rtrb::Consumer<Bytes>,
    control_rx: Receiver<ControlMessage>,
    tick_rx: Receiver<u64>,
    socket: UdpSocket,
    delivery_tx: Sender<DeliveredBlock>,
    stats: Arc<Mutex<NodeStats>>,
    shutdown: Arc<AtomicBool>,
    sender_config: aphelion_ltp::sender::SenderConfig,
    receiver_config: aphelion_ltp::receiver::ReceiverConfig,
) {
    let mut tx = SenderEngine::new(sender_config);
    let mut rx = ReceiverEngine::new(receiver_config);

    let started = Instant::now();
    let mut last_snapshot = started;
    let mut now: u64 = 0;
    let mut datagrams_in: u64 = 0;
    let mut datagrams_out: u64 = 0;
    let mut decode_failures: u64 = 0;
    let mut delivery_drops: u64 = 0;

    loop {
        let mut did_work = false;

        // inbound datagrams
        while let Ok(datagram) = datagram_rx.pop() {
            did_work = true;
            datagrams_in += 1;
            let mut slice = &datagram[..];
            match Segment::decode(&mut slice) {
                Some(segment) => {
                    if segment.from_block_sender() {
                        rx.handle_segment(segment, now);
                    } else {
                        tx.handle_segment(segment, now);
                    }
                }
                None => {
                    decode_failures += 1;
                    warn!(len = datagram.len(), "datagram did not decode, dropped");
                }
            }
        }

        // control path
        match control_rx.try_recv() {
            Ok(ControlMessage::SendSdu { data, color }) => {
                did_work = true;
                let now_ms = started.elapsed().as_millis() as u64;
                if !tx.queue_sdu(data, color, now_ms, now) {
                    warn!("sdu refused, session table full");
                }
            }
            Ok(ControlMessage::Shutdown) => break,
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => break,
        }

        // AOS ticks drive both timer wheels
        while let Ok(tick) = tick_rx.try_recv() {
            did_work = true;
            now = tick;
            tx.service_timers(now);
            rx.service_timers(now);
        }

        tx.poll_aggregation(started.elapsed().as_millis() as u64, now);

        for event in tx.drain_events().collect::<Vec<_>>() {
            match event {
                SenderEvent::Transmit(segment) => {
                    transmit(&socket, &segment, &mut datagrams_out);
                }
                SenderEvent::BlockCompleted { session } => {
                    info!(%session, "block delivered to peer");
                }
                SenderEvent::BlockFailed { session, reason, by_peer } => {
                    warn!(%session, ?reason, by_peer, "block failed");
                }
                SenderEvent::SessionClosed { session } => {
                    debug!(%session, "sending session closed");
                }
            }
        }
        for event in rx.drain_events().collect::<Vec<_>>() {
            match event {
                ReceiverEvent::Transmit(segment) => {
                    transmit(&socket, &segment, &mut datagrams_out);
                }
                ReceiverEvent::Deliver(block) => {
                    let bytes = block.data.len() as u64;
                    if delivery_tx.try_send(block).is_ok() {
                        // the block left the engine; return its quota
                        rx.credit_delivery(bytes);
                    } else {
                        delivery_drops += 1;
                        warn!(delivery_drops, "client not consuming, block dropped");
                    }
                }
                ReceiverEvent::SessionCancelled { session, reason, by_peer } => {
                    warn!(%session, ?reason, by_peer, "receiving session cancelled");
                }
                ReceiverEvent::SessionClosed { session } => {
                    debug!(%session, "receiving session closed");
                }
            }
        }

        if last_snapshot.elapsed() >= STATS_INTERVAL {
            if let Ok(mut s) = stats.lock() {
                s.sender = tx.stats().clone();
                s.receiver = rx.stats().clone();
                s.datagrams_in = datagrams_in;
                s.datagrams_out = datagrams_out;
                s.decode_failures = decode_failures;
                s.delivery_drops = delivery_drops;
            }
            last_snapshot = Instant::now();
        }

        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        if !did_work {
            thread::sleep(Duration::from_micros(200));
        }
    }

    // final snapshot so stats() after shutdown reflects all work
    if let Ok(mut s) = stats.lock() {
        s.sender = tx.stats().clone();
        s.receiver = rx.stats().clone();
        s.datagrams_in = datagrams_in;
        s.datagrams_out = datagrams_out;
        s.decode_failures = decode_failures;
        s.delivery_drops = delivery_drops;
    }
}

fn transmit(socket: &UdpSocket, segment: &Segment, datagrams_out: &mut u64) {
    let buf = segment.encode();
    match socket.send(&buf) {
        Ok(_) => *datagrams_out += 1,
        Err(e) => warn!(kind = segment.kind_str(), error = %e, "transmit failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfigInput;
    use aphelion_ltp::wire::{DataSegment, ReportClaim, ReportSegment, SegmentHeader, SERVICE_ID_SINGLE};

    /// Runtime plus a raw socket standing in for the peer engine.
    fn runtime_with_peer() -> (NodeRuntime, UdpSocket) {
        let peer = UdpSocket::bind("127.0.0.1:0").expect("peer bind");
        peer.set_read_timeout(Some(Duration::from_secs(5))).expect("peer timeout");

        let config = NodeConfigInput {
            engine_id: Some(11),
            bind: "127.0.0.1:0".into(),
            peer: peer.local_addr().expect("peer addr").to_string(),
            agg_time_ms: Some(0),
            seg_size: Some(64),
            ..Default::default()
        }
        .resolve()
        .expect("config should resolve");
        let runtime = NodeRuntime::start(config).expect("runtime should start");
        peer.connect(runtime.local_addr()).expect("peer connect");
        (runtime, peer)
    }

    fn recv_segment(peer: &UdpSocket) -> Segment {
        let mut buf = [0u8; 65536];
        let n = peer.recv(&mut buf).expect("datagram expected");
        let mut slice = &buf[..n];
        Segment::decode(&mut slice).expect("peer datagram should decode")
    }

    #[test]
    fn shutdown_is_idempotent_and_drop_shuts_down() {
        let (mut runtime, _peer) = runtime_with_peer();
        runtime.shutdown();
        runtime.shutdown();

        let (runtime, _peer) = runtime_with_peer();
        drop(runtime);
    }

    #[test]
    fn send_sdu_after_shutdown_is_refused() {
        let (mut runtime, _peer) = runtime_with_peer();
        runtime.shutdown();
        assert!(matches!(
            runtime.send_sdu(Bytes::from_static(b"late"), Color::Green),
            Err(SduSendError::Disconnected)
        ));
    }

    #[test]
    fn green_sdu_reaches_the_wire() {
        let (runtime, peer) = runtime_with_peer();
        runtime
            .send_sdu(Bytes::from(vec![0x5A; 100]), Color::Green)
            .expect("sdu accepted");

        let mut total = 0usize;
        let mut saw_eob = false;
        while !saw_eob {
            match recv_segment(&peer) {
                Segment::Data(ds) => {
                    assert_eq!(ds.color, Color::Green);
                    total += ds.payload.len();
                    saw_eob = ds.end_of_block;
                }
                other => panic!("unexpected {} from green send", other.kind_str()),
            }
        }
        assert_eq!(total, 100);
    }

    #[test]
    fn inbound_green_block_is_delivered() {
        let (runtime, peer) = runtime_with_peer();

        let ds = DataSegment::new(
            aphelion_ltp::wire::SessionId::new(99, 1),
            SERVICE_ID_SINGLE,
            Color::Green,
            0,
            Bytes::from_static(b"over the air"),
        )
        .with_end_of_block();
        peer.send(&Segment::Data(ds).encode()).expect("peer send");

        let block = runtime
            .deliveries()
            .recv_timeout(Duration::from_secs(5))
            .expect("block should be delivered");
        assert_eq!(block.color, Color::Green);
        assert_eq!(block.data.as_ref(), b"over the air");
    }

    #[test]
    fn red_block_handshake_over_udp() {
        let (runtime, peer) = runtime_with_peer();
        let payload = Bytes::from((0u8..150).collect::<Vec<u8>>());
        runtime.send_sdu(payload.clone(), Color::Red).expect("sdu accepted");

        // collect the whole red block as the peer engine would
        let mut segments = Vec::new();
        loop {
            match recv_segment(&peer) {
                Segment::Data(ds) => {
                    assert_eq!(ds.color, Color::Red);
                    let done = ds.end_of_block;
                    segments.push(ds);
                    if done {
                        break;
                    }
                }
                other => panic!("unexpected {} before block end", other.kind_str()),
            }
        }
        let last = segments.last().expect("at least one segment");
        assert!(last.checkpoint);
        let total: usize = segments.iter().map(|ds| ds.payload.len()).sum();
        assert_eq!(total, payload.len());

        // claim everything; the node must ack the report and complete
        let session = last.header.session;
        let report = ReportSegment {
            header: SegmentHeader::new(session),
            report_serial: 21,
            checkpoint_id: last.checkpoint_id,
            upper_bounds: total as u64,
            lower_bounds: 0,
            claims: vec![ReportClaim::new(0, total as u64)],
        };
        peer.send(&Segment::Report(report).encode()).expect("peer send");

        match recv_segment(&peer) {
            Segment::ReportAck(ras) => assert_eq!(ras.report_serial, 21),
            other => panic!("expected report ack, got {}", other.kind_str()),
        }
    }
}
