//! Multiplexed connection
//!
//! Runs many logical channels over one byte stream. Each channel has a
//! priority and a bounded send queue; the send routine interleaves message
//! packets from all channels by weighted fair queueing, throttles itself to
//! the configured byte rate, coalesces flushes and keeps the connection alive
//! with pings. The receive routine reassembles messages and hands them to
//! the owner through an mpsc queue.
//!
//! Any I/O or protocol failure stops both routines and fires the error
//! callback exactly once.

pub mod channel;
pub mod flowrate;
pub mod packet;

pub use channel::{ChannelDescriptor, ChannelStatus};
pub use flowrate::{FlowStatus, Monitor};
pub use packet::{MsgPacket, Packet, PacketCodec, MAX_MSG_PACKET_PAYLOAD_SIZE, MAX_MSG_PACKET_TOTAL_SIZE};

use crate::network::secret_conn::{BoxedReader, BoxedWriter};
use bytes::Bytes;
use channel::{new_channel, ChannelHandle, RecvChannel, SendChannel};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Packets sent per scheduling round before re-checking timers
const NUM_BATCH_MSG_PACKETS: usize = 10;

/// Interval of the recently-sent decay
const UPDATE_STATS_INTERVAL: Duration = Duration::from_secs(2);

/// Capacity of the queue of reassembled inbound messages
const INBOUND_QUEUE_SIZE: usize = 64;

/// Multiplex connection errors
#[derive(Error, Debug)]
pub enum MConnError {
    #[error("unknown channel {0:#04x}")]
    UnknownChannel(u8),
    #[error("send timed out")]
    SendTimeout,
    #[error("send queue is full")]
    QueueFull,
    #[error("wire decode error: {0}")]
    WireDecode(String),
    #[error("message of {0} bytes exceeds channel capacity")]
    MessageTooLarge(usize),
    #[error("no pong received in time")]
    PongTimeout,
    #[error("connection stopped")]
    Stopped,
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Connection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MConnConfig {
    /// Send rate limit in bytes/s, 0 for unlimited
    pub send_rate: u64,
    /// Receive rate limit in bytes/s, 0 for unlimited
    pub recv_rate: u64,
    #[serde(with = "crate::config::duration_ms")]
    pub flush_throttle: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub ping_interval: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub pong_timeout: Duration,
    #[serde(with = "crate::config::duration_ms")]
    pub send_timeout: Duration,
}

impl Default for MConnConfig {
    fn default() -> Self {
        Self {
            send_rate: 512_000,
            recv_rate: 512_000,
            flush_throttle: Duration::from_millis(100),
            ping_interval: Duration::from_secs(40),
            pong_timeout: Duration::from_secs(35),
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Invoked once with the error that stopped the connection
pub type ErrorCallback = Box<dyn FnOnce(MConnError) + Send + 'static>;

/// A reassembled inbound message: channel id and bytes
pub type InboundMessage = (u8, Bytes);

/// Transfer statistics of a connection
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub duration: Duration,
    pub send_monitor: FlowStatus,
    pub recv_monitor: FlowStatus,
    pub channels: Vec<ChannelStatus>,
}

struct Routines {
    reader: BoxedReader,
    writer: BoxedWriter,
    send_channels: Vec<SendChannel>,
    inbound: mpsc::Sender<InboundMessage>,
}

struct Shared {
    quit: watch::Sender<bool>,
    stopped: AtomicBool,
    on_error: Mutex<Option<ErrorCallback>>,
}

impl Shared {
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.quit.send_replace(true);
        true
    }

    fn stop_for_error(&self, err: MConnError) {
        if !self.stop() {
            return;
        }
        let callback = self
            .on_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(callback) = callback {
            callback(err);
        }
    }
}

/// A multiplexed connection over a pair of stream halves
pub struct MConnection {
    config: MConnConfig,
    channels: HashMap<u8, ChannelHandle>,
    channel_order: Vec<u8>,
    notify: Arc<Notify>,
    shared: Arc<Shared>,
    send_monitor: Monitor,
    recv_monitor: Monitor,
    created: Instant,
    routines: Mutex<Option<Routines>>,
}

impl MConnection {
    /// Build a connection; reassembled messages are delivered on `inbound`
    /// and `on_error` fires once if the connection fails
    pub fn new(
        reader: BoxedReader,
        writer: BoxedWriter,
        descriptors: &[ChannelDescriptor],
        config: MConnConfig,
        inbound: mpsc::Sender<InboundMessage>,
        on_error: ErrorCallback,
    ) -> Self {
        let mut channels = HashMap::new();
        let mut channel_order = Vec::new();
        let mut send_channels = Vec::new();
        for desc in descriptors {
            let (handle, send_channel) = new_channel(desc.clone());
            channel_order.push(desc.id);
            channels.insert(desc.id, handle);
            send_channels.push(send_channel);
        }

        let (quit, _) = watch::channel(false);
        Self {
            config,
            channels,
            channel_order,
            notify: Arc::new(Notify::new()),
            shared: Arc::new(Shared {
                quit,
                stopped: AtomicBool::new(false),
                on_error: Mutex::new(Some(on_error)),
            }),
            send_monitor: Monitor::new(),
            recv_monitor: Monitor::new(),
            created: Instant::now(),
            routines: Mutex::new(Some(Routines {
                reader,
                writer,
                send_channels,
                inbound,
            })),
        }
    }

    /// A bounded queue suitable for [`MConnection::new`]'s `inbound`
    pub fn inbound_queue() -> (mpsc::Sender<InboundMessage>, mpsc::Receiver<InboundMessage>) {
        mpsc::channel(INBOUND_QUEUE_SIZE)
    }

    /// Spawn the send and receive routines; later calls do nothing
    pub fn start(&self) {
        let routines = self
            .routines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(routines) = routines else {
            return;
        };
        if self.is_stopped() {
            return;
        }

        let recv_channels = routines
            .send_channels
            .iter()
            .map(|c| (c.desc.id, RecvChannel::new(c.desc.clone())))
            .collect();
        // Ping requests from the receive routine, coalesced to one
        let (pong_tx, pong_rx) = mpsc::channel(1);
        // Pongs seen by the receive routine
        let (pong_seen_tx, pong_seen_rx) = mpsc::channel(1);

        let sender = SendRoutine {
            writer: FramedWrite::new(routines.writer, PacketCodec),
            channels: routines.send_channels,
            config: self.config.clone(),
            notify: self.notify.clone(),
            monitor: self.send_monitor.clone(),
            quit: self.shared.quit.subscribe(),
            pong_rx,
            pong_seen_rx,
        };
        let receiver = RecvRoutine {
            reader: FramedRead::new(routines.reader, PacketCodec),
            channels: recv_channels,
            recv_rate: self.config.recv_rate,
            monitor: self.recv_monitor.clone(),
            quit: self.shared.quit.subscribe(),
            inbound: routines.inbound,
            pong_tx,
            pong_seen_tx,
        };

        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = sender.run().await {
                log::debug!("Connection send routine failed: {}", e);
                shared.stop_for_error(e);
            }
        });
        let shared = self.shared.clone();
        tokio::spawn(async move {
            if let Err(e) = receiver.run().await {
                log::debug!("Connection receive routine failed: {}", e);
                shared.stop_for_error(e);
            }
        });
    }

    /// Stop both routines without firing the error callback
    pub fn stop(&self) {
        if self.shared.stop() {
            // Drop routines that were never started
            self.routines
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn channel(&self, ch_id: u8) -> Result<&ChannelHandle, MConnError> {
        if self.is_stopped() {
            return Err(MConnError::Stopped);
        }
        self.channels.get(&ch_id).ok_or(MConnError::UnknownChannel(ch_id))
    }

    /// Queue `msg` on a channel, waiting up to the send timeout for space
    pub async fn send(&self, ch_id: u8, msg: Bytes) -> Result<(), MConnError> {
        let channel = self.channel(ch_id)?;
        match tokio::time::timeout(self.config.send_timeout, channel.queue.send(msg)).await {
            Ok(Ok(())) => {
                self.notify.notify_one();
                Ok(())
            }
            Ok(Err(_)) => Err(MConnError::Stopped),
            Err(_) => {
                log::debug!("Send on channel {:#04x} timed out", ch_id);
                Err(MConnError::SendTimeout)
            }
        }
    }

    /// Queue `msg` if the channel has room right now
    pub fn try_send(&self, ch_id: u8, msg: Bytes) -> Result<(), MConnError> {
        let channel = self.channel(ch_id)?;
        match channel.queue.try_send(msg) {
            Ok(()) => {
                self.notify.notify_one();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => Err(MConnError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(MConnError::Stopped),
        }
    }

    /// Whether a message queued now would not block
    pub fn can_send(&self, ch_id: u8) -> bool {
        self.channel(ch_id).map_or(false, |c| c.queue.capacity() > 0)
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            duration: self.created.elapsed(),
            send_monitor: self.send_monitor.status(),
            recv_monitor: self.recv_monitor.status(),
            channels: self
                .channel_order
                .iter()
                .filter_map(|id| self.channels.get(id))
                .map(ChannelHandle::status)
                .collect(),
        }
    }
}

impl Drop for MConnection {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

// =============================================================================
// Send routine
// =============================================================================

struct SendRoutine {
    writer: FramedWrite<BoxedWriter, PacketCodec>,
    channels: Vec<SendChannel>,
    config: MConnConfig,
    notify: Arc<Notify>,
    monitor: Monitor,
    quit: watch::Receiver<bool>,
    pong_rx: mpsc::Receiver<()>,
    pong_seen_rx: mpsc::Receiver<()>,
}

impl SendRoutine {
    async fn run(mut self) -> Result<(), MConnError> {
        let now = Instant::now();
        let mut update_stats = tokio::time::interval_at(now + UPDATE_STATS_INTERVAL, UPDATE_STATS_INTERVAL);
        let mut ping = tokio::time::interval_at(now + self.config.ping_interval, self.config.ping_interval);
        let mut flush_at: Option<Instant> = None;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            if *self.quit.borrow() {
                break;
            }
            let pending = self.channels.iter_mut().any(SendChannel::is_send_pending);

            tokio::select! {
                _ = self.quit.changed() => break,
                _ = update_stats.tick() => {
                    self.channels.iter_mut().for_each(SendChannel::decay);
                }
                _ = ping.tick() => {
                    log::trace!("Send ping");
                    self.write_packet(Packet::Ping).await?;
                    self.writer.flush().await?;
                    pong_deadline.get_or_insert(Instant::now() + self.config.pong_timeout);
                }
                Some(()) = self.pong_rx.recv() => {
                    log::trace!("Send pong");
                    self.write_packet(Packet::Pong).await?;
                    self.writer.flush().await?;
                }
                Some(()) = self.pong_seen_rx.recv() => {
                    pong_deadline = None;
                }
                _ = sleep_until(flush_at.unwrap_or(now)), if flush_at.is_some() => {
                    flush_at = None;
                    self.writer.flush().await?;
                }
                _ = sleep_until(pong_deadline.unwrap_or(now)), if pong_deadline.is_some() => {
                    return Err(MConnError::PongTimeout);
                }
                _ = self.notify.notified(), if !pending => {}
                _ = self.monitor.limit(MAX_MSG_PACKET_TOTAL_SIZE, self.config.send_rate), if pending => {
                    if self.send_some_msg_packets().await? {
                        flush_at.get_or_insert(Instant::now() + self.config.flush_throttle);
                    }
                    // Let blocked senders refill their queues before the next batch
                    tokio::task::yield_now().await;
                }
            }
        }

        let _ = self.writer.close().await;
        Ok(())
    }

    async fn write_packet(&mut self, packet: Packet) -> Result<(), MConnError> {
        let size = packet.wire_size();
        self.writer.feed(packet).await?;
        self.monitor.update(size);
        Ok(())
    }

    /// Send up to a batch of packets; returns whether anything was written
    async fn send_some_msg_packets(&mut self) -> Result<bool, MConnError> {
        let mut sent_any = false;
        for _ in 0..NUM_BATCH_MSG_PACKETS {
            if !self.send_msg_packet().await? {
                break;
            }
            sent_any = true;
        }
        Ok(sent_any)
    }

    /// Send one packet from the channel with the lowest sent/priority ratio
    async fn send_msg_packet(&mut self) -> Result<bool, MConnError> {
        let mut least: Option<(usize, f64)> = None;
        for (idx, channel) in self.channels.iter_mut().enumerate() {
            if !channel.is_send_pending() {
                continue;
            }
            let ratio = channel.send_ratio();
            if least.map_or(true, |(_, best)| ratio < best) {
                least = Some((idx, ratio));
            }
        }
        let Some((idx, _)) = least else {
            return Ok(false);
        };

        let Some(packet) = self.channels[idx].next_msg_packet() else {
            return Ok(false);
        };
        let packet = Packet::Msg(packet);
        let size = packet.wire_size();
        self.write_packet(packet).await?;
        self.channels[idx].record_sent(size);
        Ok(true)
    }
}

// =============================================================================
// Receive routine
// =============================================================================

struct RecvRoutine {
    reader: FramedRead<BoxedReader, PacketCodec>,
    channels: HashMap<u8, RecvChannel>,
    recv_rate: u64,
    monitor: Monitor,
    quit: watch::Receiver<bool>,
    inbound: mpsc::Sender<InboundMessage>,
    pong_tx: mpsc::Sender<()>,
    pong_seen_tx: mpsc::Sender<()>,
}

impl RecvRoutine {
    async fn run(mut self) -> Result<(), MConnError> {
        loop {
            if *self.quit.borrow() {
                return Ok(());
            }
            let packet = tokio::select! {
                _ = self.quit.changed() => return Ok(()),
                packet = Self::next_packet(&mut self.reader, &self.monitor, self.recv_rate) => packet?,
            };
            let Some(packet) = packet else {
                if *self.quit.borrow() {
                    return Ok(());
                }
                return Err(MConnError::IoError(std::io::ErrorKind::UnexpectedEof.into()));
            };
            self.monitor.update(packet.wire_size());

            match packet {
                Packet::Ping => {
                    log::trace!("Receive ping");
                    let _ = self.pong_tx.try_send(());
                }
                Packet::Pong => {
                    log::trace!("Receive pong");
                    let _ = self.pong_seen_tx.try_send(());
                }
                Packet::Msg(msg) => {
                    let ch_id = msg.channel_id;
                    let channel = self
                        .channels
                        .get_mut(&ch_id)
                        .ok_or(MConnError::UnknownChannel(ch_id))?;
                    if let Some(bytes) = channel.recv_msg_packet(msg)? {
                        log::trace!("Received {} bytes on channel {:#04x}", bytes.len(), ch_id);
                        tokio::select! {
                            _ = self.quit.changed() => return Ok(()),
                            sent = self.inbound.send((ch_id, bytes)) => {
                                if sent.is_err() {
                                    return Err(MConnError::Stopped);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    async fn next_packet(
        reader: &mut FramedRead<BoxedReader, PacketCodec>,
        monitor: &Monitor,
        recv_rate: u64,
    ) -> Result<Option<Packet>, MConnError> {
        monitor.limit(MAX_MSG_PACKET_TOTAL_SIZE, recv_rate).await;
        reader.next().await.transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn unlimited() -> MConnConfig {
        MConnConfig {
            send_rate: 0,
            recv_rate: 0,
            ..MConnConfig::default()
        }
    }

    fn pipe() -> ((BoxedReader, BoxedWriter), (BoxedReader, BoxedWriter)) {
        let (a, b) = duplex(1 << 20);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        ((Box::new(ar), Box::new(aw)), (Box::new(br), Box::new(bw)))
    }

    fn connection(
        halves: (BoxedReader, BoxedWriter),
        descs: &[ChannelDescriptor],
        config: MConnConfig,
    ) -> (MConnection, mpsc::Receiver<InboundMessage>, mpsc::UnboundedReceiver<MConnError>) {
        let (inbound_tx, inbound_rx) = MConnection::inbound_queue();
        let (err_tx, err_rx) = mpsc::unbounded_channel();
        let conn = MConnection::new(
            halves.0,
            halves.1,
            descs,
            config,
            inbound_tx,
            Box::new(move |e| {
                let _ = err_tx.send(e);
            }),
        );
        (conn, inbound_rx, err_rx)
    }

    #[tokio::test]
    async fn test_send_receive_large_message() {
        let descs = [ChannelDescriptor::new(0x01, 1), ChannelDescriptor::new(0x02, 5)];
        let (a, b) = pipe();
        let (conn_a, _, _) = connection(a, &descs, unlimited());
        let (conn_b, mut inbound_b, _) = connection(b, &descs, unlimited());
        conn_a.start();
        conn_b.start();

        let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        conn_a.send(0x02, Bytes::from(big.clone())).await.unwrap();
        conn_a.send(0x01, Bytes::from_static(b"small")).await.unwrap();

        let mut received = HashMap::new();
        for _ in 0..2 {
            let (ch, msg) = inbound_b.recv().await.unwrap();
            received.insert(ch, msg);
        }
        assert_eq!(received[&0x02].as_ref(), big.as_slice());
        assert_eq!(received[&0x01].as_ref(), b"small");
        assert!(conn_a.status().send_monitor.bytes > 5000);
    }

    #[tokio::test]
    async fn test_unknown_channel_and_queue_full() {
        let (a, _b) = pipe();
        let (conn, _, _) = connection(a, &[ChannelDescriptor::new(0x01, 1)], unlimited());

        assert!(matches!(
            conn.try_send(0x09, Bytes::new()),
            Err(MConnError::UnknownChannel(0x09))
        ));
        assert!(conn.can_send(0x01));
        conn.try_send(0x01, Bytes::from_static(b"one")).unwrap();
        assert!(!conn.can_send(0x01));
        assert!(matches!(
            conn.try_send(0x01, Bytes::from_static(b"two")),
            Err(MConnError::QueueFull)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_times_out() {
        let (a, _b) = pipe();
        let (conn, _, _) = connection(a, &[ChannelDescriptor::new(0x01, 1)], unlimited());
        conn.try_send(0x01, Bytes::from_static(b"fill")).unwrap();
        assert!(matches!(
            conn.send(0x01, Bytes::from_static(b"blocked")).await,
            Err(MConnError::SendTimeout)
        ));
    }

    #[tokio::test]
    async fn test_garbage_fires_error_once() {
        let (a, b) = pipe();
        let (conn, _, mut errors) = connection(a, &[ChannelDescriptor::new(0x01, 1)], unlimited());
        conn.start();

        let (_, mut raw_writer) = b;
        tokio::io::AsyncWriteExt::write_all(&mut raw_writer, &[0xff, 0xff]).await.unwrap();

        let err = errors.recv().await.unwrap();
        assert!(matches!(err, MConnError::WireDecode(_)));
        assert!(conn.is_stopped());
        assert!(matches!(conn.try_send(0x01, Bytes::new()), Err(MConnError::Stopped)));
        conn.stop();
        assert!(errors.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unknown_inbound_channel_is_fatal() {
        let (a, b) = pipe();
        let (conn_a, _, _) = connection(a, &[ChannelDescriptor::new(0x07, 1)], unlimited());
        let (conn_b, _, mut errors) = connection(b, &[ChannelDescriptor::new(0x01, 1)], unlimited());
        conn_a.start();
        conn_b.start();
        conn_a.send(0x07, Bytes::from_static(b"hi")).await.unwrap();
        assert!(matches!(errors.recv().await, Some(MConnError::UnknownChannel(0x07))));
    }

    #[tokio::test]
    async fn test_ping_is_answered_with_pong() {
        let (a, b) = pipe();
        let (conn, _, _) = connection(a, &[ChannelDescriptor::new(0x01, 1)], unlimited());
        conn.start();

        let (raw_reader, mut raw_writer) = b;
        tokio::io::AsyncWriteExt::write_all(&mut raw_writer, &[0x01]).await.unwrap();
        let mut packets = FramedRead::new(raw_reader, PacketCodec);
        assert_eq!(packets.next().await.unwrap().unwrap(), Packet::Pong);
    }

    #[tokio::test]
    async fn test_weighted_fair_scheduling() {
        assert_weighted_split(unlimited()).await;
    }

    #[tokio::test]
    async fn test_weighted_fair_scheduling_rate_limited() {
        assert_weighted_split(MConnConfig {
            send_rate: 2_000_000,
            ..unlimited()
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_weighted_fair_scheduling_multi_thread() {
        assert_weighted_split(unlimited()).await;
    }

    /// Two saturated channels at priorities 1 and 9 share packets about 1:9
    async fn assert_weighted_split(config: MConnConfig) {
        let descs = [
            ChannelDescriptor::new(0x01, 1),
            ChannelDescriptor::new(0x02, 9),
        ];
        let (a, b) = pipe();
        let (conn, _, _) = connection(a, &descs, config);
        let conn = Arc::new(conn);
        conn.start();

        for ch in [0x01u8, 0x02] {
            let conn = conn.clone();
            tokio::spawn(async move {
                let msg = Bytes::from(vec![ch; 100 * MAX_MSG_PACKET_PAYLOAD_SIZE]);
                while conn.send(ch, msg.clone()).await.is_ok() {}
            });
        }

        let (raw_reader, _raw_writer) = b;
        let mut packets = FramedRead::new(raw_reader, PacketCodec);
        let mut counts = HashMap::new();
        let mut seen = 0;
        while seen < 1000 {
            if let Packet::Msg(msg) = packets.next().await.unwrap().unwrap() {
                *counts.entry(msg.channel_id).or_insert(0u32) += 1;
                seen += 1;
            }
        }
        conn.stop();

        let ratio = counts[&0x02] as f64 / counts[&0x01] as f64;
        assert!((8.1..=9.9).contains(&ratio), "ratio {} from {:?}", ratio, counts);
    }
}
