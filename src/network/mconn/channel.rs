//! Logical channels of a multiplexed connection

use crate::network::mconn::packet::{MsgPacket, MAX_MSG_PACKET_PAYLOAD_SIZE};
use crate::network::mconn::MConnError;
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 1;
pub const DEFAULT_RECV_BUFFER_CAPACITY: usize = 4096;
pub const DEFAULT_RECV_MESSAGE_CAPACITY: usize = 22_020_096; // 21MB

/// Weight of the previous recently-sent total at each decay tick
const RECENTLY_SENT_DECAY: f64 = 0.8;

/// Static description of a channel, declared by the reactor owning it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub id: u8,
    pub priority: u32,
    pub send_queue_capacity: usize,
    pub recv_buffer_capacity: usize,
    pub recv_message_capacity: usize,
}

impl ChannelDescriptor {
    pub fn new(id: u8, priority: u32) -> Self {
        Self {
            id,
            priority,
            send_queue_capacity: DEFAULT_SEND_QUEUE_CAPACITY,
            recv_buffer_capacity: DEFAULT_RECV_BUFFER_CAPACITY,
            recv_message_capacity: DEFAULT_RECV_MESSAGE_CAPACITY,
        }
    }

    pub fn with_send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Replace zero values with the defaults
    pub fn fill_defaults(mut self) -> Self {
        if self.priority == 0 {
            self.priority = 1;
        }
        if self.send_queue_capacity == 0 {
            self.send_queue_capacity = DEFAULT_SEND_QUEUE_CAPACITY;
        }
        if self.recv_buffer_capacity == 0 {
            self.recv_buffer_capacity = DEFAULT_RECV_BUFFER_CAPACITY;
        }
        if self.recv_message_capacity == 0 {
            self.recv_message_capacity = DEFAULT_RECV_MESSAGE_CAPACITY;
        }
        self
    }
}

/// Status of one channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelStatus {
    pub id: u8,
    pub send_queue_capacity: usize,
    pub send_queue_size: usize,
    pub priority: u32,
    pub recently_sent: u64,
}

/// Caller side of a channel: the bounded send queue
#[derive(Debug, Clone)]
pub(crate) struct ChannelHandle {
    pub desc: ChannelDescriptor,
    pub queue: mpsc::Sender<Bytes>,
    pub recently_sent: Arc<AtomicU64>,
}

impl ChannelHandle {
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus {
            id: self.desc.id,
            send_queue_capacity: self.desc.send_queue_capacity,
            send_queue_size: self.queue.max_capacity() - self.queue.capacity(),
            priority: self.desc.priority,
            recently_sent: self.recently_sent.load(Ordering::Relaxed),
        }
    }
}

/// Sending state of a channel, owned by the send routine
#[derive(Debug)]
pub(crate) struct SendChannel {
    pub desc: ChannelDescriptor,
    queue: mpsc::Receiver<Bytes>,
    /// Remainder of the message being sent
    sending: Option<Bytes>,
    recently_sent: f64,
    published: Arc<AtomicU64>,
}

/// Create the two ends of a channel
pub(crate) fn new_channel(desc: ChannelDescriptor) -> (ChannelHandle, SendChannel) {
    let desc = desc.fill_defaults();
    let (tx, rx) = mpsc::channel(desc.send_queue_capacity);
    let published = Arc::new(AtomicU64::new(0));
    let handle = ChannelHandle {
        desc: desc.clone(),
        queue: tx,
        recently_sent: published.clone(),
    };
    let channel = SendChannel {
        desc,
        queue: rx,
        sending: None,
        recently_sent: 0.0,
        published,
    };
    (handle, channel)
}

impl SendChannel {
    /// Whether a packet is ready, pulling the next queued message if needed
    pub fn is_send_pending(&mut self) -> bool {
        if self.sending.is_none() {
            self.sending = self.queue.try_recv().ok();
        }
        self.sending.is_some()
    }

    /// Scheduling weight: lower is served first
    pub fn send_ratio(&self) -> f64 {
        self.recently_sent / self.desc.priority as f64
    }

    /// Cut the next packet off the pending message
    pub fn next_msg_packet(&mut self) -> Option<MsgPacket> {
        let mut sending = self.sending.take()?;
        let len = sending.len().min(MAX_MSG_PACKET_PAYLOAD_SIZE);
        let bytes = sending.split_to(len);
        let eof = sending.is_empty();
        if !eof {
            self.sending = Some(sending);
        }
        Some(MsgPacket {
            channel_id: self.desc.id,
            eof,
            bytes,
        })
    }

    pub fn record_sent(&mut self, n: usize) {
        self.recently_sent += n as f64;
        self.published.store(self.recently_sent as u64, Ordering::Relaxed);
    }

    /// Exponentially decay the recently-sent total
    pub fn decay(&mut self) {
        self.recently_sent *= RECENTLY_SENT_DECAY;
        self.published.store(self.recently_sent as u64, Ordering::Relaxed);
    }
}

/// Receiving state of a channel, owned by the receive routine
#[derive(Debug)]
pub(crate) struct RecvChannel {
    pub desc: ChannelDescriptor,
    recving: BytesMut,
}

impl RecvChannel {
    pub fn new(desc: ChannelDescriptor) -> Self {
        let desc = desc.fill_defaults();
        Self {
            recving: BytesMut::with_capacity(desc.recv_buffer_capacity),
            desc,
        }
    }

    /// Append a packet; returns the whole message once its last packet arrives
    pub fn recv_msg_packet(&mut self, packet: MsgPacket) -> Result<Option<Bytes>, MConnError> {
        let total = self.recving.len() + packet.bytes.len();
        if total > self.desc.recv_message_capacity {
            return Err(MConnError::MessageTooLarge(total));
        }
        self.recving.extend_from_slice(&packet.bytes);
        if packet.eof {
            let msg = self.recving.split().freeze();
            self.recving.reserve(self.desc.recv_buffer_capacity);
            return Ok(Some(msg));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_split_into_packets() {
        let (handle, mut channel) = new_channel(ChannelDescriptor::new(4, 1));
        handle
            .queue
            .try_send(Bytes::from(vec![1u8; MAX_MSG_PACKET_PAYLOAD_SIZE + 10]))
            .unwrap();
        assert_eq!(handle.status().send_queue_size, 1);

        assert!(channel.is_send_pending());
        assert_eq!(handle.status().send_queue_size, 0);
        let first = channel.next_msg_packet().unwrap();
        assert_eq!(first.bytes.len(), MAX_MSG_PACKET_PAYLOAD_SIZE);
        assert!(!first.eof);

        let second = channel.next_msg_packet().unwrap();
        assert_eq!(second.bytes.len(), 10);
        assert!(second.eof);
        assert_eq!(second.channel_id, 4);
        assert!(!channel.is_send_pending());
    }

    #[test]
    fn test_exact_payload_is_one_packet() {
        let (handle, mut channel) = new_channel(ChannelDescriptor::new(1, 1));
        handle
            .queue
            .try_send(Bytes::from(vec![0u8; MAX_MSG_PACKET_PAYLOAD_SIZE]))
            .unwrap();
        assert!(channel.is_send_pending());
        assert!(channel.next_msg_packet().unwrap().eof);
        assert!(channel.next_msg_packet().is_none());
    }

    #[test]
    fn test_decay_and_ratio() {
        let (handle, mut channel) = new_channel(ChannelDescriptor::new(1, 4));
        channel.record_sent(1000);
        assert_eq!(channel.send_ratio(), 250.0);
        channel.decay();
        assert_eq!(handle.status().recently_sent, 800);
    }

    #[test]
    fn test_reassembly_and_capacity() {
        let mut desc = ChannelDescriptor::new(2, 1);
        desc.recv_message_capacity = 8;
        let mut channel = RecvChannel::new(desc);

        let part = |bytes: &'static [u8], eof| MsgPacket {
            channel_id: 2,
            eof,
            bytes: Bytes::from_static(bytes),
        };
        assert_eq!(channel.recv_msg_packet(part(b"abc", false)).unwrap(), None);
        assert_eq!(
            channel.recv_msg_packet(part(b"de", true)).unwrap(),
            Some(Bytes::from_static(b"abcde"))
        );
        assert!(matches!(
            channel.recv_msg_packet(part(b"123456789", true)),
            Err(MConnError::MessageTooLarge(9))
        ));
    }
}
