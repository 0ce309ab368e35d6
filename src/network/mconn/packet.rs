//! Multiplex wire packets
//!
//! Ping: `0x01`
//! Pong: `0x02`
//! Msg:  `0x03 | channel_id u8 | eof u8 | len u16 BE | bytes`

use crate::network::mconn::MConnError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

pub const PACKET_TYPE_PING: u8 = 0x01;
pub const PACKET_TYPE_PONG: u8 = 0x02;
pub const PACKET_TYPE_MSG: u8 = 0x03;

/// Largest payload of one msg packet
pub const MAX_MSG_PACKET_PAYLOAD_SIZE: usize = 1024;

/// Type, channel id, eof flag and length
pub const MAX_MSG_PACKET_OVERHEAD_SIZE: usize = 1 + 1 + 1 + 2;

/// Largest msg packet on the wire
pub const MAX_MSG_PACKET_TOTAL_SIZE: usize = MAX_MSG_PACKET_PAYLOAD_SIZE + MAX_MSG_PACKET_OVERHEAD_SIZE;

/// One fragment of a channel message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsgPacket {
    pub channel_id: u8,
    /// Set on the last fragment of a message
    pub eof: bool,
    pub bytes: Bytes,
}

/// A packet on the multiplexed stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Ping,
    Pong,
    Msg(MsgPacket),
}

impl Packet {
    /// Encoded size of this packet
    pub fn wire_size(&self) -> usize {
        match self {
            Packet::Ping | Packet::Pong => 1,
            Packet::Msg(msg) => MAX_MSG_PACKET_OVERHEAD_SIZE + msg.bytes.len(),
        }
    }
}

/// Codec for [`Packet`]s
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Encoder<Packet> for PacketCodec {
    type Error = MConnError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Packet::Ping => dst.put_u8(PACKET_TYPE_PING),
            Packet::Pong => dst.put_u8(PACKET_TYPE_PONG),
            Packet::Msg(msg) => {
                if msg.bytes.len() > MAX_MSG_PACKET_PAYLOAD_SIZE {
                    return Err(MConnError::MessageTooLarge(msg.bytes.len()));
                }
                dst.reserve(MAX_MSG_PACKET_OVERHEAD_SIZE + msg.bytes.len());
                dst.put_u8(PACKET_TYPE_MSG);
                dst.put_u8(msg.channel_id);
                dst.put_u8(msg.eof as u8);
                dst.put_u16(msg.bytes.len() as u16);
                dst.put_slice(&msg.bytes);
            }
        }
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = MConnError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(&packet_type) = src.first() else {
            return Ok(None);
        };

        match packet_type {
            PACKET_TYPE_PING => {
                src.advance(1);
                Ok(Some(Packet::Ping))
            }
            PACKET_TYPE_PONG => {
                src.advance(1);
                Ok(Some(Packet::Pong))
            }
            PACKET_TYPE_MSG => {
                if src.len() < MAX_MSG_PACKET_OVERHEAD_SIZE {
                    return Ok(None);
                }
                let eof = match src[2] {
                    0 => false,
                    1 => true,
                    other => return Err(MConnError::WireDecode(format!("invalid eof flag {}", other))),
                };
                let len = u16::from_be_bytes([src[3], src[4]]) as usize;
                if len > MAX_MSG_PACKET_PAYLOAD_SIZE {
                    return Err(MConnError::WireDecode(format!("msg packet payload of {} bytes", len)));
                }
                if src.len() < MAX_MSG_PACKET_OVERHEAD_SIZE + len {
                    src.reserve(MAX_MSG_PACKET_OVERHEAD_SIZE + len - src.len());
                    return Ok(None);
                }

                let channel_id = src[1];
                src.advance(MAX_MSG_PACKET_OVERHEAD_SIZE);
                let bytes = src.split_to(len).freeze();
                Ok(Some(Packet::Msg(MsgPacket {
                    channel_id,
                    eof,
                    bytes,
                })))
            }
            other => Err(MConnError::WireDecode(format!("unknown packet type {:#04x}", other))),
        }
    }
}
