// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::error::DecodeError;
use crate::host::{HostId, NO_HOST};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// `[kind][senderId][receiverId][id][seqNum]`, four big-endian bytes each.
pub const HEADER_LEN: usize = 20;

/// Largest payload a UDP datagram can carry over IPv4; no encoded message may
/// exceed it.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum MessageKind {
    Ack,
    Data,
    Heartbeat,
    HeartbeatAck,
}

impl MessageKind {
    pub fn code(self) -> u32 {
        match self {
            MessageKind::Ack => 0,
            MessageKind::Data => 1,
            MessageKind::Heartbeat => 2,
            MessageKind::HeartbeatAck => 3,
        }
    }

    pub fn from_code(code: u32) -> Result<Self, DecodeError> {
        match code {
            0 => Ok(MessageKind::Ack),
            1 => Ok(MessageKind::Data),
            2 => Ok(MessageKind::Heartbeat),
            3 => Ok(MessageKind::HeartbeatAck),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }

    /// Heartbeat traffic belongs to the failure detector, everything else to
    /// the link/broadcast/agreement stack.
    pub fn is_control(self) -> bool {
        matches!(self, MessageKind::Heartbeat | MessageKind::HeartbeatAck)
    }
}

/// The unit every layer exchanges. `id` is stamped by the link that sends the
/// message; `seq_num` belongs to whichever layer originated it.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Message {
    pub kind: MessageKind,
    pub id: u32,
    pub sender_id: HostId,
    pub receiver_id: HostId,
    pub seq_num: u32,
    pub payload: Bytes,
}

pub(crate) fn need(buf: &Bytes, needed: usize) -> Result<(), DecodeError> {
    if buf.remaining() < needed {
        return Err(DecodeError::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

fn id_payload(id: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    buf.put_u32(id);
    buf.freeze()
}

impl Message {
    /// A DATA message with no receiver and no link id yet.
    pub fn data(sender_id: HostId, seq_num: u32, payload: Bytes) -> Self {
        Message {
            kind: MessageKind::Data,
            id: 0,
            sender_id,
            receiver_id: NO_HOST,
            seq_num,
            payload,
        }
    }

    pub fn heartbeat(sender_id: HostId) -> Self {
        Message {
            kind: MessageKind::Heartbeat,
            id: 0,
            sender_id,
            receiver_id: NO_HOST,
            seq_num: 0,
            payload: Bytes::new(),
        }
    }

    /// The acknowledgement `from` returns for this message.
    pub fn ack(&self, from: HostId) -> Self {
        Message {
            kind: MessageKind::Ack,
            id: self.id,
            sender_id: from,
            receiver_id: self.sender_id,
            seq_num: self.seq_num,
            payload: id_payload(self.id),
        }
    }

    /// The reply `from` returns for this heartbeat.
    pub fn heartbeat_ack(&self, from: HostId) -> Self {
        Message {
            kind: MessageKind::HeartbeatAck,
            id: 0,
            sender_id: from,
            receiver_id: self.sender_id,
            seq_num: 0,
            payload: id_payload(self.id),
        }
    }

    /// The id carried in an ACK or HEARTBEAT_ACK payload.
    pub fn acked_id(&self) -> Result<u32, DecodeError> {
        let mut payload = self.payload.clone();
        need(&payload, 4)?;
        Ok(payload.get_u32())
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.kind.code());
        buf.put_u32(self.sender_id);
        buf.put_u32(self.receiver_id);
        buf.put_u32(self.id);
        buf.put_u32(self.seq_num);
        buf.put_slice(&self.payload);
    }

    /// Decodes a whole datagram; the payload runs to the end of it.
    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        need(&buf, HEADER_LEN)?;
        let kind = MessageKind::from_code(buf.get_u32())?;
        let sender_id = buf.get_u32();
        let receiver_id = buf.get_u32();
        let id = buf.get_u32();
        let seq_num = buf.get_u32();
        Ok(Message {
            kind,
            id,
            sender_id,
            receiver_id,
            seq_num,
            payload: buf,
        })
    }

    /// Length-prefixed form used to nest messages inside other payloads.
    pub fn encode_framed(&self, buf: &mut BytesMut) {
        buf.put_u32(self.encoded_len() as u32);
        self.encode_into(buf);
    }

    pub fn decode_framed(buf: &mut Bytes) -> Result<Self, DecodeError> {
        need(buf, 4)?;
        let len = buf.get_u32() as usize;
        need(buf, len)?;
        Message::decode(buf.split_to(len))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} #{} {}->{} seq {} ({} bytes)",
            self.kind,
            self.id,
            self.sender_id,
            self.receiver_id,
            self.seq_num,
            self.payload.len()
        )
    }
}
