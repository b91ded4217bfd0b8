// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::error::DecodeError;
use crate::message::need;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

pub type Slot = u32;
pub type Value = u32;

const TAG_PROPOSAL: u32 = 1;
const TAG_ACK: u32 = 2;
const TAG_NACK: u32 = 3;

/// A value set offered for `slot` in `round`. Never changed once sent.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub struct Proposal {
    pub round: u32,
    pub slot: Slot,
    pub values: BTreeSet<Value>,
}

/// Everything agreement sends: proposals go to the whole group, acks and
/// nacks go back to the proposer. A nack carries the acceptor's accepted set
/// so the proposer can grow its proposal.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum AgreementMessage {
    Propose(Proposal),
    Ack { round: u32, slot: Slot },
    Nack(Proposal),
}

impl AgreementMessage {
    pub fn slot(&self) -> Slot {
        match self {
            AgreementMessage::Propose(p) | AgreementMessage::Nack(p) => p.slot,
            AgreementMessage::Ack { slot, .. } => *slot,
        }
    }

    pub fn round(&self) -> u32 {
        match self {
            AgreementMessage::Propose(p) | AgreementMessage::Nack(p) => p.round,
            AgreementMessage::Ack { round, .. } => *round,
        }
    }

    /// `[tag][round][slot]`, then `[count][value]*` for proposals and nacks.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        let (tag, values) = match self {
            AgreementMessage::Propose(p) => (TAG_PROPOSAL, Some(&p.values)),
            AgreementMessage::Ack { .. } => (TAG_ACK, None),
            AgreementMessage::Nack(p) => (TAG_NACK, Some(&p.values)),
        };
        buf.put_u32(tag);
        buf.put_u32(self.round());
        buf.put_u32(self.slot());
        if let Some(values) = values {
            buf.put_u32(values.len() as u32);
            for v in values {
                buf.put_u32(*v);
            }
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, DecodeError> {
        need(&buf, 12)?;
        let tag = buf.get_u32();
        let round = buf.get_u32();
        let slot = buf.get_u32();
        let msg = match tag {
            TAG_ACK => AgreementMessage::Ack { round, slot },
            TAG_PROPOSAL | TAG_NACK => {
                need(&buf, 4)?;
                let count = buf.get_u32() as usize;
                need(&buf, count.saturating_mul(4))?;
                let values = (0..count).map(|_| buf.get_u32()).collect();
                let p = Proposal {
                    round,
                    slot,
                    values,
                };
                if tag == TAG_PROPOSAL {
                    AgreementMessage::Propose(p)
                } else {
                    AgreementMessage::Nack(p)
                }
            }
            other => return Err(DecodeError::UnknownTag(other)),
        };
        if buf.has_remaining() {
            return Err(DecodeError::Trailing(buf.remaining()));
        }
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_layout() {
        let nack = AgreementMessage::Nack(Proposal {
            round: 2,
            slot: 7,
            values: [5, 1].iter().copied().collect(),
        });
        let wire = nack.encode();
        assert_eq!(
            &wire[..],
            &[0, 0, 0, 3, 0, 0, 0, 2, 0, 0, 0, 7, 0, 0, 0, 2, 0, 0, 0, 1, 0, 0, 0, 5][..]
        );
        assert_eq!(AgreementMessage::decode(wire), Ok(nack));
    }

    #[test]
    fn rejects_garbage() {
        let ack = AgreementMessage::Ack { round: 0, slot: 1 }.encode();
        let mut long = BytesMut::from(&ack[..]);
        long.put_u8(0);
        assert_eq!(
            AgreementMessage::decode(long.freeze()),
            Err(DecodeError::Trailing(1))
        );
        let mut unknown = BytesMut::new();
        unknown.put_u32(9);
        unknown.put_slice(&[0u8; 8]);
        assert_eq!(
            AgreementMessage::decode(unknown.freeze()),
            Err(DecodeError::UnknownTag(9))
        );
        let mut short = BytesMut::new();
        short.put_u32(TAG_PROPOSAL);
        short.put_slice(&[0u8; 8]);
        short.put_u32(3);
        short.put_u32(1);
        assert!(matches!(
            AgreementMessage::decode(short.freeze()),
            Err(DecodeError::Truncated { .. })
        ));
    }
}
