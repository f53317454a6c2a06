//! Lower transport PDU formats.
//!
//! The first octet of every lower transport PDU carries the SEG flag. Access
//! PDUs follow it with AKF and the 6-bit AID, control PDUs with a 7-bit opcode.
//! Segmented PDUs add a 24-bit segment header:
//!
//! ```text
//! access : SZMIC(1) | SeqZero(13) | SegO(5) | SegN(5)
//! control: RFU(1)   | SeqZero(13) | SegO(5) | SegN(5)
//! ```

use crate::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Largest unsegmented access upper transport PDU (payload + TransMIC)
pub const MAX_UNSEGMENTED_ACCESS_SIZE: usize = 15;

/// Largest unsegmented control parameter block
pub const MAX_UNSEGMENTED_CONTROL_SIZE: usize = 11;

/// Payload octets carried by one access segment
pub const ACCESS_SEGMENT_SIZE: usize = 12;

/// Payload octets carried by one control segment
pub const CONTROL_SEGMENT_SIZE: usize = 8;

/// Maximum number of segments per message
pub const MAX_SEGMENTS: usize = 32;

/// SeqZero is the low 13 bits of SeqAuth
pub const SEQ_ZERO_MASK: u32 = 0x1fff;

/// Segment header length
pub const SEGMENT_HEADER_SIZE: usize = 3;

/// Known control opcodes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlOpcode {
    /// Segment acknowledgment
    SegmentAck = 0x00,
    /// Friend poll
    FriendPoll = 0x01,
    /// Friend update
    FriendUpdate = 0x02,
    /// Friend request
    FriendRequest = 0x03,
    /// Friend offer
    FriendOffer = 0x04,
    /// Friend clear
    FriendClear = 0x05,
    /// Friend clear confirm
    FriendClearConfirm = 0x06,
    /// Friend subscription list add
    FriendSubscriptionListAdd = 0x07,
    /// Friend subscription list remove
    FriendSubscriptionListRemove = 0x08,
    /// Friend subscription list confirm
    FriendSubscriptionListConfirm = 0x09,
    /// Heartbeat
    Heartbeat = 0x0A,
}

impl TryFrom<u8> for ControlOpcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(ControlOpcode::SegmentAck),
            0x01 => Ok(ControlOpcode::FriendPoll),
            0x02 => Ok(ControlOpcode::FriendUpdate),
            0x03 => Ok(ControlOpcode::FriendRequest),
            0x04 => Ok(ControlOpcode::FriendOffer),
            0x05 => Ok(ControlOpcode::FriendClear),
            0x06 => Ok(ControlOpcode::FriendClearConfirm),
            0x07 => Ok(ControlOpcode::FriendSubscriptionListAdd),
            0x08 => Ok(ControlOpcode::FriendSubscriptionListRemove),
            0x09 => Ok(ControlOpcode::FriendSubscriptionListConfirm),
            0x0A => Ok(ControlOpcode::Heartbeat),
            _ => Err(WireError::Opcode(value)),
        }
    }
}

/// Segment header of a segmented PDU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHeader {
    /// Long TransMIC flag (access) or RFU (control)
    pub szmic: bool,
    /// Low 13 bits of SeqAuth
    pub seq_zero: u16,
    /// Segment offset
    pub seg_o: u8,
    /// Last segment index
    pub seg_n: u8,
}

impl SegmentHeader {
    /// Create a segment header, masking SeqZero to 13 bits
    pub fn new(szmic: bool, seq_auth: u32, seg_o: u8, seg_n: u8) -> Self {
        Self {
            szmic,
            seq_zero: (seq_auth & SEQ_ZERO_MASK) as u16,
            seg_o,
            seg_n,
        }
    }

    /// Pack into the 24-bit wire value
    pub fn pack(self) -> u32 {
        ((self.szmic as u32) << 23)
            | (((self.seq_zero as u32) & SEQ_ZERO_MASK) << 10)
            | (((self.seg_o as u32) & 0x1f) << 5)
            | ((self.seg_n as u32) & 0x1f)
    }

    /// Unpack from the 24-bit wire value
    pub fn unpack(value: u32) -> Self {
        Self {
            szmic: (value >> 23) & 0x01 != 0,
            seq_zero: ((value >> 10) & SEQ_ZERO_MASK) as u16,
            seg_o: ((value >> 5) & 0x1f) as u8,
            seg_n: (value & 0x1f) as u8,
        }
    }

    /// Segment offset must not pass the last segment index
    pub fn validate(&self) -> Result<(), WireError> {
        if self.seg_o > self.seg_n || self.seg_n as usize >= MAX_SEGMENTS {
            return Err(WireError::Segment {
                seg_o: self.seg_o,
                seg_n: self.seg_n,
            });
        }
        Ok(())
    }

    /// Number of segments in the message
    pub fn count(&self) -> usize {
        self.seg_n as usize + 1
    }
}

/// Reconstruct SeqAuth from the SEQ of one segment and its SeqZero.
///
/// Returns `None` if the segment claims a SeqAuth before the start of the
/// sequence space.
pub fn seq_auth(seq: u32, seq_zero: u16) -> Option<u32> {
    let delta = seq.wrapping_sub(seq_zero as u32) & SEQ_ZERO_MASK;
    seq.checked_sub(delta)
}

/// Access or control specific part of the first octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PduKind {
    /// Access message
    Access {
        /// Application key flag
        akf: bool,
        /// Application key identifier (6 bits)
        aid: u8,
    },
    /// Control message
    Control {
        /// Control opcode (7 bits)
        opcode: u8,
    },
}

impl PduKind {
    /// True for control messages
    pub fn is_control(&self) -> bool {
        matches!(self, PduKind::Control { .. })
    }

    /// Segment payload size for this kind
    pub fn segment_size(&self) -> usize {
        match self {
            PduKind::Access { .. } => ACCESS_SEGMENT_SIZE,
            PduKind::Control { .. } => CONTROL_SEGMENT_SIZE,
        }
    }

    /// Largest payload of an unsegmented PDU of this kind
    pub fn max_unsegmented_size(&self) -> usize {
        match self {
            PduKind::Access { .. } => MAX_UNSEGMENTED_ACCESS_SIZE,
            PduKind::Control { .. } => MAX_UNSEGMENTED_CONTROL_SIZE,
        }
    }

    fn first_octet(&self, seg: bool) -> Result<u8, WireError> {
        let low = match *self {
            PduKind::Access { akf, aid } => {
                if aid > 0x3f {
                    return Err(WireError::Aid(aid));
                }
                ((akf as u8) << 6) | aid
            }
            PduKind::Control { opcode } => {
                if opcode > 0x7f {
                    return Err(WireError::Opcode(opcode));
                }
                opcode
            }
        };
        Ok(((seg as u8) << 7) | low)
    }
}

/// Lower transport PDU (one per network PDU)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LowerTransportPdu {
    /// Access or control header
    pub kind: PduKind,
    /// Segment header, present for segmented PDUs
    pub segment: Option<SegmentHeader>,
    /// Upper transport PDU or one segment of it
    pub payload: Bytes,
}

impl LowerTransportPdu {
    /// Unsegmented PDU
    pub fn unsegmented(kind: PduKind, payload: Bytes) -> Self {
        Self {
            kind,
            segment: None,
            payload,
        }
    }

    /// One segment of a segmented PDU
    pub fn segmented(kind: PduKind, segment: SegmentHeader, payload: Bytes) -> Self {
        Self {
            kind,
            segment: Some(segment),
            payload,
        }
    }

    /// Whether this PDU is one segment of a larger message
    pub fn is_segmented(&self) -> bool {
        self.segment.is_some()
    }

    fn max_payload(&self) -> usize {
        if self.segment.is_some() {
            self.kind.segment_size()
        } else {
            self.kind.max_unsegmented_size()
        }
    }

    /// Encoded length in octets
    pub fn encoded_size(&self) -> usize {
        let header = if self.segment.is_some() {
            1 + SEGMENT_HEADER_SIZE
        } else {
            1
        };
        header + self.payload.len()
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Result<Bytes, WireError> {
        if self.payload.len() > self.max_payload() {
            return Err(WireError::Size(self.encoded_size()));
        }

        let mut buf = BytesMut::with_capacity(self.encoded_size());
        buf.put_u8(self.kind.first_octet(self.segment.is_some())?);

        if let Some(segment) = self.segment {
            segment.validate()?;
            let mut header = segment;
            if self.kind.is_control() {
                header.szmic = false;
            }
            let packed = header.pack();
            buf.put_u8((packed >> 16) as u8);
            buf.put_u16(packed as u16);
        }

        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Decode from the decrypted transport part of a network PDU
    pub fn decode(ctl: bool, data: Bytes) -> Result<Self, WireError> {
        if data.is_empty() {
            return Err(WireError::Incomplete(0));
        }

        let first = data[0];
        let seg = first & 0x80 != 0;
        let kind = if ctl {
            PduKind::Control {
                opcode: first & 0x7f,
            }
        } else {
            PduKind::Access {
                akf: first & 0x40 != 0,
                aid: first & 0x3f,
            }
        };

        let pdu = if seg {
            if data.len() < 1 + SEGMENT_HEADER_SIZE + 1 {
                return Err(WireError::Incomplete(data.len()));
            }
            let packed = ((data[1] as u32) << 16) | ((data[2] as u32) << 8) | data[3] as u32;
            let segment = SegmentHeader::unpack(packed);
            if ctl && segment.szmic {
                return Err(WireError::Reserved);
            }
            segment.validate()?;
            Self::segmented(kind, segment, data.slice(1 + SEGMENT_HEADER_SIZE..))
        } else {
            Self::unsegmented(kind, data.slice(1..))
        };

        if pdu.payload.len() > pdu.max_payload() {
            return Err(WireError::Size(data.len()));
        }
        Ok(pdu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_control_opcode_conversion() {
        assert_eq!(ControlOpcode::try_from(0x00).unwrap(), ControlOpcode::SegmentAck);
        assert_eq!(ControlOpcode::try_from(0x0A).unwrap(), ControlOpcode::Heartbeat);
        assert!(ControlOpcode::try_from(0x4b).is_err());
    }

    #[test]
    fn test_segment_header_pack_unpack() {
        let header = SegmentHeader::new(false, 0x3129ab, 1, 1);
        assert_eq!(header.seq_zero, 0x09ab);
        assert_eq!(header.pack(), 0x26ac21);
        assert_eq!(SegmentHeader::unpack(0x26ac21), header);

        let long = SegmentHeader::new(true, 0x1fff, 31, 31);
        assert_eq!(SegmentHeader::unpack(long.pack()), long);
    }

    #[test]
    fn test_seq_auth_reconstruction() {
        assert_eq!(seq_auth(0x3129ab, 0x09ab), Some(0x3129ab));
        assert_eq!(seq_auth(0x3129ac, 0x09ab), Some(0x3129ab));
        // SeqZero wraps within the 13-bit window
        assert_eq!(seq_auth(0x002001, 0x1fff), Some(0x001fff));
        assert_eq!(seq_auth(0x000001, 0x1fff), None);
    }

    #[test]
    fn test_decode_segmented_access() {
        let pdu = LowerTransportPdu::decode(
            false,
            Bytes::copy_from_slice(&hex!("8026ac01ee9dddfd2169326d23f3afdf")),
        )
        .unwrap();

        assert_eq!(pdu.kind, PduKind::Access { akf: false, aid: 0 });
        let segment = pdu.segment.unwrap();
        assert!(!segment.szmic);
        assert_eq!(segment.seq_zero, 0x09ab);
        assert_eq!(segment.seg_o, 0);
        assert_eq!(segment.seg_n, 1);
        assert_eq!(&pdu.payload[..], &hex!("ee9dddfd2169326d23f3afdf"));
        assert_eq!(&pdu.encode().unwrap()[..], &hex!("8026ac01ee9dddfd2169326d23f3afdf"));
    }

    #[test]
    fn test_decode_unsegmented_control() {
        let pdu = LowerTransportPdu::decode(
            true,
            Bytes::copy_from_slice(&hex!("034b50057e400000010000")),
        )
        .unwrap();

        assert_eq!(pdu.kind, PduKind::Control { opcode: 0x03 });
        assert!(!pdu.is_segmented());
        assert_eq!(&pdu.payload[..], &hex!("4b50057e400000010000"));
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let pdu = LowerTransportPdu::unsegmented(
            PduKind::Control { opcode: 0x0A },
            Bytes::from(vec![0u8; MAX_UNSEGMENTED_CONTROL_SIZE + 1]),
        );
        assert!(matches!(pdu.encode(), Err(WireError::Size(_))));

        let pdu = LowerTransportPdu::unsegmented(
            PduKind::Access { akf: true, aid: 0x40 },
            Bytes::from_static(b"x"),
        );
        assert_eq!(pdu.encode(), Err(WireError::Aid(0x40)));
    }

    #[test]
    fn test_decode_rejects_bad_segment_fields() {
        // SegO (2) greater than SegN (1)
        let result = LowerTransportPdu::decode(
            false,
            Bytes::copy_from_slice(&hex!("8026ac41ee9dddfd")),
        );
        assert_eq!(result, Err(WireError::Segment { seg_o: 2, seg_n: 1 }));

        // RFU bit set on a segmented control PDU
        let result = LowerTransportPdu::decode(true, Bytes::copy_from_slice(&hex!("8aa6ac01aabb")));
        assert_eq!(result, Err(WireError::Reserved));
    }
}
