//! Lower transport layer: segmentation on send, reassembly on receive.

use crate::error::DecodeError;
use crate::network::ReceivedPdu;
use bytes::Bytes;
use mesh_wire::{
    seq_auth, LowerTransportPdu, PduKind, ReassembledPdu, Reassembler, ReassemblyConfig,
    ReassemblyError, ReassemblyOutcome, Segmenter, WireError,
};
use std::time::Instant;
use tracing::{debug, warn};

/// What the lower transport layer made of one network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportOutcome {
    /// Unsegmented PDU, passed straight through
    Unsegmented(LowerTransportPdu),
    /// Last segment of a message arrived
    Reassembled(ReassembledPdu),
    /// Segment stored, message incomplete
    Pending,
    /// Segment already seen
    Duplicate,
}

/// Errors from the receive side of the lower transport layer
#[derive(Debug)]
pub enum LowerReceiveError {
    /// Transport PDU could not be parsed
    Decode(DecodeError),
    /// Segment could not be merged
    Reassembly(ReassemblyError),
}

/// Segmentation and keyed reassembly state
pub struct LowerTransportLayer {
    segmenter: Segmenter,
    reassembler: Reassembler,
}

impl LowerTransportLayer {
    /// Create the layer with the given reassembly bounds
    pub fn new(config: ReassemblyConfig) -> Self {
        Self {
            segmenter: Segmenter::new(),
            reassembler: Reassembler::new(config),
        }
    }

    /// Number of network PDUs needed for an upper transport PDU of `len` octets
    pub fn segment_count(&self, kind: &PduKind, szmic: bool, len: usize) -> usize {
        self.segmenter.count(kind, szmic, len)
    }

    /// Split an upper transport PDU whose first segment uses SEQ `seq_auth`
    pub fn send(
        &self,
        kind: PduKind,
        szmic: bool,
        seq_auth: u32,
        upper_pdu: Bytes,
    ) -> Result<Vec<LowerTransportPdu>, WireError> {
        self.segmenter.segment(kind, szmic, seq_auth, upper_pdu)
    }

    /// Classify a received network PDU and merge segments
    pub fn receive(
        &mut self,
        received: &ReceivedPdu,
        now: Instant,
    ) -> Result<LowerTransportOutcome, LowerReceiveError> {
        let header = &received.pdu.header;
        let pdu = LowerTransportPdu::decode(header.ctl, received.pdu.transport_pdu.clone())
            .map_err(|e| LowerReceiveError::Decode(e.into()))?;

        if !pdu.is_segmented() {
            return Ok(LowerTransportOutcome::Unsegmented(pdu));
        }

        let outcome = self
            .reassembler
            .insert(header, received.pdu.iv_index, &pdu, now)
            .map_err(|e| {
                warn!(src = header.src, seq = header.seq, "segment dropped: {}", e);
                LowerReceiveError::Reassembly(e)
            })?;

        Ok(match outcome {
            ReassemblyOutcome::Pending => LowerTransportOutcome::Pending,
            ReassemblyOutcome::Duplicate => {
                debug!(src = header.src, seq = header.seq, "duplicate segment");
                LowerTransportOutcome::Duplicate
            }
            ReassemblyOutcome::Complete(pdu) => LowerTransportOutcome::Reassembled(pdu),
        })
    }

    /// True if `received` carries a segment of a message still being reassembled
    pub fn is_late_segment(&self, received: &ReceivedPdu) -> bool {
        let header = &received.pdu.header;
        let segment = LowerTransportPdu::decode(header.ctl, received.pdu.transport_pdu.clone())
            .ok()
            .and_then(|pdu| pdu.segment);
        let Some(segment) = segment else {
            return false;
        };
        seq_auth(header.seq, segment.seq_zero).is_some_and(|auth| {
            self.reassembler
                .is_pending(header.src, segment.seq_zero, auth)
        })
    }

    /// Abandon reassemblies idle past the timeout
    pub fn expire(&mut self, now: Instant) -> Vec<ReassemblyError> {
        self.reassembler.expire(now)
    }

    /// Number of messages being reassembled
    pub fn active_reassemblies(&self) -> usize {
        self.reassembler.active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use mesh_wire::{NetworkHeader, NetworkPdu};

    fn received(seq: u32, ctl: bool, transport: &[u8]) -> ReceivedPdu {
        ReceivedPdu {
            net_key_index: 0,
            pdu: NetworkPdu {
                header: NetworkHeader::new(ctl, 4, seq, 0x0003, 0x1201),
                iv_index: 0x12345678,
                transport_pdu: Bytes::copy_from_slice(transport),
            },
        }
    }

    #[test]
    fn test_send_reference_access_message() {
        let layer = LowerTransportLayer::new(ReassemblyConfig::default());
        let upper = Bytes::copy_from_slice(&hex!("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308"));
        let kind = PduKind::Access { akf: false, aid: 0 };

        assert_eq!(layer.segment_count(&kind, false, upper.len()), 2);
        let pdus = layer.send(kind, false, 0x3129ab, upper).unwrap();
        assert_eq!(&pdus[0].encode().unwrap()[..], &hex!("8026ac01ee9dddfd2169326d23f3afdf"));
        assert_eq!(&pdus[1].encode().unwrap()[..], &hex!("8026ac21cfdc18c52fdef772e0e17308"));
    }

    #[test]
    fn test_receive_segments_out_of_order() {
        let mut layer = LowerTransportLayer::new(ReassemblyConfig::default());
        let now = Instant::now();

        let second = received(0x3129ac, false, &hex!("8026ac21cfdc18c52fdef772e0e17308"));
        let first = received(0x3129ab, false, &hex!("8026ac01ee9dddfd2169326d23f3afdf"));

        assert_eq!(
            layer.receive(&second, now).unwrap(),
            LowerTransportOutcome::Pending
        );
        assert_eq!(layer.active_reassemblies(), 1);
        assert!(layer.is_late_segment(&first));
        assert!(!layer.is_late_segment(&received(
            0x3129ab,
            true,
            &hex!("034b50057e400000010000")
        )));

        match layer.receive(&first, now).unwrap() {
            LowerTransportOutcome::Reassembled(pdu) => {
                assert_eq!(pdu.seq_auth, 0x3129ab);
                assert_eq!(
                    &pdu.payload[..],
                    &hex!("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308")
                );
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        assert_eq!(
            layer.receive(&first, now).unwrap(),
            LowerTransportOutcome::Duplicate
        );
        assert!(!layer.is_late_segment(&first));
    }

    #[test]
    fn test_unsegmented_control_passes_through() {
        let mut layer = LowerTransportLayer::new(ReassemblyConfig::default());
        let pdu = received(1, true, &hex!("034b50057e400000010000"));

        match layer.receive(&pdu, Instant::now()).unwrap() {
            LowerTransportOutcome::Unsegmented(lower) => {
                assert_eq!(lower.kind, PduKind::Control { opcode: 0x03 });
                assert_eq!(&lower.payload[..], &hex!("4b50057e400000010000"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_malformed_transport_pdu() {
        let mut layer = LowerTransportLayer::new(ReassemblyConfig::default());
        let pdu = received(1, false, &hex!("8026"));
        assert!(matches!(
            layer.receive(&pdu, Instant::now()),
            Err(LowerReceiveError::Decode(DecodeError::Malformed(_)))
        ));
    }
}
