//! Segmentation and reassembly of upper transport PDUs.
//!
//! [`Segmenter`] splits an upper transport PDU into lower transport PDUs that
//! each fit one network PDU. [`Reassembler`] collects received segments keyed
//! by `(src, seq_zero)` into a fixed arena of slots and hands back the full
//! PDU once every segment has arrived.

use crate::error::{ReassemblyError, WireError};
use crate::header::{Address, NetworkHeader};
use crate::lower::{seq_auth, LowerTransportPdu, PduKind, SegmentHeader, MAX_SEGMENTS};
use bytes::{Bytes, BytesMut};
use lru::LruCache;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default time a partial message is kept without new segments
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of messages reassembled concurrently
pub const DEFAULT_MAX_REASSEMBLIES: usize = 8;

/// Default number of completed messages remembered for duplicate detection
pub const DEFAULT_COMPLETED_CAPACITY: usize = 64;

/// Splits upper transport PDUs into lower transport PDUs
#[derive(Debug, Clone, Copy, Default)]
pub struct Segmenter;

impl Segmenter {
    /// Create a new segmenter
    pub fn new() -> Self {
        Self
    }

    /// Number of lower transport PDUs (and SEQ values) a message needs
    pub fn count(&self, kind: &PduKind, szmic: bool, len: usize) -> usize {
        let long_mic = szmic && !kind.is_control();
        if !long_mic && len <= kind.max_unsegmented_size() {
            1
        } else {
            len.div_ceil(kind.segment_size()).max(1)
        }
    }

    /// Split `upper_pdu` for a message whose first SEQ is `seq_auth`.
    ///
    /// Segment `i` must be sent with SEQ `seq_auth + i`.
    pub fn segment(
        &self,
        kind: PduKind,
        szmic: bool,
        seq_auth: u32,
        upper_pdu: Bytes,
    ) -> Result<Vec<LowerTransportPdu>, WireError> {
        if upper_pdu.is_empty() && !kind.is_control() {
            return Err(WireError::Incomplete(0));
        }

        let szmic = szmic && !kind.is_control();
        let total = self.count(&kind, szmic, upper_pdu.len());
        if total > MAX_SEGMENTS {
            return Err(WireError::Size(upper_pdu.len()));
        }

        if total == 1 && !szmic {
            return Ok(vec![LowerTransportPdu::unsegmented(kind, upper_pdu)]);
        }

        let segment_size = kind.segment_size();
        let seg_n = (total - 1) as u8;
        let mut pdus = Vec::with_capacity(total);
        let mut offset = 0;

        for seg_o in 0..total {
            let end = std::cmp::min(offset + segment_size, upper_pdu.len());
            let header = SegmentHeader::new(szmic, seq_auth, seg_o as u8, seg_n);
            pdus.push(LowerTransportPdu::segmented(
                kind,
                header,
                upper_pdu.slice(offset..end),
            ));
            offset = end;
        }

        Ok(pdus)
    }
}

/// Bounds applied to the reassembly table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyConfig {
    /// Partial messages idle longer than this are dropped
    pub timeout: Duration,
    /// Maximum concurrent partial messages; the oldest is evicted beyond this
    pub max_contexts: usize,
    /// Completed messages remembered to drop late duplicates
    pub completed_capacity: usize,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_REASSEMBLY_TIMEOUT,
            max_contexts: DEFAULT_MAX_REASSEMBLIES,
            completed_capacity: DEFAULT_COMPLETED_CAPACITY,
        }
    }
}

/// A fully reassembled upper transport PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassembledPdu {
    /// Source address
    pub src: Address,
    /// Destination address
    pub dst: Address,
    /// TTL of the first segment received
    pub ttl: u8,
    /// SEQ of the first segment of the message
    pub seq_auth: u32,
    /// IV index the segments were received under
    pub iv_index: u32,
    /// Access or control header
    pub kind: PduKind,
    /// Long TransMIC flag
    pub szmic: bool,
    /// Concatenated segment payloads
    pub payload: Bytes,
}

/// Result of feeding one segment to the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// More segments are needed
    Pending,
    /// Segment was already received or the message already completed
    Duplicate,
    /// Last missing segment arrived
    Complete(ReassembledPdu),
}

#[derive(Debug)]
struct Slot {
    src: Address,
    dst: Address,
    ttl: u8,
    seq_zero: u16,
    seq_auth: u32,
    iv_index: u32,
    kind: PduKind,
    szmic: bool,
    seg_n: u8,
    received: u32,
    segments: SmallVec<[Bytes; 4]>,
    started: Instant,
    last_activity: Instant,
}

impl Slot {
    fn empty(now: Instant) -> Self {
        Self {
            src: 0,
            dst: 0,
            ttl: 0,
            seq_zero: 0,
            seq_auth: 0,
            iv_index: 0,
            kind: PduKind::Control { opcode: 0 },
            szmic: false,
            seg_n: 0,
            received: 0,
            segments: SmallVec::new(),
            started: now,
            last_activity: now,
        }
    }

    fn reset(
        &mut self,
        header: &NetworkHeader,
        iv_index: u32,
        seq_auth: u32,
        kind: PduKind,
        segment: &SegmentHeader,
        now: Instant,
    ) {
        self.src = header.src;
        self.dst = header.dst;
        self.ttl = header.ttl;
        self.seq_zero = segment.seq_zero;
        self.seq_auth = seq_auth;
        self.iv_index = iv_index;
        self.kind = kind;
        self.szmic = segment.szmic;
        self.seg_n = segment.seg_n;
        self.received = 0;
        self.segments.clear();
        self.segments.resize(segment.count(), Bytes::new());
        self.started = now;
        self.last_activity = now;
    }

    fn complete_mask(&self) -> u32 {
        u32::MAX >> (31 - self.seg_n as u32)
    }

    fn assemble(&self) -> ReassembledPdu {
        let len = self.segments.iter().map(|s| s.len()).sum();
        let mut payload = BytesMut::with_capacity(len);
        for segment in &self.segments {
            payload.extend_from_slice(segment);
        }

        ReassembledPdu {
            src: self.src,
            dst: self.dst,
            ttl: self.ttl,
            seq_auth: self.seq_auth,
            iv_index: self.iv_index,
            kind: self.kind,
            szmic: self.szmic,
            payload: payload.freeze(),
        }
    }
}

/// Keyed reassembly table over a reusable slot arena
pub struct Reassembler {
    config: ReassemblyConfig,
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<(Address, u16), usize>,
    completed: LruCache<(Address, u32), ()>,
}

impl Reassembler {
    /// Create a reassembler with the given bounds
    pub fn new(config: ReassemblyConfig) -> Self {
        let capacity = NonZeroUsize::new(config.completed_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            slots: Vec::with_capacity(config.max_contexts),
            free: Vec::new(),
            index: HashMap::with_capacity(config.max_contexts),
            completed: LruCache::new(capacity),
        }
    }

    /// Number of messages currently being reassembled
    pub fn active(&self) -> usize {
        self.index.len()
    }

    /// True while the message from `src` with this SeqZero and SeqAuth is
    /// partially received
    pub fn is_pending(&self, src: Address, seq_zero: u16, seq_auth: u32) -> bool {
        self.index
            .get(&(src, seq_zero))
            .is_some_and(|&id| self.slots[id].seq_auth == seq_auth)
    }

    /// Feed one received segment.
    ///
    /// `header` is the decrypted network header of the packet carrying `pdu`.
    pub fn insert(
        &mut self,
        header: &NetworkHeader,
        iv_index: u32,
        pdu: &LowerTransportPdu,
        now: Instant,
    ) -> Result<ReassemblyOutcome, ReassemblyError> {
        let segment = pdu.segment.ok_or(ReassemblyError::Unsegmented)?;
        let src = header.src;
        let seq_zero = segment.seq_zero;
        let seq_auth = seq_auth(header.seq, seq_zero).ok_or(ReassemblyError::SeqAuth {
            seq: header.seq,
            seq_zero,
        })?;

        if self.completed.contains(&(src, seq_auth)) {
            debug!(src, seq_zero, "segment of completed message ignored");
            return Ok(ReassemblyOutcome::Duplicate);
        }

        let slot_id = match self.index.get(&(src, seq_zero)).copied() {
            Some(id) => {
                let (current_auth, seg_n, kind, szmic) = {
                    let slot = &self.slots[id];
                    (slot.seq_auth, slot.seg_n, slot.kind, slot.szmic)
                };

                if current_auth > seq_auth {
                    return Err(ReassemblyError::Stale { src, seq_zero });
                }
                if current_auth < seq_auth {
                    debug!(src, seq_zero, seq_auth, "newer message supersedes partial reassembly");
                    self.slots[id].reset(header, iv_index, seq_auth, pdu.kind, &segment, now);
                } else if seg_n != segment.seg_n {
                    self.release(id);
                    return Err(ReassemblyError::InconsistentSegmentCount { src, seq_zero });
                } else if kind != pdu.kind || szmic != segment.szmic {
                    self.release(id);
                    return Err(ReassemblyError::InconsistentHeader { src, seq_zero });
                }
                id
            }
            None => self.allocate(header, iv_index, seq_auth, pdu.kind, &segment, now),
        };

        let seg_o = segment.seg_o as usize;
        let bit = 1u32 << seg_o;
        if self.slots[slot_id].received & bit != 0 {
            return Ok(ReassemblyOutcome::Duplicate);
        }

        let is_last = segment.seg_o == segment.seg_n;
        if !is_last && pdu.payload.len() != pdu.kind.segment_size() {
            self.release(slot_id);
            return Err(ReassemblyError::InconsistentHeader { src, seq_zero });
        }

        let slot = &mut self.slots[slot_id];
        slot.segments[seg_o] = pdu.payload.clone();
        slot.received |= bit;
        slot.last_activity = now;

        if slot.received != slot.complete_mask() {
            debug!(src, seq_zero, seg_o, seg_n = segment.seg_n, "segment stored");
            return Ok(ReassemblyOutcome::Pending);
        }

        let reassembled = slot.assemble();
        self.release(slot_id);
        self.completed.put((src, seq_auth), ());

        debug!(src, seq_auth, len = reassembled.payload.len(), "message reassembled");
        Ok(ReassemblyOutcome::Complete(reassembled))
    }

    /// Drop partial messages idle for longer than the timeout
    pub fn expire(&mut self, now: Instant) -> Vec<ReassemblyError> {
        let timeout = self.config.timeout;
        let expired: Vec<usize> = self
            .index
            .values()
            .copied()
            .filter(|&id| now.saturating_duration_since(self.slots[id].last_activity) >= timeout)
            .collect();

        expired
            .into_iter()
            .map(|id| {
                let (src, seq_zero) = (self.slots[id].src, self.slots[id].seq_zero);
                self.release(id);
                warn!(src, seq_zero, "reassembly timed out");
                ReassemblyError::Timeout { src, seq_zero }
            })
            .collect()
    }

    fn allocate(
        &mut self,
        header: &NetworkHeader,
        iv_index: u32,
        seq_auth: u32,
        kind: PduKind,
        segment: &SegmentHeader,
        now: Instant,
    ) -> usize {
        if self.index.len() >= self.config.max_contexts.max(1) {
            let oldest = self
                .index
                .values()
                .copied()
                .min_by_key(|&id| self.slots[id].started);
            if let Some(id) = oldest {
                warn!(
                    src = self.slots[id].src,
                    seq_zero = self.slots[id].seq_zero,
                    "reassembly table full, evicting oldest"
                );
                self.release(id);
            }
        }

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(Slot::empty(now));
                self.slots.len() - 1
            }
        };

        self.slots[id].reset(header, iv_index, seq_auth, kind, segment, now);
        self.index.insert((header.src, segment.seq_zero), id);
        id
    }

    fn release(&mut self, id: usize) {
        let slot = &mut self.slots[id];
        self.index.remove(&(slot.src, slot.seq_zero));
        slot.segments.clear();
        slot.received = 0;
        self.free.push(id);
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(ReassemblyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const ACCESS: PduKind = PduKind::Access { akf: false, aid: 0 };

    fn header(seq: u32) -> NetworkHeader {
        NetworkHeader::new(false, 4, seq, 0x0003, 0x1201)
    }

    fn reference_segments() -> Vec<LowerTransportPdu> {
        Segmenter::new()
            .segment(
                ACCESS,
                false,
                0x3129ab,
                Bytes::copy_from_slice(&hex!("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308")),
            )
            .unwrap()
    }

    #[test]
    fn test_segment_reference_message() {
        let pdus = reference_segments();
        assert_eq!(pdus.len(), 2);
        assert_eq!(&pdus[0].encode().unwrap()[..], &hex!("8026ac01ee9dddfd2169326d23f3afdf"));
        assert_eq!(&pdus[1].encode().unwrap()[..], &hex!("8026ac21cfdc18c52fdef772e0e17308"));
    }

    #[test]
    fn test_size_threshold() {
        let segmenter = Segmenter::new();

        let fits = segmenter
            .segment(ACCESS, false, 1, Bytes::from(vec![0u8; 15]))
            .unwrap();
        assert_eq!(fits.len(), 1);
        assert!(!fits[0].is_segmented());

        let over = segmenter
            .segment(ACCESS, false, 1, Bytes::from(vec![0u8; 16]))
            .unwrap();
        assert_eq!(over.len(), 2);
        assert_eq!(over[1].payload.len(), 4);

        let control = PduKind::Control { opcode: 0x0A };
        assert_eq!(segmenter.count(&control, false, 0), 1);
        assert_eq!(segmenter.count(&control, false, 11), 1);
        assert_eq!(segmenter.count(&control, false, 12), 2);
        assert_eq!(segmenter.count(&control, true, 11), 1);
    }

    #[test]
    fn test_long_mic_always_segments() {
        let pdus = Segmenter::new()
            .segment(ACCESS, true, 7, Bytes::from(vec![0u8; 9]))
            .unwrap();
        assert_eq!(pdus.len(), 1);
        let segment = pdus[0].segment.unwrap();
        assert!(segment.szmic);
        assert_eq!(segment.seg_n, 0);
    }

    #[test]
    fn test_segment_rejects_too_many_segments() {
        let result = Segmenter::new().segment(ACCESS, false, 1, Bytes::from(vec![0u8; 32 * 12 + 1]));
        assert_eq!(result, Err(WireError::Size(385)));
    }

    #[test]
    fn test_reassemble_in_order_and_reversed() {
        let pdus = reference_segments();
        let now = Instant::now();

        for order in [[0usize, 1], [1, 0]] {
            let mut reassembler = Reassembler::default();
            let mut result = None;
            for &i in &order {
                let outcome = reassembler
                    .insert(&header(0x3129ab + i as u32), 0x12345678, &pdus[i], now)
                    .unwrap();
                if let ReassemblyOutcome::Complete(pdu) = outcome {
                    result = Some(pdu);
                }
            }

            let pdu = result.unwrap();
            assert_eq!(pdu.seq_auth, 0x3129ab);
            assert_eq!(pdu.src, 0x0003);
            assert_eq!(pdu.dst, 0x1201);
            assert_eq!(
                &pdu.payload[..],
                &hex!("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308")
            );
            assert_eq!(reassembler.active(), 0);
        }
    }

    #[test]
    fn test_any_permutation_yields_same_pdu() {
        let payload: Vec<u8> = (0u8..40).collect();
        let pdus = Segmenter::new()
            .segment(ACCESS, false, 100, Bytes::from(payload.clone()))
            .unwrap();
        assert_eq!(pdus.len(), 4);

        let orders = [[0, 1, 2, 3], [3, 2, 1, 0], [2, 0, 3, 1], [1, 3, 0, 2]];
        for order in orders {
            let mut reassembler = Reassembler::default();
            let mut completed = Vec::new();
            for i in order {
                let outcome = reassembler
                    .insert(&header(100 + i as u32), 0, &pdus[i], Instant::now())
                    .unwrap();
                if let ReassemblyOutcome::Complete(pdu) = outcome {
                    completed.push(pdu);
                }
            }
            assert_eq!(completed.len(), 1);
            assert_eq!(&completed[0].payload[..], &payload[..]);
        }
    }

    #[test]
    fn test_duplicate_after_completion_is_ignored() {
        let pdus = reference_segments();
        let now = Instant::now();
        let mut reassembler = Reassembler::default();

        reassembler.insert(&header(0x3129ab), 0, &pdus[0], now).unwrap();
        assert_eq!(
            reassembler.insert(&header(0x3129ab), 0, &pdus[0], now).unwrap(),
            ReassemblyOutcome::Duplicate
        );
        assert!(matches!(
            reassembler.insert(&header(0x3129ac), 0, &pdus[1], now).unwrap(),
            ReassemblyOutcome::Complete(_)
        ));
        assert_eq!(
            reassembler.insert(&header(0x3129ac), 0, &pdus[1], now).unwrap(),
            ReassemblyOutcome::Duplicate
        );
        assert_eq!(reassembler.active(), 0);
    }

    #[test]
    fn test_inconsistent_segment_count_discards_context() {
        let now = Instant::now();
        let mut reassembler = Reassembler::default();
        let first = LowerTransportPdu::segmented(
            ACCESS,
            SegmentHeader::new(false, 50, 0, 2),
            Bytes::from(vec![1u8; 12]),
        );
        let liar = LowerTransportPdu::segmented(
            ACCESS,
            SegmentHeader::new(false, 50, 1, 1),
            Bytes::from(vec![2u8; 4]),
        );

        reassembler.insert(&header(50), 0, &first, now).unwrap();
        assert_eq!(
            reassembler.insert(&header(51), 0, &liar, now),
            Err(ReassemblyError::InconsistentSegmentCount {
                src: 0x0003,
                seq_zero: 50
            })
        );
        assert_eq!(reassembler.active(), 0);
    }

    #[test]
    fn test_short_middle_segment_rejected() {
        let mut reassembler = Reassembler::default();
        let short = LowerTransportPdu::segmented(
            ACCESS,
            SegmentHeader::new(false, 9, 0, 1),
            Bytes::from(vec![1u8; 5]),
        );
        assert_eq!(
            reassembler.insert(&header(9), 0, &short, Instant::now()),
            Err(ReassemblyError::InconsistentHeader {
                src: 0x0003,
                seq_zero: 9
            })
        );
    }

    #[test]
    fn test_timeout_discards_partial_state() {
        let pdus = reference_segments();
        let start = Instant::now();
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        });

        reassembler.insert(&header(0x3129ab), 0, &pdus[0], start).unwrap();
        assert!(reassembler.expire(start + Duration::from_secs(1)).is_empty());

        let expired = reassembler.expire(start + Duration::from_secs(3));
        assert_eq!(
            expired,
            vec![ReassemblyError::Timeout {
                src: 0x0003,
                seq_zero: 0x09ab
            }]
        );
        assert_eq!(reassembler.active(), 0);
    }

    #[test]
    fn test_oldest_context_evicted_when_full() {
        let start = Instant::now();
        let mut reassembler = Reassembler::new(ReassemblyConfig {
            max_contexts: 2,
            ..Default::default()
        });

        for (i, seq) in [10u32, 20, 30].into_iter().enumerate() {
            let pdu = LowerTransportPdu::segmented(
                ACCESS,
                SegmentHeader::new(false, seq, 0, 1),
                Bytes::from(vec![0u8; 12]),
            );
            reassembler
                .insert(&header(seq), 0, &pdu, start + Duration::from_millis(i as u64))
                .unwrap();
        }

        assert_eq!(reassembler.active(), 2);
        assert!(!reassembler.index.contains_key(&(0x0003, 10)));
        assert!(reassembler.index.contains_key(&(0x0003, 30)));
    }

    #[test]
    fn test_newer_seq_auth_supersedes() {
        let now = Instant::now();
        let mut reassembler = Reassembler::default();
        let old = LowerTransportPdu::segmented(
            ACCESS,
            SegmentHeader::new(false, 5, 0, 1),
            Bytes::from(vec![0u8; 12]),
        );
        reassembler.insert(&header(5), 0, &old, now).unwrap();

        // same SeqZero one 13-bit window later
        let newer_seq = 5 + 0x2000;
        let fresh = LowerTransportPdu::segmented(
            ACCESS,
            SegmentHeader::new(false, newer_seq, 1, 1),
            Bytes::from(vec![7u8; 3]),
        );
        assert_eq!(
            reassembler.insert(&header(newer_seq + 1), 0, &fresh, now).unwrap(),
            ReassemblyOutcome::Pending
        );
        assert_eq!(
            reassembler.insert(&header(6), 0, &old, now),
            Err(ReassemblyError::Stale {
                src: 0x0003,
                seq_zero: 5
            })
        );
    }
}
