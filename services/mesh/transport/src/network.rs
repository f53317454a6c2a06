//! Network layer: key trial decoding, replay protection and the local
//! sequence counter.

use crate::error::{DecodeError, SequenceOverflow};
use bytes::Bytes;
use mesh_storage::{KeyStore, NetworkKey, ReplayCache};
use mesh_wire::{
    is_unicast, open_network_pdu, seal_network_pdu, CodecError, MeshCrypto, NetworkHeader,
    NetworkPdu, WireError, MAX_NETWORK_PDU_SIZE, MIN_NETWORK_PDU_SIZE, SEQ_MAX,
    UNASSIGNED_ADDRESS,
};
use tracing::{debug, info, warn};

/// A network PDU that passed decryption, address and replay checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPdu {
    /// Index of the network key that authenticated the packet
    pub net_key_index: u16,
    /// Decrypted packet
    pub pdu: NetworkPdu,
}

/// Network layer state owned by one node
pub struct NetworkLayer {
    replay: Box<dyn ReplayCache>,
    next_seq: u32,
}

impl NetworkLayer {
    /// Create a network layer with the given replay cache, starting at SEQ 0
    pub fn new(replay: Box<dyn ReplayCache>) -> Self {
        Self {
            replay,
            next_seq: 0,
        }
    }

    /// Seal one lower transport PDU into a network PDU
    pub fn encode(
        &self,
        crypto: &dyn MeshCrypto,
        key: &NetworkKey,
        iv_index: u32,
        header: &NetworkHeader,
        lower_transport_pdu: &[u8],
    ) -> Result<Bytes, CodecError> {
        let raw = seal_network_pdu(crypto, &key.material, iv_index, header, lower_transport_pdu)?;
        debug!(
            net_key_index = key.index,
            src = header.src,
            dst = header.dst,
            seq = header.seq,
            len = raw.len(),
            "network pdu encoded"
        );
        Ok(raw)
    }

    /// Decrypt a raw packet with the first installed key that authenticates it.
    ///
    /// Candidates are the keys whose NID matches, in ascending index order.
    pub fn decode(
        &self,
        crypto: &dyn MeshCrypto,
        keys: &KeyStore,
        raw: &[u8],
    ) -> Result<ReceivedPdu, DecodeError> {
        if raw.len() < MIN_NETWORK_PDU_SIZE {
            return Err(WireError::Incomplete(raw.len()).into());
        }
        if raw.len() > MAX_NETWORK_PDU_SIZE {
            return Err(WireError::Size(raw.len()).into());
        }

        let nid = raw[0] & 0x7f;
        for key in keys.network_keys_with_nid(nid) {
            match open_network_pdu(crypto, &key.material, keys.iv_index(), raw) {
                Ok(pdu) => {
                    return Ok(ReceivedPdu {
                        net_key_index: key.index,
                        pdu,
                    })
                }
                Err(err) => {
                    debug!(net_key_index = key.index, nid, "candidate key rejected: {}", err);
                }
            }
        }

        Err(DecodeError::NoMatchingKey)
    }

    /// Accept `(iv_index, seq)` from `src` only if newer than anything seen
    pub fn replay_check(&mut self, src: u16, iv_index: u32, seq: u32) -> Result<(), DecodeError> {
        if self.replay.check_and_update(src, iv_index, seq)? {
            Ok(())
        } else {
            Err(DecodeError::ReplayRejected { src, seq })
        }
    }

    /// Decode, validate addresses and run the replay check, in that order
    pub fn receive(
        &mut self,
        crypto: &dyn MeshCrypto,
        keys: &KeyStore,
        raw: &[u8],
    ) -> Result<ReceivedPdu, DecodeError> {
        self.receive_with(crypto, keys, raw, |_| false)
    }

    /// Like [`NetworkLayer::receive`], but a packet the replay cache rejects is
    /// still accepted when `late_segment` recognises it as part of a message
    /// that is being reassembled. The cache is left untouched in that case.
    pub fn receive_with<F>(
        &mut self,
        crypto: &dyn MeshCrypto,
        keys: &KeyStore,
        raw: &[u8],
        late_segment: F,
    ) -> Result<ReceivedPdu, DecodeError>
    where
        F: FnOnce(&ReceivedPdu) -> bool,
    {
        let received = self.decode(crypto, keys, raw)?;
        let header = &received.pdu.header;

        if !is_unicast(header.src) || header.dst == UNASSIGNED_ADDRESS {
            warn!(src = header.src, dst = header.dst, "dropping packet with invalid addresses");
            return Err(DecodeError::InvalidAddress {
                src: header.src,
                dst: header.dst,
            });
        }

        match self.replay_check(header.src, received.pdu.iv_index, header.seq) {
            Err(DecodeError::ReplayRejected { .. }) if late_segment(&received) => {
                debug!(src = header.src, seq = header.seq, "late segment of pending message");
            }
            result => result?,
        }

        debug!(
            net_key_index = received.net_key_index,
            src = header.src,
            dst = header.dst,
            seq = header.seq,
            ctl = header.ctl,
            "network pdu accepted"
        );
        Ok(received)
    }

    /// Take the next local sequence number
    pub fn next_seq(&mut self) -> Result<u32, SequenceOverflow> {
        self.reserve_seq(1)
    }

    /// Reserve `count` consecutive sequence numbers and return the first
    pub fn reserve_seq(&mut self, count: usize) -> Result<u32, SequenceOverflow> {
        let overflow = SequenceOverflow {
            next: self.next_seq,
            requested: count,
        };
        let count = u32::try_from(count).map_err(|_| overflow)?;
        let last = self
            .next_seq
            .checked_add(count)
            .and_then(|end| end.checked_sub(1))
            .ok_or(overflow)?;
        if count == 0 || last > SEQ_MAX {
            return Err(overflow);
        }

        let first = self.next_seq;
        self.next_seq = last + 1;
        Ok(first)
    }

    /// Next sequence number that will be used
    pub fn seq(&self) -> u32 {
        self.next_seq
    }

    /// Override the local sequence counter
    pub fn set_seq(&mut self, seq: u32) {
        info!(seq, "sequence number set");
        self.next_seq = seq;
    }

    /// Replay cache backing this layer
    pub fn replay_cache(&mut self) -> &mut dyn ReplayCache {
        self.replay.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use mesh_storage::MemoryReplayCache;
    use mesh_wire::AesCrypto;

    const CONTROL_PACKET: [u8; 28] =
        hex!("68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df");

    fn keys() -> KeyStore {
        let mut keys = KeyStore::new();
        keys.set_iv_index(0x12345678);
        keys.add_network_key_raw(&AesCrypto, 0, &hex!("7dd7364cd842ad18c17c2b820c84c3d6"));
        keys
    }

    fn layer() -> NetworkLayer {
        NetworkLayer::new(Box::new(MemoryReplayCache::default()))
    }

    #[test]
    fn test_encode_control_reference() {
        let keys = keys();
        let header = NetworkHeader::new(true, 0, 1, 0x1201, 0xfffd);
        let raw = layer()
            .encode(
                &AesCrypto,
                keys.network_key(0).unwrap(),
                keys.iv_index(),
                &header,
                &hex!("034b50057e400000010000"),
            )
            .unwrap();
        assert_eq!(&raw[..], &CONTROL_PACKET[..]);
    }

    #[test]
    fn test_decode_selects_valid_key_among_nid_collisions() {
        let mut keys = keys();
        let mut impostor = keys.network_key(0).unwrap().material;
        impostor.encryption_key = [0x11; 16];
        keys.add_network_key(7, impostor);
        // an impostor with a lower index is tried first and must fail
        keys.add_network_key(0, impostor);
        keys.add_network_key_raw(&AesCrypto, 3, &hex!("7dd7364cd842ad18c17c2b820c84c3d6"));

        let received = layer().decode(&AesCrypto, &keys, &CONTROL_PACKET).unwrap();
        assert_eq!(received.net_key_index, 3);
        assert_eq!(received.pdu.header.seq, 1);
    }

    #[test]
    fn test_decode_without_key_fails() {
        let mut keys = KeyStore::new();
        keys.set_iv_index(0x12345678);
        keys.add_network_key_raw(&AesCrypto, 0, &hex!("f7a2a44f8e8a8029064f173ddc1e2b00"));

        let result = layer().decode(&AesCrypto, &keys, &CONTROL_PACKET);
        assert!(matches!(result, Err(DecodeError::NoMatchingKey)));

        let result = layer().decode(&AesCrypto, &keys, &CONTROL_PACKET[..3]);
        assert!(matches!(
            result,
            Err(DecodeError::Malformed(WireError::Incomplete(3)))
        ));
    }

    #[test]
    fn test_receive_rejects_replay() {
        let keys = keys();
        let mut layer = layer();

        layer.receive(&AesCrypto, &keys, &CONTROL_PACKET).unwrap();
        let again = layer.receive(&AesCrypto, &keys, &CONTROL_PACKET);
        assert!(matches!(
            again,
            Err(DecodeError::ReplayRejected { src: 0x1201, seq: 1 })
        ));
    }

    #[test]
    fn test_garbled_packet_does_not_poison_replay_cache() {
        let keys = keys();
        let mut layer = layer();

        let mut garbled = CONTROL_PACKET;
        garbled[20] ^= 0xff;
        assert!(layer.receive(&AesCrypto, &keys, &garbled).is_err());
        assert!(layer.replay_cache().is_empty());

        assert!(layer.receive(&AesCrypto, &keys, &CONTROL_PACKET).is_ok());
    }

    #[test]
    fn test_replay_check_monotonic() {
        let mut layer = layer();
        assert!(layer.replay_check(0x0003, 0, 10).is_ok());
        assert!(layer.replay_check(0x0003, 0, 10).is_err());
        assert!(layer.replay_check(0x0003, 0, 9).is_err());
        assert!(layer.replay_check(0x0003, 0, 11).is_ok());
    }

    #[test]
    fn test_sequence_allocation() {
        let mut layer = layer();
        layer.set_seq(0x3129ab);
        assert_eq!(layer.reserve_seq(2).unwrap(), 0x3129ab);
        assert_eq!(layer.next_seq().unwrap(), 0x3129ad);
        assert_eq!(layer.seq(), 0x3129ae);
    }

    #[test]
    fn test_sequence_overflow() {
        let mut layer = layer();
        layer.set_seq(SEQ_MAX);
        assert_eq!(layer.next_seq().unwrap(), SEQ_MAX);
        assert_eq!(
            layer.next_seq(),
            Err(SequenceOverflow {
                next: SEQ_MAX + 1,
                requested: 1
            })
        );

        layer.set_seq(SEQ_MAX - 1);
        assert!(layer.reserve_seq(3).is_err());
        assert_eq!(layer.seq(), SEQ_MAX - 1);
    }
}
