//! The mesh stack: network, lower and upper transport layers wired to a
//! bearer and an application handler.
//!
//! The stack is single-threaded and callback driven. The embedding event loop
//! feeds it [`BearerEvent`]s and timer ticks; the stack calls back into the
//! [`Bearer`] to request send slots and transmit, and into the
//! [`TransportHandler`] to deliver messages. Every callback runs to completion
//! before control returns to the caller.

use crate::bearer::{Bearer, BearerEvent};
use crate::config::TransportConfig;
use crate::error::{DecodeError, SequenceOverflow, TransportError};
use crate::lower::{LowerReceiveError, LowerTransportLayer, LowerTransportOutcome};
use crate::network::{NetworkLayer, ReceivedPdu};
use crate::pipeline::{MessageId, OutboundPacket, PipelineState, SendJob, SendPipeline};
use crate::upper::{
    AccessContext, AccessMessage, ControlMessage, UnsegmentedMessage, UpperTransportLayer,
    UpperTransportPdu,
};
use bytes::Bytes;
use mesh_storage::{KeyIndex, KeyStore, ReplayCacheMode, StorageError};
use mesh_wire::{
    Address, LowerTransportPdu, MeshCrypto, NetworkHeader, PduKind, ReassembledPdu, WireError,
    MAX_TTL,
};
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Application side of the stack
pub trait TransportHandler {
    /// A network PDU passed decryption and replay checks
    fn network_pdu_received(&mut self, _pdu: &ReceivedPdu) {}

    /// The bearer finished transmitting a network PDU
    fn network_pdu_sent(&mut self, _job: &SendJob) {}

    /// An unsegmented PDU that is control traffic or did not authenticate as access
    fn unsegmented_message(&mut self, message: UnsegmentedMessage);

    /// A decrypted access message or a reassembled control message
    fn upper_transport_pdu(&mut self, pdu: UpperTransportPdu);

    /// No key authenticated a reassembled access message
    fn authentication_failed(&mut self, _src: Address, _seq_auth: u32) {}

    /// The local sequence space is exhausted
    fn sequence_overflow(&mut self, _overflow: &SequenceOverflow) {}
}

/// Stack counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StackStats {
    /// Raw packets handed in by the bearer
    pub packets_received: u64,
    /// Packets dropped as malformed
    pub malformed: u64,
    /// Packets no network key authenticated
    pub no_matching_key: u64,
    /// Packets with invalid SRC or DST
    pub invalid_address: u64,
    /// Packets rejected by the replay cache
    pub replays_rejected: u64,
    /// Replay cache backend failures
    pub storage_errors: u64,
    /// Segments already received
    pub duplicate_segments: u64,
    /// Segments refused by the reassembler
    pub reassembly_errors: u64,
    /// Reassemblies abandoned on timeout
    pub reassembly_timeouts: u64,
    /// Messages delivered to `upper_transport_pdu`
    pub messages_delivered: u64,
    /// Messages delivered to `unsegmented_message`
    pub unsegmented_delivered: u64,
    /// Reassembled access messages no key authenticated
    pub authentication_failures: u64,
    /// Messages accepted by the send pipeline
    pub messages_queued: u64,
    /// Network PDUs the bearer finished transmitting
    pub packets_sent: u64,
}

/// One mesh node's network and transport state
pub struct MeshStack<B: Bearer, H: TransportHandler> {
    crypto: Box<dyn MeshCrypto + Send>,
    keys: KeyStore,
    network: NetworkLayer,
    lower: LowerTransportLayer,
    upper: UpperTransportLayer,
    pipeline: SendPipeline,
    bearer: B,
    handler: H,
    stats: StackStats,
}

impl<B: Bearer, H: TransportHandler> MeshStack<B, H> {
    /// Build a stack; fails only if the replay cache backend cannot be opened
    pub fn new(
        config: TransportConfig,
        keys: KeyStore,
        crypto: Box<dyn MeshCrypto + Send>,
        bearer: B,
        handler: H,
    ) -> Result<Self, StorageError> {
        let replay = ReplayCacheMode::from_mode(config.replay_cache.clone())?;
        info!(
            net_keys = keys.network_key_count(),
            iv_index = keys.iv_index(),
            "mesh stack created"
        );

        Ok(Self {
            crypto,
            keys,
            network: NetworkLayer::new(replay),
            lower: LowerTransportLayer::new(config.reassembly()),
            upper: UpperTransportLayer::new(),
            pipeline: SendPipeline::new(config.send_queue_limit),
            bearer,
            handler,
            stats: StackStats::default(),
        })
    }

    /// Encrypt and queue an access message.
    ///
    /// `key` selects the device key or an application key bound to
    /// `net_key_index`. Returns the id of the queued message.
    #[allow(clippy::too_many_arguments)]
    pub fn access_send(
        &mut self,
        net_key_index: u16,
        key: KeyIndex,
        ttl: u8,
        src: Address,
        dst: Address,
        plaintext: &[u8],
        szmic: bool,
    ) -> Result<MessageId, TransportError> {
        check_ttl(ttl)?;
        self.upper.validate_access(src, dst, plaintext.len(), szmic)?;
        let (kind, _) = self.upper.access_kind(&self.keys, key, net_key_index)?;
        self.keys.network_key(net_key_index)?;

        let upper_len = plaintext.len() + crate::upper::trans_mic_size(szmic);
        let count = self.lower.segment_count(&kind, szmic, upper_len);
        self.pipeline.can_admit(count)?;
        let seq_auth = self.reserve(count)?;

        let (kind, upper_pdu) = self.upper.seal_access(
            self.crypto.as_ref(),
            &self.keys,
            key,
            net_key_index,
            seq_auth,
            src,
            dst,
            plaintext,
            szmic,
        )?;
        let lower_pdus = self.lower.send(kind, szmic, seq_auth, upper_pdu)?;
        let header = NetworkHeader::new(false, ttl, seq_auth, src, dst);

        debug!(%key, src, dst, seq_auth, segments = count, "access message prepared");
        self.queue(net_key_index, header, lower_pdus)
    }

    /// Queue a control message; only the network layer authenticates it
    pub fn control_send(
        &mut self,
        net_key_index: u16,
        ttl: u8,
        src: Address,
        dst: Address,
        opcode: u8,
        params: &[u8],
    ) -> Result<MessageId, TransportError> {
        check_ttl(ttl)?;
        let (kind, params) = self.upper.control_pdu(src, dst, opcode, params)?;
        self.keys.network_key(net_key_index)?;

        let count = self.lower.segment_count(&kind, false, params.len());
        self.pipeline.can_admit(count)?;
        let seq_auth = self.reserve(count)?;

        let lower_pdus = self.lower.send(kind, false, seq_auth, params)?;
        let header = NetworkHeader::new(true, ttl, seq_auth, src, dst);

        debug!(opcode, src, dst, seq_auth, segments = count, "control message prepared");
        self.queue(net_key_index, header, lower_pdus)
    }

    /// Drop a queued message that has not reached the bearer
    pub fn cancel(&mut self, message_id: MessageId) -> Result<usize, TransportError> {
        Ok(self.pipeline.cancel(message_id)?)
    }

    /// Process one bearer signal
    pub fn handle_bearer_event(&mut self, event: BearerEvent, now: Instant) {
        match event {
            BearerEvent::Received(raw) => self.receive(&raw, now),
            BearerEvent::ReadyToSend => match self.pipeline.on_ready() {
                Ok(Some(raw)) => self.bearer.transmit(&raw),
                Ok(None) => {}
                Err(err) => warn!("ready signal ignored: {}", err),
            },
            BearerEvent::TransmitComplete => match self.pipeline.on_transmit_complete() {
                Ok(done) => {
                    self.stats.packets_sent += 1;
                    self.handler.network_pdu_sent(&done.job);
                    if done.request_ready {
                        self.bearer.request_send_ready();
                    }
                }
                Err(err) => warn!("transmit complete ignored: {}", err),
            },
        }
    }

    /// Abandon reassemblies that have been idle past the timeout
    pub fn poll_timeouts(&mut self, now: Instant) -> usize {
        let expired = self.lower.expire(now);
        for err in &expired {
            warn!("reassembly abandoned: {}", err);
        }
        self.stats.reassembly_timeouts += expired.len() as u64;
        expired.len()
    }

    /// Override the local sequence counter
    pub fn set_seq(&mut self, seq: u32) {
        self.network.set_seq(seq);
    }

    /// Next local sequence number
    pub fn seq(&self) -> u32 {
        self.network.seq()
    }

    /// Flush the replay cache to its backend
    pub fn snapshot_replay_cache(&mut self) -> Result<(), StorageError> {
        self.network.replay_cache().snapshot()
    }

    /// Installed keys
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Installed keys, for provisioning updates
    pub fn keys_mut(&mut self) -> &mut KeyStore {
        &mut self.keys
    }

    /// Counters
    pub fn stats(&self) -> &StackStats {
        &self.stats
    }

    /// Send pipeline state
    pub fn pipeline_state(&self) -> PipelineState {
        self.pipeline.state()
    }

    /// Number of partial messages held
    pub fn active_reassemblies(&self) -> usize {
        self.lower.active_reassemblies()
    }

    /// The bearer
    pub fn bearer(&self) -> &B {
        &self.bearer
    }

    /// The bearer, mutably
    pub fn bearer_mut(&mut self) -> &mut B {
        &mut self.bearer
    }

    /// The handler
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// The handler, mutably
    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    fn reserve(&mut self, count: usize) -> Result<u32, TransportError> {
        self.network.reserve_seq(count).map_err(|overflow| {
            error!("{}", overflow);
            self.handler.sequence_overflow(&overflow);
            TransportError::SequenceOverflow(overflow)
        })
    }

    fn queue(
        &mut self,
        net_key_index: u16,
        header: NetworkHeader,
        lower_pdus: Vec<LowerTransportPdu>,
    ) -> Result<MessageId, TransportError> {
        let net_key = self.keys.network_key(net_key_index)?;
        let mut packets = Vec::with_capacity(lower_pdus.len());
        for (i, lower) in lower_pdus.iter().enumerate() {
            let mut header = header;
            header.seq += i as u32;
            let raw = self.network.encode(
                self.crypto.as_ref(),
                net_key,
                self.keys.iv_index(),
                &header,
                &lower.encode()?,
            )?;
            packets.push(OutboundPacket {
                net_key_index,
                header,
                raw,
            });
        }

        let queued = self.pipeline.queue_message(packets)?;
        self.stats.messages_queued += 1;
        if queued.request_ready {
            self.bearer.request_send_ready();
        }
        Ok(queued.message_id)
    }

    fn receive(&mut self, raw: &[u8], now: Instant) {
        self.stats.packets_received += 1;

        let lower = &self.lower;
        let received = match self.network.receive_with(
            self.crypto.as_ref(),
            &self.keys,
            raw,
            |received| lower.is_late_segment(received),
        ) {
            Ok(received) => received,
            Err(err) => {
                self.record_drop(&err);
                return;
            }
        };
        self.handler.network_pdu_received(&received);

        match self.lower.receive(&received, now) {
            Ok(LowerTransportOutcome::Unsegmented(pdu)) => self.deliver_unsegmented(&received, pdu),
            Ok(LowerTransportOutcome::Reassembled(pdu)) => {
                self.deliver_reassembled(received.net_key_index, pdu)
            }
            Ok(LowerTransportOutcome::Pending) => {}
            Ok(LowerTransportOutcome::Duplicate) => self.stats.duplicate_segments += 1,
            Err(LowerReceiveError::Decode(err)) => self.record_drop(&err),
            Err(LowerReceiveError::Reassembly(_)) => self.stats.reassembly_errors += 1,
        }
    }

    fn record_drop(&mut self, err: &DecodeError) {
        match err {
            DecodeError::Malformed(_) => {
                self.stats.malformed += 1;
                warn!("dropping malformed packet: {}", err);
            }
            DecodeError::NoMatchingKey => {
                self.stats.no_matching_key += 1;
                debug!("dropping packet: {}", err);
            }
            DecodeError::ReplayRejected { .. } => {
                self.stats.replays_rejected += 1;
                debug!("dropping packet: {}", err);
            }
            DecodeError::InvalidAddress { .. } => self.stats.invalid_address += 1,
            DecodeError::Storage(_) => {
                self.stats.storage_errors += 1;
                error!("replay cache failure: {}", err);
            }
        }
    }

    fn deliver_unsegmented(&mut self, received: &ReceivedPdu, pdu: LowerTransportPdu) {
        let header = received.pdu.header;

        if let PduKind::Access { akf, aid } = pdu.kind {
            let ctx = AccessContext {
                net_key_index: received.net_key_index,
                akf,
                aid,
                src: header.src,
                dst: header.dst,
                seq_auth: header.seq,
                iv_index: received.pdu.iv_index,
                szmic: false,
            };
            if let Ok((key, payload)) =
                self.upper
                    .open_access(self.crypto.as_ref(), &self.keys, &ctx, &pdu.payload)
            {
                self.deliver(UpperTransportPdu::Access(AccessMessage {
                    net_key_index: received.net_key_index,
                    key,
                    src: header.src,
                    dst: header.dst,
                    ttl: header.ttl,
                    seq_auth: header.seq,
                    szmic: false,
                    payload,
                }));
                return;
            }
        }

        self.stats.unsegmented_delivered += 1;
        self.handler.unsegmented_message(UnsegmentedMessage {
            net_key_index: received.net_key_index,
            header,
            iv_index: received.pdu.iv_index,
            pdu,
        });
    }

    fn deliver_reassembled(&mut self, net_key_index: u16, pdu: ReassembledPdu) {
        match pdu.kind {
            PduKind::Access { akf, aid } => {
                let ctx = AccessContext {
                    net_key_index,
                    akf,
                    aid,
                    src: pdu.src,
                    dst: pdu.dst,
                    seq_auth: pdu.seq_auth,
                    iv_index: pdu.iv_index,
                    szmic: pdu.szmic,
                };
                match self
                    .upper
                    .open_access(self.crypto.as_ref(), &self.keys, &ctx, &pdu.payload)
                {
                    Ok((key, payload)) => self.deliver(UpperTransportPdu::Access(AccessMessage {
                        net_key_index,
                        key,
                        src: pdu.src,
                        dst: pdu.dst,
                        ttl: pdu.ttl,
                        seq_auth: pdu.seq_auth,
                        szmic: pdu.szmic,
                        payload,
                    })),
                    Err(err) => {
                        warn!("dropping access message: {}", err);
                        self.stats.authentication_failures += 1;
                        self.handler.authentication_failed(pdu.src, pdu.seq_auth);
                    }
                }
            }
            PduKind::Control { opcode } => self.deliver(UpperTransportPdu::Control(ControlMessage {
                net_key_index,
                src: pdu.src,
                dst: pdu.dst,
                ttl: pdu.ttl,
                seq_auth: pdu.seq_auth,
                opcode,
                params: pdu.payload,
            })),
        }
    }

    fn deliver(&mut self, pdu: UpperTransportPdu) {
        self.stats.messages_delivered += 1;
        self.handler.upper_transport_pdu(pdu);
    }
}

fn check_ttl(ttl: u8) -> Result<(), TransportError> {
    if ttl > MAX_TTL {
        return Err(WireError::Ttl(ttl).into());
    }
    Ok(())
}

/// Raw packet bytes, for bearers that hand packets over as slices
pub fn received_event(raw: &[u8]) -> BearerEvent {
    BearerEvent::Received(Bytes::copy_from_slice(raw))
}
