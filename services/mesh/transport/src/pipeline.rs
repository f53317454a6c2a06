//! Send pipeline serializing network PDUs onto a one-packet-at-a-time bearer.
//!
//! ```text
//!          queue_message            on_ready
//!   Idle ----------------> Queued -----------> Sending
//!    ^                       ^                    |
//!    |                       | more queued        | on_transmit_complete
//!    +-----------------------+--------------------+
//!              queue empty
//! ```
//!
//! Packets are buffered FIFO. A message is admitted only if all of its packets
//! fit under the queue limit, so segments of one message are never split or
//! interleaved with another message.

use crate::error::SendPipelineError;
use bytes::Bytes;
use mesh_wire::NetworkHeader;
use serde::Serialize;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Identifier assigned to each queued message
pub type MessageId = u64;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    /// Nothing queued, no readiness requested
    Idle,
    /// Packets queued, waiting for the bearer's ready signal
    Queued,
    /// One packet handed to the bearer, waiting for transmit complete
    Sending,
}

impl PipelineState {
    fn name(self) -> &'static str {
        match self {
            PipelineState::Idle => "idle",
            PipelineState::Queued => "queued",
            PipelineState::Sending => "sending",
        }
    }
}

/// One outbound network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendJob {
    /// Message this packet belongs to
    pub message_id: MessageId,
    /// Position of the packet within its message
    pub index: usize,
    /// Network key the packet was sealed with
    pub net_key_index: u16,
    /// Cleartext network header
    pub header: NetworkHeader,
    /// Sealed packet bytes
    pub raw: Bytes,
}

/// Packet ready to be queued, before a message id is assigned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    /// Network key the packet was sealed with
    pub net_key_index: u16,
    /// Cleartext network header
    pub header: NetworkHeader,
    /// Sealed packet bytes
    pub raw: Bytes,
}

/// Result of queueing a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queued {
    /// Id assigned to the message
    pub message_id: MessageId,
    /// The caller must ask the bearer for a ready signal
    pub request_ready: bool,
}

/// Result of a transmit complete signal
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completed {
    /// The packet the bearer finished
    pub job: SendJob,
    /// More packets are queued; the caller must ask for the next ready signal
    pub request_ready: bool,
}

/// FIFO send queue with a single in-flight packet
#[derive(Debug)]
pub struct SendPipeline {
    state: PipelineState,
    queue: VecDeque<SendJob>,
    in_flight: Option<SendJob>,
    current: Option<MessageId>,
    limit: Option<usize>,
    next_id: MessageId,
}

impl SendPipeline {
    /// Create a pipeline; `limit` bounds the number of queued packets
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            state: PipelineState::Idle,
            queue: VecDeque::new(),
            in_flight: None,
            current: None,
            limit,
            next_id: 1,
        }
    }

    /// Current state
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Packets waiting for a ready signal
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Packet currently on the bearer
    pub fn in_flight(&self) -> Option<&SendJob> {
        self.in_flight.as_ref()
    }

    /// Check that `count` more packets fit under the limit
    pub fn can_admit(&self, count: usize) -> Result<(), SendPipelineError> {
        match self.limit {
            Some(limit) if self.queue.len() + count > limit => Err(SendPipelineError::Busy {
                queued: self.queue.len(),
                requested: count,
                limit,
            }),
            _ => Ok(()),
        }
    }

    /// Queue every packet of one message, or none of them
    pub fn queue_message(
        &mut self,
        packets: Vec<OutboundPacket>,
    ) -> Result<Queued, SendPipelineError> {
        self.can_admit(packets.len())?;

        let message_id = self.next_id;
        self.next_id += 1;
        let count = packets.len();
        self.queue
            .extend(packets.into_iter().enumerate().map(|(index, packet)| SendJob {
                message_id,
                index,
                net_key_index: packet.net_key_index,
                header: packet.header,
                raw: packet.raw,
            }));

        let request_ready = self.state == PipelineState::Idle && !self.queue.is_empty();
        if request_ready {
            self.state = PipelineState::Queued;
        }
        debug!(message_id, packets = count, state = self.state.name(), "message queued");
        Ok(Queued {
            message_id,
            request_ready,
        })
    }

    /// Bearer is ready: hand out the next packet to transmit.
    ///
    /// Returns `None` if the queue drained (all jobs cancelled) in the meantime.
    pub fn on_ready(&mut self) -> Result<Option<Bytes>, SendPipelineError> {
        match self.state {
            PipelineState::Queued => {}
            PipelineState::Idle => {
                debug!("ready signal with nothing queued");
                return Ok(None);
            }
            PipelineState::Sending => {
                return Err(SendPipelineError::UnexpectedSignal(self.state.name()));
            }
        }

        let Some(job) = self.queue.pop_front() else {
            self.state = PipelineState::Idle;
            return Ok(None);
        };

        let raw = job.raw.clone();
        debug!(
            message_id = job.message_id,
            index = job.index,
            seq = job.header.seq,
            "transmitting"
        );
        self.current = Some(job.message_id);
        self.in_flight = Some(job);
        self.state = PipelineState::Sending;
        Ok(Some(raw))
    }

    /// Bearer finished the in-flight packet
    pub fn on_transmit_complete(&mut self) -> Result<Completed, SendPipelineError> {
        if self.state != PipelineState::Sending {
            return Err(SendPipelineError::UnexpectedSignal(self.state.name()));
        }
        let Some(job) = self.in_flight.take() else {
            return Err(SendPipelineError::UnexpectedSignal(self.state.name()));
        };

        if self.queue.front().map(|next| next.message_id) != Some(job.message_id) {
            self.current = None;
        }

        let request_ready = !self.queue.is_empty();
        self.state = if request_ready {
            PipelineState::Queued
        } else {
            PipelineState::Idle
        };
        Ok(Completed { job, request_ready })
    }

    /// Drop the queued packets of a message that has not started sending
    pub fn cancel(&mut self, message_id: MessageId) -> Result<usize, SendPipelineError> {
        if self.current == Some(message_id) {
            warn!(message_id, "cannot cancel a message already on the bearer");
            return Err(SendPipelineError::InFlight(message_id));
        }

        let before = self.queue.len();
        self.queue.retain(|job| job.message_id != message_id);
        let removed = before - self.queue.len();
        if removed == 0 {
            return Err(SendPipelineError::NotQueued(message_id));
        }

        info!(message_id, removed, "message cancelled");
        Ok(removed)
    }
}

impl Default for SendPipeline {
    fn default() -> Self {
        Self::new(None)
    }
}
