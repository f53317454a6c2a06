//! Transport layer error types.

use mesh_storage::{KeyIndex, StorageError};
use mesh_wire::{Address, CodecError, CryptoError, WireError};
use thiserror::Error;

pub use mesh_wire::ReassemblyError;

/// Reasons a received network PDU is dropped
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Packet is too short, too long or structurally invalid
    #[error("malformed pdu: {0}")]
    Malformed(#[from] WireError),

    /// No installed network key matches the NID and authenticates the packet
    #[error("no matching network key")]
    NoMatchingKey,

    /// Packet authenticated but its sequence number is not fresh
    #[error("replay rejected from {src:#06x} seq {seq:#08x}")]
    ReplayRejected {
        /// Source address
        src: Address,
        /// Rejected sequence number
        seq: u32,
    },

    /// SRC is not unicast or DST is unassigned
    #[error("invalid addresses src {src:#06x} dst {dst:#06x}")]
    InvalidAddress {
        /// Source address
        src: Address,
        /// Destination address
        dst: Address,
    },

    /// Replay cache backend failed
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Upper transport failures on send and receive
#[derive(Error, Debug)]
pub enum UpperTransportError {
    /// No device or application key authenticates the message
    #[error("authentication failed from {src:#06x} seq_auth {seq_auth:#08x}")]
    AuthenticationFailed {
        /// Source address
        src: Address,
        /// SeqAuth of the message
        seq_auth: u32,
    },

    /// Payload exceeds what 32 segments can carry
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    /// Selected key is not installed
    #[error("key not found: {0}")]
    UnknownKey(#[from] StorageError),

    /// Application key is bound to a different network key
    #[error("{key} is not bound to network key {net_key_index}")]
    KeyBinding {
        /// Application key
        key: KeyIndex,
        /// Requested network key
        net_key_index: u16,
    },

    /// Virtual destinations need a Label UUID
    #[error("virtual address {0:#06x} not supported")]
    VirtualAddressUnsupported(Address),

    /// SRC is not unicast or DST is unassigned
    #[error("invalid addresses src {src:#06x} dst {dst:#06x}")]
    InvalidAddress {
        /// Source address
        src: Address,
        /// Destination address
        dst: Address,
    },

    /// Control opcode does not fit 7 bits
    #[error("invalid control opcode {0:#x}")]
    Opcode(u8),

    /// Crypto service rejected the request
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Send pipeline admission and cancellation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendPipelineError {
    /// Queue cannot take every packet of the message
    #[error("send queue busy: {queued} queued, {requested} requested, limit {limit}")]
    Busy {
        /// Packets already queued
        queued: usize,
        /// Packets in the refused message
        requested: usize,
        /// Queue limit
        limit: usize,
    },

    /// Message is unknown or already fully sent
    #[error("message {0} not queued")]
    NotQueued(u64),

    /// Message has a packet on the bearer and must complete
    #[error("message {0} already sending")]
    InFlight(u64),

    /// Bearer signal arrived in a state that does not expect it
    #[error("unexpected bearer signal in state {0}")]
    UnexpectedSignal(&'static str),
}

/// The 24-bit sequence space is exhausted for this IV index
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("sequence number overflow: next {next:#08x}, requested {requested}")]
pub struct SequenceOverflow {
    /// Next unused sequence number
    pub next: u32,
    /// Number of sequence numbers requested
    pub requested: usize,
}

/// Errors returned by the send entry points
#[derive(Error, Debug)]
pub enum TransportError {
    /// Upper transport error
    #[error("upper transport: {0}")]
    Upper(#[from] UpperTransportError),

    /// Send pipeline error
    #[error("send pipeline: {0}")]
    Pipeline(#[from] SendPipelineError),

    /// Sequence space exhausted
    #[error(transparent)]
    SequenceOverflow(#[from] SequenceOverflow),

    /// Encoding error
    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    /// Storage error
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
}

impl From<WireError> for TransportError {
    fn from(err: WireError) -> Self {
        TransportError::Codec(CodecError::Wire(err))
    }
}
