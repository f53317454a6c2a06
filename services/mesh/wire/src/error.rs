//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Buffer shorter than the fixed part of the PDU
    #[error("incomplete pdu: {0} bytes")]
    Incomplete(usize),

    /// Encoded PDU would exceed the bearer limit
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// TTL outside of 0..=127
    #[error("invalid ttl {0}")]
    Ttl(u8),

    /// Sequence number wider than 24 bits
    #[error("sequence number {0:#x} exceeds 24 bits")]
    Seq(u32),

    /// Control opcode wider than 7 bits
    #[error("invalid control opcode {0:#x}")]
    Opcode(u8),

    /// AID wider than 6 bits
    #[error("invalid aid {0:#x}")]
    Aid(u8),

    /// Segment header fields out of range
    #[error("invalid segment: seg_o={seg_o} seg_n={seg_n}")]
    Segment {
        /// Segment offset
        seg_o: u8,
        /// Last segment index
        seg_n: u8,
    },

    /// Reserved bits nonzero
    #[error("reserved bits nonzero")]
    Reserved,

    /// Malformed PDU structure
    #[error("malformed pdu")]
    Malformed,
}

/// Errors raised by the crypto service
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Authentication tag did not verify
    #[error("authentication failed")]
    AuthFailed,

    /// Tag length not supported by the AEAD
    #[error("unsupported mic length {0}")]
    MicLength(usize),

    /// Nonce of the wrong size
    #[error("invalid nonce length {0}")]
    Nonce(usize),
}

/// Reasons a segmented message is abandoned or a segment is refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyError {
    /// PDU carries no segment header
    #[error("pdu is not segmented")]
    Unsegmented,

    /// SeqZero cannot be reconciled with the segment SEQ
    #[error("invalid seq_zero {seq_zero:#06x} for seq {seq:#08x}")]
    SeqAuth {
        /// SEQ of the segment
        seq: u32,
        /// SeqZero carried by the segment
        seq_zero: u16,
    },

    /// SegN differs from earlier segments of the same message
    #[error("inconsistent segment count from {src:#06x} seq_zero {seq_zero:#06x}")]
    InconsistentSegmentCount {
        /// Source address
        src: u16,
        /// SeqZero of the message
        seq_zero: u16,
    },

    /// Kind, SZMIC or segment length differs from the rest of the message
    #[error("inconsistent segment header from {src:#06x} seq_zero {seq_zero:#06x}")]
    InconsistentHeader {
        /// Source address
        src: u16,
        /// SeqZero of the message
        seq_zero: u16,
    },

    /// Segment belongs to a message older than the one in progress
    #[error("stale segment from {src:#06x} seq_zero {seq_zero:#06x}")]
    Stale {
        /// Source address
        src: u16,
        /// SeqZero of the message
        seq_zero: u16,
    },

    /// No segment arrived within the reassembly timeout
    #[error("reassembly timed out for {src:#06x} seq_zero {seq_zero:#06x}")]
    Timeout {
        /// Source address
        src: u16,
        /// SeqZero of the message
        seq_zero: u16,
    },
}
