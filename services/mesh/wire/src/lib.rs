//! Network and lower transport wire formats for the mesh.
//!
//! This crate holds everything that is bit-exact on the air: the network PDU
//! header and its obfuscation, AES-CCM sealing of network and upper transport
//! PDUs, lower transport PDU formats, and segmentation and reassembly.
//!
//! ## Features
//!
//! - **Crypto boundary**: [`MeshCrypto`] trait with an AES-128 implementation
//!   and the `s1`/`k2`/`k4` key derivation functions
//! - **Zero-Copy I/O**: Uses `Bytes`/`BytesMut` for segment payloads
//! - **Segmentation**: Split upper transport PDUs into up to 32 segments
//! - **Reassembly**: Arena-backed table keyed by source and SeqZero with
//!   timeouts and duplicate suppression
//!
//! ## Wire Format
//!
//! ```text
//! +--------+---------+-----------+--------+--------+-------------------+--------+
//! | IVI(1) | CTL(1)  | SEQ (24)  | SRC    | DST    | Lower Transport   | NetMIC |
//! | NID(7) | TTL(7)  |           | (16)   | (16)   | PDU (1..16)       | (32/64)|
//! +--------+---------+-----------+--------+--------+-------------------+--------+
//!          |<------ obfuscated -------->|<---------- encrypted -------->|
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod crypto;
pub mod error;
pub mod header;
pub mod lower;
pub mod segment;

// Re-export main types
pub use codec::{
    open_network_pdu, receive_iv_index, seal_network_pdu, CodecError, NetworkPdu,
    MIN_NETWORK_PDU_SIZE,
};
pub use crypto::{
    k2, k4, network_nonce, s1, upper_transport_nonce, AesCrypto, Key, MeshCrypto,
    NetworkKeyMaterial, Nonce, NonceType, NONCE_SIZE,
};
pub use error::{CryptoError, ReassemblyError, WireError};
pub use header::{
    is_unicast, Address, AddressType, NetworkHeader, ALL_FRIENDS_ADDRESS, ALL_NODES_ADDRESS,
    ALL_PROXIES_ADDRESS, ALL_RELAYS_ADDRESS, MAX_NETWORK_PDU_SIZE, MAX_TTL, SEQ_MAX,
    UNASSIGNED_ADDRESS,
};
pub use lower::{
    seq_auth, ControlOpcode, LowerTransportPdu, PduKind, SegmentHeader, ACCESS_SEGMENT_SIZE,
    CONTROL_SEGMENT_SIZE, MAX_SEGMENTS, MAX_UNSEGMENTED_ACCESS_SIZE, MAX_UNSEGMENTED_CONTROL_SIZE,
};
pub use segment::{
    ReassembledPdu, Reassembler, ReassemblyConfig, ReassemblyOutcome, Segmenter,
};
