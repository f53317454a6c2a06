//! Network, lower transport and upper transport layers of the mesh, plus the
//! send pipeline that drains sealed packets onto a broadcast bearer.
//!
//! ## Layers
//!
//! - **Network**: key trial decoding by NID, address checks, replay
//!   protection, local sequence number allocation
//! - **Lower transport**: unsegmented pass-through, segmentation and bounded
//!   keyed reassembly
//! - **Upper transport**: access encryption with application or device keys,
//!   control PDU construction, deterministic trial decryption
//! - **Send pipeline**: `Idle -> Queued -> Sending` state machine over a FIFO
//!   of packets, one in flight at a time
//!
//! [`MeshStack`] wires the layers together. It is driven by
//! [`BearerEvent`]s and reports to a [`TransportHandler`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bearer;
pub mod config;
pub mod error;
pub mod lower;
pub mod network;
pub mod pipeline;
pub mod stack;
pub mod upper;

pub use bearer::{Bearer, BearerEvent};
pub use config::TransportConfig;
pub use error::{
    DecodeError, ReassemblyError, SendPipelineError, SequenceOverflow, TransportError,
    UpperTransportError,
};
pub use lower::{LowerReceiveError, LowerTransportLayer, LowerTransportOutcome};
pub use network::{NetworkLayer, ReceivedPdu};
pub use pipeline::{MessageId, OutboundPacket, PipelineState, SendJob, SendPipeline};
pub use stack::{received_event, MeshStack, StackStats, TransportHandler};
pub use upper::{
    AccessContext, AccessMessage, ControlMessage, UnsegmentedMessage, UpperTransportLayer,
    UpperTransportPdu,
};
