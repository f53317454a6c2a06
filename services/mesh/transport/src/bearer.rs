//! Boundary with the broadcast bearer.

use bytes::Bytes;

/// Outbound half of a bearer
pub trait Bearer {
    /// Ask to be signalled with [`BearerEvent::ReadyToSend`] when a packet may go out
    fn request_send_ready(&mut self);

    /// Hand one sealed network PDU to the radio
    fn transmit(&mut self, packet: &[u8]);
}

/// Signals delivered by the bearer on the stack's event loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BearerEvent {
    /// Raw packet received from the air
    Received(Bytes),
    /// A previously requested send slot is available
    ReadyToSend,
    /// The last transmitted packet left the radio
    TransmitComplete,
}
