//! Network PDU header fields and address classification.
//!
//! This module defines the cleartext view of the 9-octet network header
//! (IVI/NID, CTL/TTL, SEQ, SRC, DST). Obfuscation and encryption of the
//! header are applied by [`crate::codec`].

use crate::WireError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Maximum size of a network PDU on the advertising bearer
pub const MAX_NETWORK_PDU_SIZE: usize = 29;

/// Cleartext header size (IVI/NID, CTL/TTL, SEQ, SRC, DST)
pub const NETWORK_HEADER_SIZE: usize = 9;

/// Octets covered by obfuscation (CTL/TTL, SEQ, SRC)
pub const OBFUSCATED_HEADER_SIZE: usize = 6;

/// NetMIC size for access messages (CTL = 0)
pub const ACCESS_NET_MIC_SIZE: usize = 4;

/// NetMIC size for control messages (CTL = 1)
pub const CONTROL_NET_MIC_SIZE: usize = 8;

/// Highest TTL encodable in 7 bits
pub const MAX_TTL: u8 = 0x7f;

/// Highest 24-bit sequence number
pub const SEQ_MAX: u32 = 0x00ff_ffff;

/// 16-bit mesh element address
pub type Address = u16;

/// The unassigned address
pub const UNASSIGNED_ADDRESS: Address = 0x0000;
/// All-proxies fixed group address
pub const ALL_PROXIES_ADDRESS: Address = 0xfffc;
/// All-friends fixed group address
pub const ALL_FRIENDS_ADDRESS: Address = 0xfffd;
/// All-relays fixed group address
pub const ALL_RELAYS_ADDRESS: Address = 0xfffe;
/// All-nodes fixed group address
pub const ALL_NODES_ADDRESS: Address = 0xffff;

/// Address classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressType {
    /// 0x0000
    Unassigned,
    /// 0x0001..=0x7fff
    Unicast,
    /// 0x8000..=0xbfff
    Virtual,
    /// 0xc000..=0xffff
    Group,
}

impl AddressType {
    /// Classify an address by its top bits
    pub fn of(addr: Address) -> Self {
        match addr {
            UNASSIGNED_ADDRESS => AddressType::Unassigned,
            0x0001..=0x7fff => AddressType::Unicast,
            0x8000..=0xbfff => AddressType::Virtual,
            _ => AddressType::Group,
        }
    }
}

/// Check whether an address is a unicast element address
pub fn is_unicast(addr: Address) -> bool {
    AddressType::of(addr) == AddressType::Unicast
}

/// Cleartext network header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkHeader {
    /// Least significant bit of the IV index
    pub ivi: u8,
    /// Network identifier of the key (7 bits)
    pub nid: u8,
    /// Control message flag
    pub ctl: bool,
    /// Time to live (7 bits)
    pub ttl: u8,
    /// Sequence number (24 bits)
    pub seq: u32,
    /// Source address
    pub src: Address,
    /// Destination address
    pub dst: Address,
}

impl NetworkHeader {
    /// Create a header; IVI and NID are filled in when the PDU is sealed
    pub fn new(ctl: bool, ttl: u8, seq: u32, src: Address, dst: Address) -> Self {
        Self {
            ivi: 0,
            nid: 0,
            ctl,
            ttl,
            seq,
            src,
            dst,
        }
    }

    /// NetMIC size implied by the CTL flag
    pub fn net_mic_size(&self) -> usize {
        if self.ctl {
            CONTROL_NET_MIC_SIZE
        } else {
            ACCESS_NET_MIC_SIZE
        }
    }

    /// Largest lower transport PDU that fits next to this header
    pub fn max_transport_size(&self) -> usize {
        MAX_NETWORK_PDU_SIZE - NETWORK_HEADER_SIZE - self.net_mic_size()
    }

    /// First octet: IVI | NID
    pub fn ivi_nid(&self) -> u8 {
        ((self.ivi & 0x01) << 7) | (self.nid & 0x7f)
    }

    /// Second octet: CTL | TTL
    pub fn ctl_ttl(&self) -> u8 {
        ((self.ctl as u8) << 7) | (self.ttl & MAX_TTL)
    }

    /// Validate field widths
    pub fn validate(&self) -> Result<(), WireError> {
        if self.ttl > MAX_TTL {
            return Err(WireError::Ttl(self.ttl));
        }
        if self.seq > SEQ_MAX {
            return Err(WireError::Seq(self.seq));
        }
        if self.ivi > 1 || self.nid > 0x7f {
            return Err(WireError::Reserved);
        }
        Ok(())
    }

    /// Encode the six octets that are obfuscated on the wire
    pub fn encode_obfuscated_part(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ctl_ttl());
        put_u24(buf, self.seq);
        buf.put_u16(self.src);
    }

    /// Encode the full 9-octet cleartext header (big-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.ivi_nid());
        self.encode_obfuscated_part(buf);
        buf.put_u16(self.dst);
    }

    /// Decode a 9-octet cleartext header (big-endian)
    pub fn decode(buf: &mut Bytes) -> Result<Self, WireError> {
        if buf.len() < NETWORK_HEADER_SIZE {
            return Err(WireError::Incomplete(buf.len()));
        }

        let ivi_nid = buf.get_u8();
        let ctl_ttl = buf.get_u8();
        let seq = get_u24(buf);
        let src = buf.get_u16();
        let dst = buf.get_u16();

        Ok(Self {
            ivi: ivi_nid >> 7,
            nid: ivi_nid & 0x7f,
            ctl: ctl_ttl & 0x80 != 0,
            ttl: ctl_ttl & MAX_TTL,
            seq,
            src,
            dst,
        })
    }
}

/// Write a 24-bit big-endian value
pub(crate) fn put_u24(buf: &mut BytesMut, value: u32) {
    buf.put_u8((value >> 16) as u8);
    buf.put_u16(value as u16);
}

/// Read a 24-bit big-endian value
pub(crate) fn get_u24(buf: &mut Bytes) -> u32 {
    let hi = buf.get_u8() as u32;
    let lo = buf.get_u16() as u32;
    (hi << 16) | lo
}
