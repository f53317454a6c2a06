//! Network PDU sealing and opening.
//!
//! Sealing encrypts `DST || TransportPDU` under the network encryption key and
//! then obfuscates CTL/TTL, SEQ and SRC with a keystream derived from the
//! privacy key and the first seven ciphertext octets:
//!
//! ```text
//! +-------+-------------------------+-----------------------------+--------+
//! | IVI   | CTL/TTL | SEQ  | SRC    | DST | Lower Transport PDU   | NetMIC |
//! | NID   |      obfuscated         |          encrypted          | 4 / 8  |
//! +-------+-------------------------+-----------------------------+--------+
//! ```
//!
//! Opening reverses the steps. Key selection across multiple installed
//! network keys is the caller's job; these functions work on one key.

use crate::crypto::{network_nonce, MeshCrypto, NetworkKeyMaterial};
use crate::error::{CryptoError, WireError};
use crate::header::{
    NetworkHeader, ACCESS_NET_MIC_SIZE, MAX_NETWORK_PDU_SIZE, NETWORK_HEADER_SIZE,
    OBFUSCATED_HEADER_SIZE,
};
use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Octets of ciphertext mixed into the privacy keystream
pub const PRIVACY_RANDOM_SIZE: usize = 7;

/// Smallest network PDU that can carry one transport octet (access)
pub const MIN_NETWORK_PDU_SIZE: usize = NETWORK_HEADER_SIZE + 1 + ACCESS_NET_MIC_SIZE;

/// Codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Crypto error
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// NID of the packet does not belong to this key
    #[error("nid mismatch: expected {expected:#04x}, got {actual:#04x}")]
    NidMismatch {
        /// NID of the key
        expected: u8,
        /// NID carried by the packet
        actual: u8,
    },

    /// IVI refers to an IV index before zero
    #[error("no iv index for ivi {0}")]
    IvIndex(u8),
}

/// A decrypted network PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Cleartext header
    pub header: NetworkHeader,
    /// IV index the packet was authenticated under
    pub iv_index: u32,
    /// Lower transport PDU carried by the packet
    pub transport_pdu: Bytes,
}

/// IV index to use for a received packet given our current IV index
pub fn receive_iv_index(current: u32, ivi: u8) -> Option<u32> {
    if (current & 0x01) as u8 == (ivi & 0x01) {
        Some(current)
    } else {
        current.checked_sub(1)
    }
}

fn privacy_keystream(
    crypto: &dyn MeshCrypto,
    material: &NetworkKeyMaterial,
    iv_index: u32,
    privacy_random: &[u8],
) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[5..9].copy_from_slice(&iv_index.to_be_bytes());
    block[9..16].copy_from_slice(&privacy_random[..PRIVACY_RANDOM_SIZE]);
    crypto.aes_ecb(&material.privacy_key, &block)
}

/// Encrypt and obfuscate one network PDU.
///
/// IVI and NID of `header` are taken from `iv_index` and `material`.
pub fn seal_network_pdu(
    crypto: &dyn MeshCrypto,
    material: &NetworkKeyMaterial,
    iv_index: u32,
    header: &NetworkHeader,
    transport_pdu: &[u8],
) -> Result<Bytes, CodecError> {
    let mut header = *header;
    header.ivi = (iv_index & 0x01) as u8;
    header.nid = material.nid;
    header.validate()?;

    if transport_pdu.is_empty() {
        return Err(WireError::Incomplete(0).into());
    }
    if transport_pdu.len() > header.max_transport_size() {
        return Err(WireError::Size(
            NETWORK_HEADER_SIZE + transport_pdu.len() + header.net_mic_size(),
        )
        .into());
    }

    let mut plaintext = BytesMut::with_capacity(2 + transport_pdu.len());
    plaintext.put_u16(header.dst);
    plaintext.put_slice(transport_pdu);

    let nonce = network_nonce(header.ctl_ttl(), header.seq, header.src, iv_index);
    let sealed = crypto.ccm_seal(
        &material.encryption_key,
        &nonce,
        &[],
        &plaintext,
        header.net_mic_size(),
    )?;

    let pecb = privacy_keystream(crypto, material, iv_index, &sealed);

    let mut obfuscated = BytesMut::with_capacity(OBFUSCATED_HEADER_SIZE);
    header.encode_obfuscated_part(&mut obfuscated);

    let mut out = BytesMut::with_capacity(1 + OBFUSCATED_HEADER_SIZE + sealed.len());
    out.put_u8(header.ivi_nid());
    for (octet, key) in obfuscated.iter().zip(pecb.iter()) {
        out.put_u8(octet ^ key);
    }
    out.put_slice(&sealed);

    Ok(out.freeze())
}

/// De-obfuscate and decrypt one network PDU with a single key.
pub fn open_network_pdu(
    crypto: &dyn MeshCrypto,
    material: &NetworkKeyMaterial,
    current_iv_index: u32,
    raw: &[u8],
) -> Result<NetworkPdu, CodecError> {
    if raw.len() < MIN_NETWORK_PDU_SIZE {
        return Err(WireError::Incomplete(raw.len()).into());
    }
    if raw.len() > MAX_NETWORK_PDU_SIZE {
        return Err(WireError::Size(raw.len()).into());
    }

    let ivi = raw[0] >> 7;
    let nid = raw[0] & 0x7f;
    if nid != material.nid {
        return Err(CodecError::NidMismatch {
            expected: material.nid,
            actual: nid,
        });
    }
    let iv_index = receive_iv_index(current_iv_index, ivi).ok_or(CodecError::IvIndex(ivi))?;

    let encrypted = &raw[1 + OBFUSCATED_HEADER_SIZE..];
    let pecb = privacy_keystream(crypto, material, iv_index, encrypted);

    let mut clear = [0u8; OBFUSCATED_HEADER_SIZE];
    for (i, octet) in clear.iter_mut().enumerate() {
        *octet = raw[1 + i] ^ pecb[i];
    }

    let ctl_ttl = clear[0];
    let seq = u32::from_be_bytes([0, clear[1], clear[2], clear[3]]);
    let src = u16::from_be_bytes([clear[4], clear[5]]);

    let mut header = NetworkHeader::new(ctl_ttl & 0x80 != 0, ctl_ttl & 0x7f, seq, src, 0);
    header.ivi = ivi;
    header.nid = nid;

    let mic_size = header.net_mic_size();
    if raw.len() < NETWORK_HEADER_SIZE + 1 + mic_size {
        return Err(WireError::Incomplete(raw.len()).into());
    }

    let nonce = network_nonce(ctl_ttl, seq, src, iv_index);
    let plaintext = crypto.ccm_open(&material.encryption_key, &nonce, &[], encrypted, mic_size)?;

    header.dst = u16::from_be_bytes([plaintext[0], plaintext[1]]);
    let transport_pdu = Bytes::copy_from_slice(&plaintext[2..]);

    Ok(NetworkPdu {
        header,
        iv_index,
        transport_pdu,
    })
}
