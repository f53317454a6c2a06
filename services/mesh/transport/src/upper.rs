//! Upper transport layer: access message encryption with application or
//! device keys, control PDU construction, and trial decryption on receive.
//!
//! Access PDUs carry no opcode of their own. The first octet of the lower
//! transport PDU selects the key class (AKF) and, for application keys, the
//! 6-bit AID. Receive-side trial order is deterministic: AKF=0 means the device
//! key; AKF=1 tries every application key with a matching AID that is bound to
//! the receiving subnet, in ascending key index order.

use crate::error::UpperTransportError;
use bytes::Bytes;
use mesh_storage::{KeyIndex, KeyStore};
use mesh_wire::{
    is_unicast, upper_transport_nonce, Address, AddressType, Key, LowerTransportPdu,
    MeshCrypto, NetworkHeader, NonceType, PduKind, ACCESS_SEGMENT_SIZE, CONTROL_SEGMENT_SIZE,
    MAX_SEGMENTS, UNASSIGNED_ADDRESS,
};
use tracing::{debug, warn};

/// TransMIC size for `szmic = 0`
pub const SHORT_TRANS_MIC_SIZE: usize = 4;

/// TransMIC size for `szmic = 1`
pub const LONG_TRANS_MIC_SIZE: usize = 8;

/// Largest upper transport access PDU (ciphertext + TransMIC)
pub const MAX_ACCESS_PDU_SIZE: usize = MAX_SEGMENTS * ACCESS_SEGMENT_SIZE;

/// Largest control parameter block
pub const MAX_CONTROL_PARAMS_SIZE: usize = MAX_SEGMENTS * CONTROL_SEGMENT_SIZE;

/// TransMIC size selected by the SZMIC flag
pub fn trans_mic_size(szmic: bool) -> usize {
    if szmic {
        LONG_TRANS_MIC_SIZE
    } else {
        SHORT_TRANS_MIC_SIZE
    }
}

/// Largest access plaintext for the given TransMIC selector
pub fn max_access_payload(szmic: bool) -> usize {
    MAX_ACCESS_PDU_SIZE - trans_mic_size(szmic)
}

/// A decrypted access message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMessage {
    /// Network key the packets arrived under
    pub net_key_index: u16,
    /// Key that authenticated the payload
    pub key: KeyIndex,
    /// Source address
    pub src: Address,
    /// Destination address
    pub dst: Address,
    /// TTL of the (first) network PDU
    pub ttl: u8,
    /// SEQ of the first segment
    pub seq_auth: u32,
    /// Long TransMIC used
    pub szmic: bool,
    /// Plaintext access payload
    pub payload: Bytes,
}

/// A reassembled control message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    /// Network key the packets arrived under
    pub net_key_index: u16,
    /// Source address
    pub src: Address,
    /// Destination address
    pub dst: Address,
    /// TTL of the first segment received
    pub ttl: u8,
    /// SEQ of the first segment
    pub seq_auth: u32,
    /// 7-bit control opcode
    pub opcode: u8,
    /// Opcode parameters
    pub params: Bytes,
}

/// An unsegmented PDU that is not an authenticated access message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsegmentedMessage {
    /// Network key the packet arrived under
    pub net_key_index: u16,
    /// Decrypted network header
    pub header: NetworkHeader,
    /// IV index the packet was received under
    pub iv_index: u32,
    /// The lower transport PDU as received
    pub pdu: LowerTransportPdu,
}

/// A complete upper transport PDU delivered to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpperTransportPdu {
    /// Decrypted access message
    Access(AccessMessage),
    /// Control message
    Control(ControlMessage),
}

/// Everything needed to authenticate one received access PDU
#[derive(Debug, Clone, Copy)]
pub struct AccessContext {
    /// Network key the packets arrived under
    pub net_key_index: u16,
    /// Application key flag from the lower transport header
    pub akf: bool,
    /// AID from the lower transport header
    pub aid: u8,
    /// Source address
    pub src: Address,
    /// Destination address
    pub dst: Address,
    /// SEQ of the first segment
    pub seq_auth: u32,
    /// IV index the packets were received under
    pub iv_index: u32,
    /// Long TransMIC flag (only set for segmented messages)
    pub szmic: bool,
}

/// Stateless upper transport operations
#[derive(Debug, Clone, Copy, Default)]
pub struct UpperTransportLayer;

impl UpperTransportLayer {
    /// Create the layer
    pub fn new() -> Self {
        Self
    }

    /// Lower transport header and key for sending with `key` on `net_key_index`
    pub fn access_kind(
        &self,
        keys: &KeyStore,
        key: KeyIndex,
        net_key_index: u16,
    ) -> Result<(PduKind, Key), UpperTransportError> {
        match key {
            KeyIndex::Device => Ok((
                PduKind::Access { akf: false, aid: 0 },
                *keys.device_key()?,
            )),
            KeyIndex::App(index) => {
                let app_key = keys.application_key(index)?;
                if app_key.net_key_index != net_key_index {
                    return Err(UpperTransportError::KeyBinding { key, net_key_index });
                }
                Ok((
                    PduKind::Access {
                        akf: true,
                        aid: app_key.aid,
                    },
                    app_key.key,
                ))
            }
        }
    }

    /// Check addressing and size of an outgoing access message
    pub fn validate_access(
        &self,
        src: Address,
        dst: Address,
        len: usize,
        szmic: bool,
    ) -> Result<(), UpperTransportError> {
        validate_addresses(src, dst)?;
        if AddressType::of(dst) == AddressType::Virtual {
            return Err(UpperTransportError::VirtualAddressUnsupported(dst));
        }
        if len > max_access_payload(szmic) {
            return Err(UpperTransportError::PayloadTooLarge(len));
        }
        Ok(())
    }

    /// Encrypt an access payload; returns the lower transport header and the
    /// upper transport PDU (ciphertext followed by TransMIC)
    #[allow(clippy::too_many_arguments)]
    pub fn seal_access(
        &self,
        crypto: &dyn MeshCrypto,
        keys: &KeyStore,
        key: KeyIndex,
        net_key_index: u16,
        seq_auth: u32,
        src: Address,
        dst: Address,
        plaintext: &[u8],
        szmic: bool,
    ) -> Result<(PduKind, Bytes), UpperTransportError> {
        self.validate_access(src, dst, plaintext.len(), szmic)?;
        let (kind, key_value) = self.access_kind(keys, key, net_key_index)?;

        let nonce_type = match key {
            KeyIndex::Device => NonceType::Device,
            KeyIndex::App(_) => NonceType::Application,
        };
        let nonce = upper_transport_nonce(nonce_type, szmic, seq_auth, src, dst, keys.iv_index());
        let sealed = crypto.ccm_seal(&key_value, &nonce, &[], plaintext, trans_mic_size(szmic))?;

        debug!(%key, src, dst, seq_auth, len = sealed.len(), "access payload sealed");
        Ok((kind, Bytes::from(sealed)))
    }

    /// Authenticate and decrypt an access PDU, reporting the key that matched
    pub fn open_access(
        &self,
        crypto: &dyn MeshCrypto,
        keys: &KeyStore,
        ctx: &AccessContext,
        sealed: &[u8],
    ) -> Result<(KeyIndex, Bytes), UpperTransportError> {
        let failed = UpperTransportError::AuthenticationFailed {
            src: ctx.src,
            seq_auth: ctx.seq_auth,
        };
        let mic_len = trans_mic_size(ctx.szmic);
        if sealed.len() < mic_len {
            return Err(failed);
        }

        if !ctx.akf {
            let Ok(device_key) = keys.device_key() else {
                debug!(src = ctx.src, "no device key installed");
                return Err(failed);
            };
            let nonce = upper_transport_nonce(
                NonceType::Device,
                ctx.szmic,
                ctx.seq_auth,
                ctx.src,
                ctx.dst,
                ctx.iv_index,
            );
            return crypto
                .ccm_open(device_key, &nonce, &[], sealed, mic_len)
                .map(|plain| (KeyIndex::Device, Bytes::from(plain)))
                .map_err(|_| failed);
        }

        let nonce = upper_transport_nonce(
            NonceType::Application,
            ctx.szmic,
            ctx.seq_auth,
            ctx.src,
            ctx.dst,
            ctx.iv_index,
        );
        for app_key in keys
            .application_keys_with_aid(ctx.aid)
            .filter(|k| k.net_key_index == ctx.net_key_index)
        {
            match crypto.ccm_open(&app_key.key, &nonce, &[], sealed, mic_len) {
                Ok(plain) => return Ok((KeyIndex::App(app_key.index), Bytes::from(plain))),
                Err(_) => debug!(app_key_index = app_key.index, "candidate app key rejected"),
            }
        }

        warn!(src = ctx.src, seq_auth = ctx.seq_auth, aid = ctx.aid, "no key authenticates access pdu");
        Err(failed)
    }

    /// Build the lower transport header and parameters of a control message
    pub fn control_pdu(
        &self,
        src: Address,
        dst: Address,
        opcode: u8,
        params: &[u8],
    ) -> Result<(PduKind, Bytes), UpperTransportError> {
        validate_addresses(src, dst)?;
        if opcode > 0x7f {
            return Err(UpperTransportError::Opcode(opcode));
        }
        if params.len() > MAX_CONTROL_PARAMS_SIZE {
            return Err(UpperTransportError::PayloadTooLarge(params.len()));
        }
        Ok((PduKind::Control { opcode }, Bytes::copy_from_slice(params)))
    }
}

fn validate_addresses(src: Address, dst: Address) -> Result<(), UpperTransportError> {
    if !is_unicast(src) || dst == UNASSIGNED_ADDRESS {
        return Err(UpperTransportError::InvalidAddress { src, dst });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use mesh_storage::StorageError;
    use mesh_wire::AesCrypto;

    const NET_KEY: Key = hex!("7dd7364cd842ad18c17c2b820c84c3d6");
    const APP_KEY: Key = hex!("63964771734fbd76e3b40519d1d94a48");
    const DEV_KEY: Key = hex!("9d6dd0e96eb25dc19a40ed9914f8f03f");
    const PAYLOAD: [u8; 20] = hex!("0056341263964771734fbd76e3b40519d1d94a48");

    fn keys() -> KeyStore {
        let mut keys = KeyStore::new();
        keys.set_iv_index(0x12345678);
        keys.add_network_key_raw(&AesCrypto, 0, &NET_KEY);
        keys.add_application_key(&AesCrypto, 0, 0, &APP_KEY).unwrap();
        keys.set_device_key(&DEV_KEY);
        keys
    }

    fn context(kind: PduKind, szmic: bool) -> AccessContext {
        let (akf, aid) = match kind {
            PduKind::Access { akf, aid } => (akf, aid),
            PduKind::Control { .. } => panic!("not an access kind"),
        };
        AccessContext {
            net_key_index: 0,
            akf,
            aid,
            src: 0x0003,
            dst: 0x1201,
            seq_auth: 0x3129ab,
            iv_index: 0x12345678,
            szmic,
        }
    }

    #[test]
    fn test_device_key_reference_vector() {
        let upper = UpperTransportLayer::new();
        let keys = keys();

        let (kind, sealed) = upper
            .seal_access(
                &AesCrypto,
                &keys,
                KeyIndex::Device,
                0,
                0x3129ab,
                0x0003,
                0x1201,
                &PAYLOAD,
                false,
            )
            .unwrap();
        assert_eq!(kind, PduKind::Access { akf: false, aid: 0 });
        assert_eq!(
            &sealed[..],
            &hex!("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308")
        );

        let (key, plain) = upper
            .open_access(&AesCrypto, &keys, &context(kind, false), &sealed)
            .unwrap();
        assert_eq!(key, KeyIndex::Device);
        assert_eq!(&plain[..], &PAYLOAD[..]);
    }

    #[test]
    fn test_app_key_round_trip_both_mic_sizes() {
        let upper = UpperTransportLayer::new();
        let keys = keys();

        for szmic in [false, true] {
            let (kind, sealed) = upper
                .seal_access(
                    &AesCrypto,
                    &keys,
                    KeyIndex::App(0),
                    0,
                    0x3129ab,
                    0x0003,
                    0x1201,
                    b"hello mesh",
                    szmic,
                )
                .unwrap();
            assert_eq!(kind, PduKind::Access { akf: true, aid: 0x26 });
            assert_eq!(sealed.len(), 10 + trans_mic_size(szmic));

            let (key, plain) = upper
                .open_access(&AesCrypto, &keys, &context(kind, szmic), &sealed)
                .unwrap();
            assert_eq!(key, KeyIndex::App(0));
            assert_eq!(&plain[..], b"hello mesh");
        }
    }

    #[test]
    fn test_trial_order_is_ascending_and_respects_binding() {
        let upper = UpperTransportLayer::new();
        let mut keys = keys();
        keys.add_network_key_raw(&AesCrypto, 1, &hex!("f7a2a44f8e8a8029064f173ddc1e2b00"));
        keys.add_application_key(&AesCrypto, 9, 0, &APP_KEY).unwrap();
        keys.add_application_key(&AesCrypto, 4, 0, &APP_KEY).unwrap();

        let (kind, sealed) = upper
            .seal_access(
                &AesCrypto,
                &keys,
                KeyIndex::App(9),
                0,
                7,
                0x0003,
                0x1201,
                b"payload",
                false,
            )
            .unwrap();
        let mut ctx = context(kind, false);
        ctx.seq_auth = 7;

        // identical key material installed three times: the lowest index wins
        let (key, _) = upper.open_access(&AesCrypto, &keys, &ctx, &sealed).unwrap();
        assert_eq!(key, KeyIndex::App(0));

        // keys bound to another subnet are never tried
        let mut rebound = keys.clone();
        rebound
            .add_application_key(&AesCrypto, 0, 1, &APP_KEY)
            .unwrap();
        let (key, _) = upper.open_access(&AesCrypto, &rebound, &ctx, &sealed).unwrap();
        assert_eq!(key, KeyIndex::App(4));
    }

    #[test]
    fn test_authentication_failure() {
        let upper = UpperTransportLayer::new();
        let keys = keys();
        let (kind, sealed) = upper
            .seal_access(
                &AesCrypto,
                &keys,
                KeyIndex::Device,
                0,
                0x3129ab,
                0x0003,
                0x1201,
                &PAYLOAD,
                false,
            )
            .unwrap();

        let mut tampered = sealed.to_vec();
        tampered[0] ^= 0x01;
        let result = upper.open_access(&AesCrypto, &keys, &context(kind, false), &tampered);
        assert!(matches!(
            result,
            Err(UpperTransportError::AuthenticationFailed {
                src: 0x0003,
                seq_auth: 0x3129ab
            })
        ));

        // no application key with this AID
        let mut ctx = context(PduKind::Access { akf: true, aid: 0x01 }, false);
        ctx.seq_auth = 1;
        assert!(upper.open_access(&AesCrypto, &keys, &ctx, &sealed).is_err());

        // shorter than the TransMIC
        assert!(upper
            .open_access(&AesCrypto, &keys, &context(kind, true), &sealed[..4])
            .is_err());
    }

    #[test]
    fn test_seal_rejections() {
        let upper = UpperTransportLayer::new();
        let keys = keys();
        let seal = |key, net_key_index, src, dst, len, szmic| {
            upper.seal_access(
                &AesCrypto,
                &keys,
                key,
                net_key_index,
                1,
                src,
                dst,
                &vec![0u8; len],
                szmic,
            )
        };

        assert!(seal(KeyIndex::App(0), 0, 0x0003, 0x1201, 380, false).is_ok());
        assert!(matches!(
            seal(KeyIndex::App(0), 0, 0x0003, 0x1201, 377, true),
            Err(UpperTransportError::PayloadTooLarge(377))
        ));
        assert!(matches!(
            seal(KeyIndex::App(0), 1, 0x0003, 0x1201, 4, false),
            Err(UpperTransportError::KeyBinding {
                key: KeyIndex::App(0),
                net_key_index: 1
            })
        ));
        assert!(matches!(
            seal(KeyIndex::App(5), 0, 0x0003, 0x1201, 4, false),
            Err(UpperTransportError::UnknownKey(StorageError::NotFound(
                KeyIndex::App(5)
            )))
        ));
        assert!(matches!(
            seal(KeyIndex::Device, 0, 0x0003, 0x8001, 4, false),
            Err(UpperTransportError::VirtualAddressUnsupported(0x8001))
        ));
        assert!(matches!(
            seal(KeyIndex::Device, 0, 0xc000, 0x1201, 4, false),
            Err(UpperTransportError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_control_pdu() {
        let upper = UpperTransportLayer::new();
        let (kind, params) = upper
            .control_pdu(0x1201, 0xfffd, 0x03, &hex!("4b50057e400000010000"))
            .unwrap();
        assert_eq!(kind, PduKind::Control { opcode: 0x03 });
        assert_eq!(params.len(), 10);

        assert!(matches!(
            upper.control_pdu(0x1201, 0xfffd, 0x80, &[]),
            Err(UpperTransportError::Opcode(0x80))
        ));
        assert!(matches!(
            upper.control_pdu(0x1201, 0xfffd, 0x03, &[0u8; 257]),
            Err(UpperTransportError::PayloadTooLarge(257))
        ));
        assert!(upper.control_pdu(0x1201, 0xfffd, 0x03, &[0u8; 256]).is_ok());
    }
}
