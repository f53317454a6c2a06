//! Crypto service used by the network and upper transport layers.
//!
//! The layers only see the [`MeshCrypto`] trait: AES-ECB for header
//! obfuscation, AES-CCM for authenticated encryption and AES-CMAC for key
//! derivation. [`AesCrypto`] implements it on top of the RustCrypto `aes`,
//! `ccm` and `cmac` crates. The derivation functions `s1`, `k2` and `k4` and
//! the nonce layouts live here as well.

use crate::error::CryptoError;
use aes::cipher::BlockEncrypt;
use aes::Aes128;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U13, U4, U8};
use ccm::Ccm;
use cmac::{Cmac, Mac};
use serde::{Deserialize, Serialize};

/// 128-bit key
pub type Key = [u8; 16];

/// CCM nonce size used throughout the mesh
pub const NONCE_SIZE: usize = 13;

/// 13-octet CCM nonce
pub type Nonce = [u8; NONCE_SIZE];

/// Synchronous crypto primitives consumed by the stack
pub trait MeshCrypto {
    /// Encrypt one 16-octet block with AES-128
    fn aes_ecb(&self, key: &Key, block: &[u8; 16]) -> [u8; 16];

    /// AES-CMAC over the concatenation of `parts`
    fn aes_cmac(&self, key: &Key, parts: &[&[u8]]) -> [u8; 16];

    /// AES-CCM encrypt; returns ciphertext followed by a `mic_len` tag
    fn ccm_seal(
        &self,
        key: &Key,
        nonce: &Nonce,
        aad: &[u8],
        plaintext: &[u8],
        mic_len: usize,
    ) -> Result<Vec<u8>, CryptoError>;

    /// AES-CCM decrypt of ciphertext followed by a `mic_len` tag
    fn ccm_open(
        &self,
        key: &Key,
        nonce: &Nonce,
        aad: &[u8],
        sealed: &[u8],
        mic_len: usize,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// AES-128 backed crypto service
#[derive(Debug, Clone, Copy, Default)]
pub struct AesCrypto;

impl MeshCrypto for AesCrypto {
    fn aes_ecb(&self, key: &Key, block: &[u8; 16]) -> [u8; 16] {
        let cipher = Aes128::new(GenericArray::from_slice(key));
        let mut block = GenericArray::clone_from_slice(block);
        cipher.encrypt_block(&mut block);

        let mut out = [0u8; 16];
        out.copy_from_slice(&block);
        out
    }

    fn aes_cmac(&self, key: &Key, parts: &[&[u8]]) -> [u8; 16] {
        let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
        for part in parts {
            mac.update(part);
        }

        let mut out = [0u8; 16];
        out.copy_from_slice(&mac.finalize().into_bytes());
        out
    }

    fn ccm_seal(
        &self,
        key: &Key,
        nonce: &Nonce,
        aad: &[u8],
        plaintext: &[u8],
        mic_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let nonce = GenericArray::from_slice(nonce);
        let mut buffer = plaintext.to_vec();

        let tag = match mic_len {
            4 => Ccm::<Aes128, U4, U13>::new(GenericArray::from_slice(key))
                .encrypt_in_place_detached(nonce, aad, &mut buffer)
                .map(|tag| tag.to_vec()),
            8 => Ccm::<Aes128, U8, U13>::new(GenericArray::from_slice(key))
                .encrypt_in_place_detached(nonce, aad, &mut buffer)
                .map(|tag| tag.to_vec()),
            other => return Err(CryptoError::MicLength(other)),
        }
        .map_err(|_| CryptoError::AuthFailed)?;

        buffer.extend_from_slice(&tag);
        Ok(buffer)
    }

    fn ccm_open(
        &self,
        key: &Key,
        nonce: &Nonce,
        aad: &[u8],
        sealed: &[u8],
        mic_len: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        if mic_len != 4 && mic_len != 8 {
            return Err(CryptoError::MicLength(mic_len));
        }
        if sealed.len() < mic_len {
            return Err(CryptoError::AuthFailed);
        }

        let nonce = GenericArray::from_slice(nonce);
        let (ciphertext, tag) = sealed.split_at(sealed.len() - mic_len);
        let mut buffer = ciphertext.to_vec();

        let result = if mic_len == 4 {
            Ccm::<Aes128, U4, U13>::new(GenericArray::from_slice(key)).decrypt_in_place_detached(
                nonce,
                aad,
                &mut buffer,
                GenericArray::from_slice(tag),
            )
        } else {
            Ccm::<Aes128, U8, U13>::new(GenericArray::from_slice(key)).decrypt_in_place_detached(
                nonce,
                aad,
                &mut buffer,
                GenericArray::from_slice(tag),
            )
        };

        result.map_err(|_| CryptoError::AuthFailed)?;
        Ok(buffer)
    }
}

/// Key material derived from a network key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKeyMaterial {
    /// 7-bit network identifier
    pub nid: u8,
    /// Key for network-layer AES-CCM
    pub encryption_key: Key,
    /// Key for header obfuscation
    pub privacy_key: Key,
}

/// Salt generation function s1
pub fn s1(crypto: &dyn MeshCrypto, m: &[u8]) -> Key {
    crypto.aes_cmac(&[0u8; 16], &[m])
}

/// Network key derivation function k2 with the master credentials (P = 0x00)
pub fn k2(crypto: &dyn MeshCrypto, net_key: &Key, p: &[u8]) -> NetworkKeyMaterial {
    let salt = s1(crypto, b"smk2");
    let t = crypto.aes_cmac(&salt, &[net_key]);

    let t1 = crypto.aes_cmac(&t, &[p, &[0x01]]);
    let t2 = crypto.aes_cmac(&t, &[&t1, p, &[0x02]]);
    let t3 = crypto.aes_cmac(&t, &[&t2, p, &[0x03]]);

    NetworkKeyMaterial {
        nid: t1[15] & 0x7f,
        encryption_key: t2,
        privacy_key: t3,
    }
}

/// Application key identifier derivation function k4
pub fn k4(crypto: &dyn MeshCrypto, app_key: &Key) -> u8 {
    let salt = s1(crypto, b"smk4");
    let t = crypto.aes_cmac(&salt, &[app_key]);
    crypto.aes_cmac(&t, &[b"id6", &[0x01]])[15] & 0x3f
}

/// Nonce type octet
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceType {
    /// Network layer
    Network = 0x00,
    /// Upper transport, application key
    Application = 0x01,
    /// Upper transport, device key
    Device = 0x02,
}

/// Network nonce: type | CTL/TTL | SEQ | SRC | pad | IV index
pub fn network_nonce(ctl_ttl: u8, seq: u32, src: u16, iv_index: u32) -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = NonceType::Network as u8;
    nonce[1] = ctl_ttl;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// Application or device nonce: type | ASZMIC | SEQ | SRC | DST | IV index
pub fn upper_transport_nonce(
    nonce_type: NonceType,
    aszmic: bool,
    seq: u32,
    src: u16,
    dst: u16,
    iv_index: u32,
) -> Nonce {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = nonce_type as u8;
    nonce[1] = (aszmic as u8) << 7;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[7..9].copy_from_slice(&dst.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_s1() {
        assert_eq!(s1(&AesCrypto, b"test"), hex!("b73cefbd641ef2ea598c2b6efb62f79c"));
    }

    #[test]
    fn test_k2_master_credentials() {
        let material = k2(&AesCrypto, &hex!("7dd7364cd842ad18c17c2b820c84c3d6"), &[0x00]);
        assert_eq!(material.nid, 0x68);
        assert_eq!(material.encryption_key, hex!("0953fa93e7caac9638f58820220a398e"));
        assert_eq!(material.privacy_key, hex!("8b84eedec100067d670971dd2aa700cf"));

        let material = k2(&AesCrypto, &hex!("f7a2a44f8e8a8029064f173ddc1e2b00"), &[0x00]);
        assert_eq!(material.nid, 0x7f);
        assert_eq!(material.encryption_key, hex!("9f589181a0f50de73c8070c7a6d27f46"));
        assert_eq!(material.privacy_key, hex!("4c715bd4a64b938f99b453351653124f"));
    }

    #[test]
    fn test_k4() {
        assert_eq!(k4(&AesCrypto, &hex!("63964771734fbd76e3b40519d1d94a48")), 0x26);
    }

    #[test]
    fn test_device_key_ccm_matches_reference() {
        let nonce = upper_transport_nonce(NonceType::Device, false, 0x3129ab, 0x0003, 0x1201, 0x12345678);
        assert_eq!(nonce, hex!("02003129ab0003120112345678"));

        let sealed = AesCrypto
            .ccm_seal(
                &hex!("9d6dd0e96eb25dc19a40ed9914f8f03f"),
                &nonce,
                &[],
                &hex!("0056341263964771734fbd76e3b40519d1d94a48"),
                4,
            )
            .unwrap();
        assert_eq!(
            sealed,
            hex!("ee9dddfd2169326d23f3afdfcfdc18c52fdef772e0e17308").to_vec()
        );
    }

    #[test]
    fn test_ccm_open_detects_tampering() {
        let key = hex!("63964771734fbd76e3b40519d1d94a48");
        let nonce = upper_transport_nonce(NonceType::Application, true, 7, 0x0001, 0xc000, 0);

        let mut sealed = AesCrypto.ccm_seal(&key, &nonce, &[], b"hello mesh", 8).unwrap();
        assert_eq!(sealed.len(), 18);
        assert_eq!(
            AesCrypto.ccm_open(&key, &nonce, &[], &sealed, 8).unwrap(),
            b"hello mesh".to_vec()
        );

        sealed[0] ^= 0x01;
        assert_eq!(
            AesCrypto.ccm_open(&key, &nonce, &[], &sealed, 8),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn test_unsupported_mic_length() {
        let key = [0u8; 16];
        let nonce = [0u8; NONCE_SIZE];
        assert_eq!(
            AesCrypto.ccm_seal(&key, &nonce, &[], b"x", 6),
            Err(CryptoError::MicLength(6))
        );
    }

    #[test]
    fn test_network_nonce_layout() {
        let nonce = network_nonce(0x80, 0x000001, 0x1201, 0x12345678);
        assert_eq!(nonce, hex!("00800000011201000012345678"));
    }
}
