//! Installed keys and the IV index.
//!
//! Keys arrive already validated from provisioning. Network keys can be
//! installed either as raw NetKeys (derived with `k2`) or as pre-derived
//! material; application keys get their AID from `k4`. Lookups return
//! candidates in ascending index order so trial decryption is deterministic.

use crate::StorageError;
use mesh_wire::{k2, k4, Key, MeshCrypto, NetworkKeyMaterial};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

/// Upper transport key selector: the device key or an application key index
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyIndex {
    /// The node's device key
    Device,
    /// Application key with this index
    App(u16),
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyIndex::Device => write!(f, "device"),
            KeyIndex::App(index) => write!(f, "app:{}", index),
        }
    }
}

/// An installed network key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKey {
    /// Network key index
    pub index: u16,
    /// Derived NID, encryption and privacy keys
    pub material: NetworkKeyMaterial,
}

/// An installed application key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationKey {
    /// Application key index
    pub index: u16,
    /// Network key this application key is bound to
    pub net_key_index: u16,
    /// 6-bit application key identifier
    pub aid: u8,
    /// Key value
    pub key: Key,
}

/// Keys and IV index of one node
#[derive(Debug, Clone, Default)]
pub struct KeyStore {
    iv_index: u32,
    net_keys: BTreeMap<u16, NetworkKey>,
    app_keys: BTreeMap<u16, ApplicationKey>,
    device_key: Option<Key>,
}

impl KeyStore {
    /// Create an empty key store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current IV index
    pub fn iv_index(&self) -> u32 {
        self.iv_index
    }

    /// Set the IV index
    pub fn set_iv_index(&mut self, iv_index: u32) {
        info!(iv_index, "IV index set");
        self.iv_index = iv_index;
    }

    /// Install pre-derived network key material
    pub fn add_network_key(&mut self, index: u16, material: NetworkKeyMaterial) {
        info!(net_key_index = index, nid = material.nid, "network key installed");
        self.net_keys.insert(index, NetworkKey { index, material });
    }

    /// Install a raw NetKey, deriving NID, encryption and privacy keys
    pub fn add_network_key_raw(&mut self, crypto: &dyn MeshCrypto, index: u16, net_key: &Key) {
        let material = k2(crypto, net_key, &[0x00]);
        self.add_network_key(index, material);
    }

    /// Install an application key bound to an installed network key
    pub fn add_application_key(
        &mut self,
        crypto: &dyn MeshCrypto,
        index: u16,
        net_key_index: u16,
        key: &Key,
    ) -> Result<(), StorageError> {
        if !self.net_keys.contains_key(&net_key_index) {
            return Err(StorageError::NetKeyNotFound(net_key_index));
        }

        let aid = k4(crypto, key);
        info!(app_key_index = index, net_key_index, aid, "application key installed");
        self.app_keys.insert(
            index,
            ApplicationKey {
                index,
                net_key_index,
                aid,
                key: *key,
            },
        );
        Ok(())
    }

    /// Install the device key
    pub fn set_device_key(&mut self, key: &Key) {
        info!("device key installed");
        self.device_key = Some(*key);
    }

    /// Network key by index
    pub fn network_key(&self, index: u16) -> Result<&NetworkKey, StorageError> {
        self.net_keys
            .get(&index)
            .ok_or(StorageError::NetKeyNotFound(index))
    }

    /// Network keys whose NID matches, ascending by index
    pub fn network_keys_with_nid(&self, nid: u8) -> impl Iterator<Item = &NetworkKey> + '_ {
        self.net_keys
            .values()
            .filter(move |key| key.material.nid == nid)
    }

    /// Number of installed network keys
    pub fn network_key_count(&self) -> usize {
        self.net_keys.len()
    }

    /// Application key by index
    pub fn application_key(&self, index: u16) -> Result<&ApplicationKey, StorageError> {
        self.app_keys
            .get(&index)
            .ok_or(StorageError::NotFound(KeyIndex::App(index)))
    }

    /// Application keys whose AID matches, ascending by index
    pub fn application_keys_with_aid(&self, aid: u8) -> impl Iterator<Item = &ApplicationKey> + '_ {
        self.app_keys.values().filter(move |key| key.aid == aid)
    }

    /// The device key
    pub fn device_key(&self) -> Result<&Key, StorageError> {
        self.device_key
            .as_ref()
            .ok_or(StorageError::NotFound(KeyIndex::Device))
    }
}
