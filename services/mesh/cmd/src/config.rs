//! Configuration handling for the advmesh tool.
//!
//! The configuration is a YAML file describing the IV index, the installed
//! keys, the simulated nodes and a send script. Environment variables
//! override a few fields; a missing file falls back to the reference keys.

use anyhow::{bail, Context, Result};
use mesh_storage::{KeyIndex, KeyStore, ReplayCacheMode};
use mesh_transport::TransportConfig;
use mesh_wire::{is_unicast, Address, Key, MeshCrypto, NetworkKeyMaterial};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Reference NetKey used when no configuration is present
pub const SAMPLE_NET_KEY: &str = "7dd7364cd842ad18c17c2b820c84c3d6";
/// Reference AppKey
pub const SAMPLE_APP_KEY: &str = "63964771734fbd76e3b40519d1d94a48";
/// Reference DevKey
pub const SAMPLE_DEV_KEY: &str = "9d6dd0e96eb25dc19a40ed9914f8f03f";
/// Reference IV index
pub const SAMPLE_IV_INDEX: u32 = 0x12345678;

/// Invalid key material in the configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// Not a hex string
    #[error("{name}: invalid hex: {reason}")]
    Hex {
        /// Config field
        name: String,
        /// Decoder message
        reason: String,
    },
    /// Decoded to the wrong length
    #[error("{name}: expected 16 bytes, got {len}")]
    KeyLength {
        /// Config field
        name: String,
        /// Decoded length
        len: usize,
    },
}

/// Mesh tool configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Current IV index
    pub iv_index: u32,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Installed network keys
    pub network_keys: Vec<NetworkKeyConfig>,
    /// Installed application keys
    pub application_keys: Vec<ApplicationKeyConfig>,
    /// Device key, hex
    pub device_key: Option<String>,
    /// Simulated nodes
    pub nodes: Vec<NodeConfig>,
    /// Transport layer settings
    pub transport: TransportSettings,
    /// Messages sent by the simulator, in order
    pub script: Vec<ScriptStep>,
}

/// A network key, raw or pre-derived
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkKeyConfig {
    /// Network key index
    pub index: u16,
    /// Raw NetKey, hex; derived with k2
    #[serde(default)]
    pub key: Option<String>,
    /// Explicit NID, encryption and privacy keys
    #[serde(default)]
    pub derived: Option<DerivedNetworkKey>,
}

/// Pre-derived network key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedNetworkKey {
    /// 7-bit network identifier
    pub nid: u8,
    /// Encryption key, hex
    pub encryption_key: String,
    /// Privacy key, hex
    pub privacy_key: String,
}

/// An application key bound to a network key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationKeyConfig {
    /// Application key index
    pub index: u16,
    /// Bound network key index
    pub net_key_index: u16,
    /// Raw AppKey, hex
    pub key: String,
}

/// A simulated node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Name used in logs and scripts
    pub name: String,
    /// Unicast element address
    pub address: Address,
}

/// Transport settings as written in the file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Sources tracked by the in-memory replay cache; 0 tracks every source
    pub replay_cache_capacity: usize,
    /// Persist the replay cache to this JSON file instead
    pub replay_cache_file: Option<PathBuf>,
    /// Snapshot the file cache after this many updates
    pub snapshot_every: u32,
    /// Reassembly timeout, e.g. "10s"
    pub reassembly_timeout: String,
    /// Maximum concurrent reassemblies
    pub max_reassemblies: usize,
    /// Completed messages remembered for duplicate suppression
    pub completed_capacity: usize,
    /// Maximum queued network PDUs
    pub send_queue_limit: Option<usize>,
}

/// One scripted send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScriptStep {
    /// Access message
    Access {
        /// Sending node name
        from: String,
        /// Destination address
        dst: Address,
        /// Network key index
        #[serde(default)]
        net_key_index: u16,
        /// Device key or application key index
        key: KeyIndex,
        /// TTL
        ttl: u8,
        /// Plaintext, hex
        payload: String,
        /// Use the 64-bit TransMIC
        #[serde(default)]
        szmic: bool,
        /// Force the sender's sequence number first
        #[serde(default)]
        seq: Option<u32>,
    },
    /// Control message
    Control {
        /// Sending node name
        from: String,
        /// Destination address
        dst: Address,
        /// Network key index
        #[serde(default)]
        net_key_index: u16,
        /// TTL
        ttl: u8,
        /// 7-bit opcode
        opcode: u8,
        /// Parameters, hex
        params: String,
        /// Force the sender's sequence number first
        #[serde(default)]
        seq: Option<u32>,
    },
}

impl ScriptStep {
    /// Name of the sending node
    pub fn sender(&self) -> &str {
        match self {
            ScriptStep::Access { from, .. } | ScriptStep::Control { from, .. } => from,
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let defaults = TransportConfig::default();
        Self {
            replay_cache_capacity: mesh_storage::DEFAULT_REPLAY_CACHE_CAPACITY,
            replay_cache_file: None,
            snapshot_every: 16,
            reassembly_timeout: humantime::format_duration(defaults.reassembly_timeout).to_string(),
            max_reassemblies: defaults.max_reassemblies,
            completed_capacity: defaults.completed_capacity,
            send_queue_limit: defaults.send_queue_limit,
        }
    }
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            iv_index: SAMPLE_IV_INDEX,
            log_level: "info".to_string(),
            network_keys: vec![NetworkKeyConfig {
                index: 0,
                key: Some(SAMPLE_NET_KEY.to_string()),
                derived: None,
            }],
            application_keys: vec![ApplicationKeyConfig {
                index: 0,
                net_key_index: 0,
                key: SAMPLE_APP_KEY.to_string(),
            }],
            device_key: Some(SAMPLE_DEV_KEY.to_string()),
            nodes: vec![
                NodeConfig {
                    name: "provisioner".to_string(),
                    address: 0x0003,
                },
                NodeConfig {
                    name: "node".to_string(),
                    address: 0x1201,
                },
            ],
            transport: TransportSettings::default(),
            script: vec![
                ScriptStep::Control {
                    from: "node".to_string(),
                    dst: 0xfffd,
                    net_key_index: 0,
                    ttl: 0,
                    opcode: 0x03,
                    params: "4b50057e400000010000".to_string(),
                    seq: Some(1),
                },
                ScriptStep::Access {
                    from: "provisioner".to_string(),
                    dst: 0x1201,
                    net_key_index: 0,
                    key: KeyIndex::Device,
                    ttl: 4,
                    payload: "0056341263964771734fbd76e3b40519d1d94a48".to_string(),
                    szmic: false,
                    seq: Some(0x3129ab),
                },
            ],
        }
    }
}

impl MeshConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config: MeshConfig = serde_yaml::from_str(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("Config file {:?} not found, using reference keys", path);
                Self::default()
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read config file {:?}", path))
            }
        };

        config.apply_overrides(|name| std::env::var(name).ok());
        config.validate()?;

        info!(
            "Mesh configuration: iv_index={:#010x}, net_keys={}, app_keys={}, nodes={}",
            config.iv_index,
            config.network_keys.len(),
            config.application_keys.len(),
            config.nodes.len()
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides looked up through `var`
    pub fn apply_overrides<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = var("MESH_IV_INDEX") {
            match parse_u32(&value) {
                Some(iv_index) => {
                    self.iv_index = iv_index;
                    info!("IV index overridden by environment: {:#010x}", iv_index);
                }
                None => warn!("Ignoring invalid MESH_IV_INDEX {:?}", value),
            }
        }

        if let Some(level) = var("MESH_LOG_LEVEL") {
            self.log_level = level;
        }

        if let Some(value) = var("MESH_REPLAY_CACHE_CAPACITY") {
            match value.parse::<usize>() {
                Ok(capacity) if capacity > 0 => {
                    self.transport.replay_cache_capacity = capacity;
                    info!("Replay cache capacity overridden by environment: {}", capacity);
                }
                _ => warn!("Ignoring invalid MESH_REPLAY_CACHE_CAPACITY {:?}", value),
            }
        }
    }

    /// Reject configurations the simulator cannot run
    pub fn validate(&self) -> Result<()> {
        if self.network_keys.is_empty() {
            bail!("at least one network key is required");
        }
        for net_key in &self.network_keys {
            if net_key.key.is_some() == net_key.derived.is_some() {
                bail!(
                    "network key {} needs exactly one of `key` or `derived`",
                    net_key.index
                );
            }
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for node in &self.nodes {
            if !is_unicast(node.address) {
                bail!("node {} has non-unicast address {:#06x}", node.name, node.address);
            }
            if !names.insert(node.name.as_str()) || !addresses.insert(node.address) {
                bail!("duplicate node {} ({:#06x})", node.name, node.address);
            }
        }

        for step in &self.script {
            if !names.contains(step.sender()) {
                bail!("script step sent from unknown node {}", step.sender());
            }
        }
        Ok(())
    }

    /// Build the key store every node starts with
    pub fn key_store(&self, crypto: &dyn MeshCrypto) -> Result<KeyStore> {
        let mut keys = KeyStore::new();
        keys.set_iv_index(self.iv_index);

        for net_key in &self.network_keys {
            let name = format!("network_keys[{}]", net_key.index);
            match (&net_key.key, &net_key.derived) {
                (Some(raw), _) => {
                    keys.add_network_key_raw(crypto, net_key.index, &parse_key(&name, raw)?)
                }
                (None, Some(derived)) => keys.add_network_key(
                    net_key.index,
                    NetworkKeyMaterial {
                        nid: derived.nid & 0x7f,
                        encryption_key: parse_key(&name, &derived.encryption_key)?,
                        privacy_key: parse_key(&name, &derived.privacy_key)?,
                    },
                ),
                (None, None) => bail!("network key {} has no key material", net_key.index),
            }
        }

        for app_key in &self.application_keys {
            let name = format!("application_keys[{}]", app_key.index);
            keys.add_application_key(
                crypto,
                app_key.index,
                app_key.net_key_index,
                &parse_key(&name, &app_key.key)?,
            )
            .with_context(|| format!("cannot install {}", name))?;
        }

        if let Some(device_key) = &self.device_key {
            keys.set_device_key(&parse_key("device_key", device_key)?);
        }
        Ok(keys)
    }

    /// Library transport configuration
    pub fn transport_config(&self) -> Result<TransportConfig> {
        let settings = &self.transport;
        let reassembly_timeout = humantime::parse_duration(&settings.reassembly_timeout)
            .with_context(|| {
                format!("invalid reassembly_timeout {:?}", settings.reassembly_timeout)
            })?;

        let replay_cache = match &settings.replay_cache_file {
            Some(path) => ReplayCacheMode::File {
                path: path.clone(),
                snapshot_every: settings.snapshot_every,
            },
            None if settings.replay_cache_capacity == 0 => ReplayCacheMode::Unbounded,
            None => ReplayCacheMode::InMemory {
                capacity: settings.replay_cache_capacity,
            },
        };

        Ok(TransportConfig {
            replay_cache,
            reassembly_timeout,
            max_reassemblies: settings.max_reassemblies,
            completed_capacity: settings.completed_capacity,
            send_queue_limit: settings.send_queue_limit,
        })
    }
}

/// Decode a 16-byte hex key
pub fn parse_key(name: &str, value: &str) -> Result<Key, ConfigError> {
    let bytes = hex::decode(value.trim()).map_err(|e| ConfigError::Hex {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Key::try_from(bytes.as_slice()).map_err(|_| ConfigError::KeyLength {
        name: name.to_string(),
        len: bytes.len(),
    })
}

/// Decimal or `0x`-prefixed hexadecimal
pub fn parse_u32(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_wire::AesCrypto;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        config.validate().unwrap();

        let keys = config.key_store(&AesCrypto).unwrap();
        assert_eq!(keys.iv_index(), 0x12345678);
        assert_eq!(keys.network_key(0).unwrap().material.nid, 0x68);
        assert_eq!(keys.application_key(0).unwrap().aid, 0x26);
        assert!(keys.device_key().is_ok());

        let transport = config.transport_config().unwrap();
        assert_eq!(transport, TransportConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
iv_index: 7
network_keys:
  - index: 1
    derived:
      nid: 104
      encryption_key: 0953fa93e7caac9638f58820220a398e
      privacy_key: 8b84eedec100067d670971dd2aa700cf
application_keys: []
device_key: null
nodes:
  - name: a
    address: 1
  - name: b
    address: 2
transport:
  reassembly_timeout: 3s
  replay_cache_file: /tmp/replay.json
script:
  - type: access
    from: a
    dst: 2
    key: device
    ttl: 4
    payload: "0102"
  - type: control
    from: b
    dst: 65535
    ttl: 0
    opcode: 10
    params: ""
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = MeshConfig::load_from_file(temp_file.path()).unwrap();
        assert_eq!(config.network_keys[0].index, 1);
        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.script.len(), 2);
        assert_eq!(config.script[1].sender(), "b");

        let keys = config.key_store(&AesCrypto).unwrap();
        assert_eq!(keys.network_keys_with_nid(0x68).count(), 1);
        assert!(keys.device_key().is_err());

        let transport = config.transport_config().unwrap();
        assert_eq!(transport.reassembly_timeout, std::time::Duration::from_secs(3));
        assert!(matches!(transport.replay_cache, ReplayCacheMode::File { .. }));
    }

    #[test]
    fn test_missing_file_uses_reference_keys() {
        let dir = tempfile::tempdir().unwrap();
        let config = MeshConfig::load_from_file(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.network_keys, MeshConfig::default().network_keys);
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("MESH_IV_INDEX", "0x10"),
            ("MESH_LOG_LEVEL", "debug"),
            ("MESH_REPLAY_CACHE_CAPACITY", "32"),
        ]
        .into_iter()
        .collect();

        let mut config = MeshConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.iv_index, 0x10);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.transport.replay_cache_capacity, 32);

        let mut config = MeshConfig::default();
        config.apply_overrides(|name| match name {
            "MESH_IV_INDEX" => Some("bogus".to_string()),
            "MESH_REPLAY_CACHE_CAPACITY" => Some("0".to_string()),
            _ => None,
        });
        assert_eq!(config.iv_index, SAMPLE_IV_INDEX);
        assert_eq!(
            config.transport.replay_cache_capacity,
            mesh_storage::DEFAULT_REPLAY_CACHE_CAPACITY
        );
    }

    #[test]
    fn test_replay_cache_selection() {
        let mut config = MeshConfig::default();
        assert_eq!(
            config.transport_config().unwrap().replay_cache,
            ReplayCacheMode::InMemory {
                capacity: mesh_storage::DEFAULT_REPLAY_CACHE_CAPACITY
            }
        );

        config.transport.replay_cache_capacity = 0;
        assert_eq!(
            config.transport_config().unwrap().replay_cache,
            ReplayCacheMode::Unbounded
        );
    }

    #[test]
    fn test_validation_errors() {
        let mut config = MeshConfig::default();
        config.nodes[1].address = 0xc000;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.nodes[1].address = config.nodes[0].address;
        assert!(config.validate().is_err());

        let mut config = MeshConfig::default();
        config.script.push(ScriptStep::Control {
            from: "ghost".to_string(),
            dst: 1,
            net_key_index: 0,
            ttl: 0,
            opcode: 1,
            params: String::new(),
            seq: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_helpers() {
        assert_eq!(parse_u32("0x12345678"), Some(0x12345678));
        assert_eq!(parse_u32("42"), Some(42));
        assert_eq!(parse_u32("x"), None);

        assert!(parse_key("k", SAMPLE_NET_KEY).is_ok());
        assert_eq!(
            parse_key("k", "0011"),
            Err(ConfigError::KeyLength {
                name: "k".to_string(),
                len: 2
            })
        );
        assert!(matches!(parse_key("k", "zz"), Err(ConfigError::Hex { .. })));
    }
}
