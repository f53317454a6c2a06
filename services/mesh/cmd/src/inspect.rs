//! Offline packet inspection and key derivation.

use crate::config::{parse_key, MeshConfig};
use anyhow::{Context, Result};
use mesh_storage::MemoryReplayCache;
use mesh_transport::{AccessContext, NetworkLayer, UpperTransportLayer};
use mesh_wire::{k2, k4, seq_auth, AesCrypto, ControlOpcode, LowerTransportPdu, PduKind};
use serde_json::{json, Value};

/// Decrypt one network PDU with the configured keys and describe every layer
pub fn decode_packet(config: &MeshConfig, packet_hex: &str) -> Result<Value> {
    let raw = hex::decode(packet_hex.trim()).context("packet is not hex")?;
    let crypto = AesCrypto;
    let keys = config.key_store(&crypto)?;

    // decode only, the replay cache is never consulted
    let network = NetworkLayer::new(Box::new(MemoryReplayCache::with_capacity(1)));
    let received = network
        .decode(&crypto, &keys, &raw)
        .context("no configured network key opens this packet")?;
    let header = received.pdu.header;
    let lower = LowerTransportPdu::decode(header.ctl, received.pdu.transport_pdu.clone())
        .context("malformed lower transport pdu")?;

    let mut out = json!({
        "net_key_index": received.net_key_index,
        "iv_index": format!("{:#010x}", received.pdu.iv_index),
        "network": {
            "ivi": header.ivi,
            "nid": format!("{:#04x}", header.nid),
            "ctl": header.ctl,
            "ttl": header.ttl,
            "seq": format!("{:#08x}", header.seq),
            "src": format!("{:#06x}", header.src),
            "dst": format!("{:#06x}", header.dst),
            "transport_pdu": hex::encode(&received.pdu.transport_pdu),
        },
        "lower_transport": describe_lower(&lower, header.seq),
    });

    if let (PduKind::Access { akf, aid }, None) = (lower.kind, lower.segment) {
        let ctx = AccessContext {
            net_key_index: received.net_key_index,
            akf,
            aid,
            src: header.src,
            dst: header.dst,
            seq_auth: header.seq,
            iv_index: received.pdu.iv_index,
            szmic: false,
        };
        out["access"] = match UpperTransportLayer::new().open_access(
            &crypto,
            &keys,
            &ctx,
            &lower.payload,
        ) {
            Ok((key, payload)) => json!({
                "key": key.to_string(),
                "payload": hex::encode(&payload),
            }),
            Err(err) => json!({ "error": err.to_string() }),
        };
    }

    Ok(out)
}

fn describe_lower(pdu: &LowerTransportPdu, seq: u32) -> Value {
    let mut out = match pdu.kind {
        PduKind::Access { akf, aid } => json!({
            "type": "access",
            "akf": akf,
            "aid": format!("{:#04x}", aid),
        }),
        PduKind::Control { opcode } => json!({
            "type": "control",
            "opcode": format!("{:#04x}", opcode),
            "name": ControlOpcode::try_from(opcode)
                .map(|op| format!("{:?}", op))
                .unwrap_or_else(|_| "unknown".to_string()),
        }),
    };

    out["payload"] = json!(hex::encode(&pdu.payload));
    if let Some(segment) = pdu.segment {
        out["segment"] = json!({
            "szmic": segment.szmic,
            "seq_zero": format!("{:#06x}", segment.seq_zero),
            "seq_auth": seq_auth(seq, segment.seq_zero).map(|s| format!("{:#08x}", s)),
            "seg_o": segment.seg_o,
            "seg_n": segment.seg_n,
        });
    }
    out
}

/// Run k2 on a NetKey and k4 on an AppKey
pub fn derive_keys(net_key: Option<&str>, app_key: Option<&str>) -> Result<Value> {
    let crypto = AesCrypto;
    let mut out = json!({});

    if let Some(net_key) = net_key {
        let material = k2(&crypto, &parse_key("net_key", net_key)?, &[0x00]);
        out["network"] = json!({
            "nid": format!("{:#04x}", material.nid),
            "encryption_key": hex::encode(material.encryption_key),
            "privacy_key": hex::encode(material.privacy_key),
        });
    }
    if let Some(app_key) = app_key {
        let aid = k4(&crypto, &parse_key("app_key", app_key)?);
        out["application"] = json!({ "aid": format!("{:#04x}", aid) });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SAMPLE_APP_KEY, SAMPLE_NET_KEY};

    #[test]
    fn test_decode_control_packet() {
        let out = decode_packet(
            &MeshConfig::default(),
            "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df",
        )
        .unwrap();

        assert_eq!(out["net_key_index"], 0);
        assert_eq!(out["network"]["ctl"], true);
        assert_eq!(out["network"]["ttl"], 0);
        assert_eq!(out["network"]["src"], "0x1201");
        assert_eq!(out["network"]["dst"], "0xfffd");
        assert_eq!(out["lower_transport"]["type"], "control");
        assert_eq!(out["lower_transport"]["name"], "FriendRequest");
        assert_eq!(out["lower_transport"]["payload"], "4b50057e400000010000");
        assert!(out.get("access").is_none());
    }

    #[test]
    fn test_decode_access_segment() {
        let out = decode_packet(
            &MeshConfig::default(),
            "68cab5c5348a230afba8c63d4e686364979deaf4fd40961145939cda0e",
        )
        .unwrap();

        assert_eq!(out["network"]["src"], "0x0003");
        assert_eq!(out["network"]["seq"], "0x3129ab");
        let lower = &out["lower_transport"];
        assert_eq!(lower["type"], "access");
        assert_eq!(lower["akf"], false);
        assert_eq!(lower["segment"]["seg_o"], 0);
        assert_eq!(lower["segment"]["seg_n"], 1);
        assert_eq!(lower["segment"]["seq_auth"], "0x3129ab");
    }

    #[test]
    fn test_decode_rejects_unknown_network() {
        let mut config = MeshConfig::default();
        config.network_keys[0].key = Some("00".repeat(16));
        config.application_keys.clear();
        let err = decode_packet(
            &config,
            "68eca487516765b5e5bfdacbaf6cb7fb6bff871f035444ce83a670df",
        );
        assert!(err.is_err());
        assert!(decode_packet(&MeshConfig::default(), "zz").is_err());
    }

    #[test]
    fn test_derive_reference_keys() {
        let out = derive_keys(Some(SAMPLE_NET_KEY), Some(SAMPLE_APP_KEY)).unwrap();
        assert_eq!(out["network"]["nid"], "0x68");
        assert_eq!(out["application"]["aid"], "0x26");

        let out = derive_keys(None, None).unwrap();
        assert_eq!(out, json!({}));
        assert!(derive_keys(Some("abcd"), None).is_err());
    }
}
