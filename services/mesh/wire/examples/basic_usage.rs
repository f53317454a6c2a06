//! Basic usage example for the mesh wire formats.

use bytes::Bytes;
use hex_literal::hex;
use mesh_wire::{
    k2, open_network_pdu, seal_network_pdu, AesCrypto, NetworkHeader, PduKind, ReassemblyConfig,
    ReassemblyOutcome, Reassembler, Segmenter,
};
use std::time::Instant;

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Mesh Wire Format Example ===\n");

    let crypto = AesCrypto;
    let iv_index = 0x12345678;

    // 1. Derive the network key material
    println!("1. Deriving network key material...");
    let material = k2(&crypto, &hex!("7dd7364cd842ad18c17c2b820c84c3d6"), &[0x00]);
    println!("   NID: {:#04x}", material.nid);
    println!("   EncryptionKey: {}", to_hex(&material.encryption_key));
    println!("   PrivacyKey: {}", to_hex(&material.privacy_key));

    // 2. Segment a control message
    println!("\n2. Segmenting a 20 byte control message...");
    let kind = PduKind::Control { opcode: 0x0A };
    let seq_auth = 0x000100;
    let params = Bytes::from((0u8..20).collect::<Vec<u8>>());
    let lower_pdus = Segmenter::new().segment(kind, false, seq_auth, params.clone())?;
    println!("   Lower transport PDUs: {}", lower_pdus.len());

    // 3. Seal every segment into a network PDU
    println!("\n3. Sealing network PDUs...");
    let mut packets = Vec::with_capacity(lower_pdus.len());
    for (i, lower) in lower_pdus.iter().enumerate() {
        let header = NetworkHeader::new(true, 5, seq_auth + i as u32, 0x0001, 0x0002);
        let raw = seal_network_pdu(&crypto, &material, iv_index, &header, &lower.encode()?)?;
        println!("   SEQ {:#08x}: {} ({} bytes)", header.seq, to_hex(&raw), raw.len());
        packets.push(raw);
    }

    // 4. Open and reassemble, last segment first
    println!("\n4. Opening and reassembling in reverse order...");
    let mut reassembler = Reassembler::new(ReassemblyConfig::default());
    for raw in packets.iter().rev() {
        let pdu = open_network_pdu(&crypto, &material, iv_index, raw)?;
        let lower = mesh_wire::LowerTransportPdu::decode(pdu.header.ctl, pdu.transport_pdu)?;
        match reassembler.insert(&pdu.header, pdu.iv_index, &lower, Instant::now())? {
            ReassemblyOutcome::Complete(message) => {
                println!("   Reassembled {} bytes", message.payload.len());
                assert_eq!(message.payload, params);
            }
            _ => println!("   Segment stored from {:#06x}", pdu.header.src),
        }
    }

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
