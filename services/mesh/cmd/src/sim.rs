//! In-memory broadcast medium running several mesh stacks in one process.
//!
//! Every node's bearer posts its signals onto one shared channel. The event
//! loop drains that channel one signal at a time: a ready request is answered
//! with `ReadyToSend`, a transmitted packet is delivered to every other node
//! and then completed back to its sender. Nothing runs concurrently with a
//! stack call, matching the single-threaded model the stack expects.

use crate::config::{MeshConfig, ScriptStep};
use crate::{component_debug, component_info, component_warn};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use mesh_storage::ReplayCacheMode;
use mesh_transport::{
    Bearer, BearerEvent, MeshStack, MessageId, SendJob, TransportHandler, UnsegmentedMessage,
    UpperTransportPdu,
};
use mesh_wire::{Address, AesCrypto, PduKind};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// How often partial reassemblies are checked for expiry
pub const TIMEOUT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Signal posted by a node's bearer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AirSignal {
    /// Node asked for a send slot
    Ready(usize),
    /// Node put a packet on the air
    Transmitted(usize, Bytes),
}

/// Bearer half handed to each stack
pub struct SimBearer {
    node: usize,
    air: mpsc::UnboundedSender<AirSignal>,
    outstanding: Arc<AtomicUsize>,
}

impl SimBearer {
    fn post(&self, signal: AirSignal) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        if self.air.send(signal).is_err() {
            self.outstanding.fetch_sub(1, Ordering::SeqCst);
            component_warn!("sim", node = self.node, "air closed, signal lost");
        }
    }
}

impl Bearer for SimBearer {
    fn request_send_ready(&mut self) {
        self.post(AirSignal::Ready(self.node));
    }

    fn transmit(&mut self, packet: &[u8]) {
        self.post(AirSignal::Transmitted(self.node, Bytes::copy_from_slice(packet)));
    }
}

/// Something a node's handler observed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delivery {
    /// Decrypted access message
    Access {
        /// Source address
        src: Address,
        /// Destination address
        dst: Address,
        /// Key that authenticated it
        key: String,
        /// SEQ of the first segment
        seq_auth: u32,
        /// Plaintext, hex
        payload: String,
    },
    /// Reassembled control message
    Control {
        /// Source address
        src: Address,
        /// Destination address
        dst: Address,
        /// Control opcode
        opcode: u8,
        /// Parameters, hex
        params: String,
    },
    /// Unsegmented PDU surfaced raw
    Unsegmented {
        /// Source address
        src: Address,
        /// Destination address
        dst: Address,
        /// TTL
        ttl: u8,
        /// Control opcode, if a control PDU
        opcode: Option<u8>,
        /// Lower transport payload, hex
        payload: String,
    },
    /// Access message no key authenticated
    AuthenticationFailed {
        /// Source address
        src: Address,
        /// SEQ of the first segment
        seq_auth: u32,
    },
}

/// Handler that logs and records deliveries
pub struct NodeHandler {
    name: String,
    deliveries: Vec<Delivery>,
    sent: usize,
}

impl NodeHandler {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            deliveries: Vec::new(),
            sent: 0,
        }
    }

    /// Everything delivered so far
    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }
}

impl TransportHandler for NodeHandler {
    fn network_pdu_sent(&mut self, job: &SendJob) {
        self.sent += 1;
        component_debug!(
            "sim",
            node = %self.name,
            message_id = job.message_id,
            seq = job.header.seq,
            "packet sent"
        );
    }

    fn unsegmented_message(&mut self, message: UnsegmentedMessage) {
        let opcode = match message.pdu.kind {
            PduKind::Control { opcode } => Some(opcode),
            PduKind::Access { .. } => None,
        };
        component_info!(
            "sim",
            node = %self.name,
            src = message.header.src,
            dst = message.header.dst,
            "unsegmented pdu {}",
            hex::encode(&message.pdu.payload)
        );
        self.deliveries.push(Delivery::Unsegmented {
            src: message.header.src,
            dst: message.header.dst,
            ttl: message.header.ttl,
            opcode,
            payload: hex::encode(&message.pdu.payload),
        });
    }

    fn upper_transport_pdu(&mut self, pdu: UpperTransportPdu) {
        let delivery = match pdu {
            UpperTransportPdu::Access(message) => Delivery::Access {
                src: message.src,
                dst: message.dst,
                key: message.key.to_string(),
                seq_auth: message.seq_auth,
                payload: hex::encode(&message.payload),
            },
            UpperTransportPdu::Control(message) => Delivery::Control {
                src: message.src,
                dst: message.dst,
                opcode: message.opcode,
                params: hex::encode(&message.params),
            },
        };
        component_info!("sim", node = %self.name, "delivered {:?}", delivery);
        self.deliveries.push(delivery);
    }

    fn authentication_failed(&mut self, src: Address, seq_auth: u32) {
        component_warn!("sim", node = %self.name, src, seq_auth, "authentication failed");
        self.deliveries
            .push(Delivery::AuthenticationFailed { src, seq_auth });
    }

    fn sequence_overflow(&mut self, overflow: &mesh_transport::SequenceOverflow) {
        component_warn!("sim", node = %self.name, "{}", overflow);
    }
}

/// One simulated node
pub struct SimNode {
    /// Node name
    pub name: String,
    /// Unicast address
    pub address: Address,
    /// The node's stack
    pub stack: MeshStack<SimBearer, NodeHandler>,
}

/// Several nodes sharing one broadcast medium
pub struct Simulation {
    nodes: Vec<SimNode>,
    air_rx: mpsc::UnboundedReceiver<AirSignal>,
    outstanding: Arc<AtomicUsize>,
    air_log: Vec<(String, Bytes)>,
}

impl Simulation {
    /// Build one stack per configured node
    pub fn new(config: &MeshConfig) -> Result<Self> {
        let (air_tx, air_rx) = mpsc::unbounded_channel();
        let outstanding = Arc::new(AtomicUsize::new(0));
        let transport = config.transport_config()?;

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (index, node) in config.nodes.iter().enumerate() {
            let mut node_transport = transport.clone();
            if let ReplayCacheMode::File { path, .. } = &mut node_transport.replay_cache {
                let file_name = path
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "replay.json".to_string());
                *path = path.with_file_name(format!("{}-{}", node.name, file_name));
            }

            let bearer = SimBearer {
                node: index,
                air: air_tx.clone(),
                outstanding: outstanding.clone(),
            };
            let stack = MeshStack::new(
                node_transport,
                config.key_store(&AesCrypto)?,
                Box::new(AesCrypto),
                bearer,
                NodeHandler::new(&node.name),
            )
            .with_context(|| format!("cannot create node {}", node.name))?;

            component_info!("sim", node = %node.name, address = node.address, "node up");
            nodes.push(SimNode {
                name: node.name.clone(),
                address: node.address,
                stack,
            });
        }

        Ok(Self {
            nodes,
            air_rx,
            outstanding,
            air_log: Vec::new(),
        })
    }

    /// Simulated nodes
    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Every packet put on the air, with its sender
    pub fn air_log(&self) -> &[(String, Bytes)] {
        &self.air_log
    }

    /// Queue one scripted message on its sender
    pub fn queue_step(&mut self, step: &ScriptStep) -> Result<MessageId> {
        let name = step.sender();
        let node = self
            .nodes
            .iter_mut()
            .find(|n| n.name == name)
            .ok_or_else(|| anyhow!("unknown node {}", name))?;
        let src = node.address;

        let id = match step {
            ScriptStep::Access {
                dst,
                net_key_index,
                key,
                ttl,
                payload,
                szmic,
                seq,
                ..
            } => {
                let payload = hex::decode(payload).context("access payload is not hex")?;
                if let Some(seq) = seq {
                    node.stack.set_seq(*seq);
                }
                node.stack
                    .access_send(*net_key_index, *key, *ttl, src, *dst, &payload, *szmic)?
            }
            ScriptStep::Control {
                dst,
                net_key_index,
                ttl,
                opcode,
                params,
                seq,
                ..
            } => {
                let params = hex::decode(params).context("control params are not hex")?;
                if let Some(seq) = seq {
                    node.stack.set_seq(*seq);
                }
                node.stack
                    .control_send(*net_key_index, *ttl, src, *dst, *opcode, &params)?
            }
        };

        component_info!("sim", node = %name, message_id = id, "message queued");
        Ok(id)
    }

    /// Process one signal from the air
    pub fn dispatch(&mut self, signal: AirSignal, now: Instant) {
        match signal {
            AirSignal::Ready(node) => {
                if let Some(sender) = self.nodes.get_mut(node) {
                    sender.stack.handle_bearer_event(BearerEvent::ReadyToSend, now);
                }
            }
            AirSignal::Transmitted(from, packet) => {
                let Some(sender) = self.nodes.get(from) else {
                    return;
                };
                component_debug!(
                    "sim",
                    node = %sender.name,
                    len = packet.len(),
                    "on air {}",
                    hex::encode(&packet)
                );
                self.air_log.push((sender.name.clone(), packet.clone()));

                for (index, node) in self.nodes.iter_mut().enumerate() {
                    if index != from {
                        node.stack
                            .handle_bearer_event(BearerEvent::Received(packet.clone()), now);
                    }
                }
                self.nodes[from]
                    .stack
                    .handle_bearer_event(BearerEvent::TransmitComplete, now);
            }
        }
    }

    /// True when no bearer signal is pending
    pub fn is_quiet(&self) -> bool {
        self.outstanding.load(Ordering::SeqCst) == 0
    }

    /// Expire stale reassemblies on every node
    pub fn poll_timeouts(&mut self, now: Instant) {
        for node in &mut self.nodes {
            node.stack.poll_timeouts(now);
        }
    }

    /// Queue the script and run until the air is quiet, the time limit passes
    /// or the process is interrupted
    pub async fn run(&mut self, script: &[ScriptStep], limit: Duration) -> Result<()> {
        for step in script {
            self.queue_step(step)?;
        }

        let mut timeouts = tokio::time::interval(TIMEOUT_POLL_INTERVAL);
        let deadline = tokio::time::sleep(limit);
        tokio::pin!(deadline);

        while !self.is_quiet() {
            tokio::select! {
                Some(signal) = self.air_rx.recv() => {
                    self.outstanding.fetch_sub(1, Ordering::SeqCst);
                    self.dispatch(signal, Instant::now());
                }
                _ = timeouts.tick() => self.poll_timeouts(Instant::now()),
                _ = &mut deadline => {
                    component_warn!("sim", "time limit of {:?} reached", limit);
                    break;
                }
                _ = tokio::signal::ctrl_c() => {
                    component_info!("sim", "interrupted");
                    break;
                }
            }
        }

        for node in &mut self.nodes {
            node.stack
                .snapshot_replay_cache()
                .with_context(|| format!("cannot snapshot replay cache of {}", node.name))?;
        }
        Ok(())
    }

    /// Per-node stats and deliveries
    pub fn report(&self) -> serde_json::Value {
        let nodes: serde_json::Map<String, serde_json::Value> = self
            .nodes
            .iter()
            .map(|node| {
                (
                    node.name.clone(),
                    serde_json::json!({
                        "address": format!("{:#06x}", node.address),
                        "seq": node.stack.seq(),
                        "sent": node.stack.handler().sent,
                        "stats": node.stack.stats(),
                        "deliveries": node.stack.handler().deliveries(),
                    }),
                )
            })
            .collect();
        serde_json::Value::Object(nodes)
    }
}
