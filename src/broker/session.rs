use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::broker::job::JobId;
use crate::protocol::packet::Packet;

pub type ConnId = u64;

/// An item on a connection's outbound FIFO, consumed by its writer task.
#[derive(Debug)]
pub enum Outbound {
    Packet(Packet),
    /// Pre-formatted administrative text.
    Raw(Bytes),
    /// Close the connection once everything queued before this has flushed.
    Shutdown,
}

/// A declared worker capability, in CAN_DO order. The timeout is stored for
/// the worker's own use; the broker does not enforce it.
#[derive(Debug, Clone)]
pub struct Capability {
    pub function: Bytes,
    pub timeout: u32,
}

/// Per-connection state. A connection may act as a client, a worker, or
/// both; the two axes live side by side here.
#[derive(Debug)]
pub struct Session {
    pub id: ConnId,
    pub peer: SocketAddr,
    pub client_id: String,
    /// Negotiated via OPTION_REQ: receive WORK_EXCEPTION frames.
    pub exceptions: bool,
    pub sleeping: bool,
    /// A NOOP is already on the outbound FIFO; suppresses redundant wakes
    /// until the next grab.
    pub noop_queued: bool,
    /// Worker capabilities in declaration order; grabs walk this list.
    pub capabilities: Vec<Capability>,
    /// Jobs this connection submitted in the foreground.
    pub client_jobs: Vec<JobId>,
    /// Jobs currently assigned to this connection as a worker.
    pub running: Vec<JobId>,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl Session {
    pub fn new(id: ConnId, peer: SocketAddr, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            peer,
            client_id: "-".to_string(),
            exceptions: false,
            sleeping: false,
            noop_queued: false,
            capabilities: Vec::new(),
            client_jobs: Vec::new(),
            running: Vec::new(),
            sender,
        }
    }

    /// Queue an outbound item. A send failure means the writer is already
    /// gone and the connection is tearing down; the item is dropped.
    pub fn send(&self, item: Outbound) {
        let _ = self.sender.send(item);
    }

    pub fn send_packet(&self, packet: Packet) {
        self.send(Outbound::Packet(packet));
    }
}
