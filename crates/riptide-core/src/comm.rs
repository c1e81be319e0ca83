//! Point-to-point message passing
//!
//! Multi-process sync exchanges byte payloads under a rank/size model
//! with integer tags: tag 0 carries element counts, tags `1..=F` carry
//! field payloads in declaration order. The [`Communicator`] trait is
//! the seam; [`LocalCluster`] provides the in-process reference
//! implementation used by tests (mutex + condvar mailboxes).

use crate::error::{Error, Result};
use crate::scalar::{ElemKind, VarType};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Tag carrying the element count of an exchange
pub const COUNT_TAG: u32 = 0;

/// Rank/size point-to-point messaging
pub trait Communicator: Send + Sync {
    /// This process's rank
    fn rank(&self) -> u32;

    /// Number of processes
    fn size(&self) -> u32;

    /// Send a payload to a peer; non-blocking (buffered)
    fn send(&self, peer: u32, tag: u32, payload: Vec<u8>) -> Result<()>;

    /// Receive the next payload with a matching (peer, tag); blocking
    fn recv(&self, peer: u32, tag: u32) -> Result<Vec<u8>>;
}

/// Wire descriptor of a field type
///
/// Scalars map to their wire kind with multiplier 1; vector forms
/// multiply by their component count (the platform default included).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireType {
    /// Per-component wire kind
    pub kind: ElemKind,
    /// Component multiplier applied to element counts
    pub multiplier: usize,
}

/// Resolve the wire descriptor of a variable type
///
/// Fails with `BadType` when the type has no descriptor entry.
pub fn wire_type(ty: VarType) -> Result<WireType> {
    if ty.components == 0 || ty.components > 4 {
        return Err(Error::BadType(ty.designator()));
    }
    Ok(WireType {
        kind: ty.kind,
        multiplier: ty.components,
    })
}

struct Mailbox {
    messages: Mutex<Vec<(u32, u32, Vec<u8>)>>,
    arrived: Condvar,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        }
    }
}

/// In-process cluster of communicators
///
/// Every rank gets a mailbox; `recv` blocks until a message with the
/// requested source and tag arrives, preserving FIFO order per
/// (source, tag) pair.
pub struct LocalCluster {
    mailboxes: Arc<Vec<Mailbox>>,
}

impl LocalCluster {
    /// Build the communicators of an in-process cluster
    pub fn communicators(size: u32) -> Vec<LocalCommunicator> {
        let mailboxes = Arc::new((0..size).map(|_| Mailbox::new()).collect::<Vec<_>>());
        (0..size)
            .map(|rank| LocalCommunicator {
                rank,
                size,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }
}

/// One rank of a [`LocalCluster`]
pub struct LocalCommunicator {
    rank: u32,
    size: u32,
    mailboxes: Arc<Vec<Mailbox>>,
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> u32 {
        self.rank
    }

    fn size(&self) -> u32 {
        self.size
    }

    fn send(&self, peer: u32, tag: u32, payload: Vec<u8>) -> Result<()> {
        let mailbox = self
            .mailboxes
            .get(peer as usize)
            .ok_or_else(|| Error::Communication(format!("no such peer: {peer}")))?;
        mailbox.messages.lock().push((self.rank, tag, payload));
        mailbox.arrived.notify_all();
        Ok(())
    }

    fn recv(&self, peer: u32, tag: u32) -> Result<Vec<u8>> {
        let mailbox = &self.mailboxes[self.rank as usize];
        let mut messages = mailbox.messages.lock();
        loop {
            if let Some(index) = messages.iter().position(|(src, t, _)| *src == peer && *t == tag) {
                return Ok(messages.remove(index).2);
            }
            mailbox.arrived.wait(&mut messages);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_type_multipliers() {
        let scalar = VarType::parse("unsigned int*", 2).unwrap();
        assert_eq!(wire_type(scalar).unwrap().multiplier, 1);

        let vec2 = VarType::parse("vec*", 2).unwrap();
        assert_eq!(wire_type(vec2).unwrap(), WireType { kind: ElemKind::Float, multiplier: 2 });

        let vec3d = VarType::parse("vec*", 3).unwrap();
        assert_eq!(wire_type(vec3d).unwrap().multiplier, 4);
    }

    #[test]
    fn test_local_cluster_routes_by_peer_and_tag() {
        let comms = LocalCluster::communicators(2);
        let (a, b) = (&comms[0], &comms[1]);
        assert_eq!(a.rank(), 0);
        assert_eq!(b.size(), 2);

        a.send(1, 3, vec![3]).unwrap();
        a.send(1, 0, vec![0]).unwrap();
        // Tag selection ignores arrival order.
        assert_eq!(b.recv(0, 0).unwrap(), vec![0]);
        assert_eq!(b.recv(0, 3).unwrap(), vec![3]);
    }

    #[test]
    fn test_recv_blocks_until_send() {
        let mut comms = LocalCluster::communicators(2);
        let b = comms.pop().unwrap();
        let a = comms.pop().unwrap();

        let receiver = std::thread::spawn(move || b.recv(0, 1).unwrap());
        std::thread::sleep(std::time::Duration::from_millis(10));
        a.send(1, 1, vec![42]).unwrap();
        assert_eq!(receiver.join().unwrap(), vec![42]);
    }

    #[test]
    fn test_send_to_missing_peer_fails() {
        let comms = LocalCluster::communicators(1);
        assert!(matches!(comms[0].send(5, 0, vec![]), Err(Error::Communication(_))));
    }
}
