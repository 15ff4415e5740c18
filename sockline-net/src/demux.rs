//! Routing of datagrams from one shared socket to per-peer virtual connections.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{
    Classification, ClassificationTable, ConnectionResource, DatagramConfig, Error, Operation,
    PeerAddress, VirtualUdpConnection,
};

/// What happens to a datagram from a peer without a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewPeerPolicy {
    /// Open a session for the peer.
    #[default]
    Accept,

    /// Drop the datagram.
    Ignore,
}

/// Owns the table of virtual connections on one shared datagram socket.
///
/// Sessions are keyed by the canonical form of the peer address; closed sessions are pruned on the
/// next dispatch.
#[derive(Debug)]
pub struct Demultiplexer {
    shared: Arc<ConnectionResource>,
    config: DatagramConfig,
    policy: NewPeerPolicy,
    sessions: Mutex<BTreeMap<String, Arc<VirtualUdpConnection>>>,
}

impl Demultiplexer {
    /// Creates a demultiplexer for `shared`.
    pub fn new(shared: Arc<ConnectionResource>, config: DatagramConfig, policy: NewPeerPolicy) -> Self {
        Self {
            shared,
            config,
            policy,
            sessions: Mutex::new(BTreeMap::new()),
        }
    }

    fn sessions(&self) -> MutexGuard<'_, BTreeMap<String, Arc<VirtualUdpConnection>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The shared socket.
    pub fn shared(&self) -> &Arc<ConnectionResource> {
        &self.shared
    }

    /// Returns the session for `peer`, opening it if needed.
    pub fn session(&self, peer: &PeerAddress) -> Arc<VirtualUdpConnection> {
        self.sessions()
            .entry(peer.canonical())
            .or_insert_with(|| {
                Arc::new(VirtualUdpConnection::new(&self.shared, peer.clone(), &self.config))
            })
            .clone()
    }

    /// Returns the session for `peer`, if one is open.
    pub fn get(&self, peer: &PeerAddress) -> Option<Arc<VirtualUdpConnection>> {
        self.sessions().get(&peer.canonical()).cloned()
    }

    /// Every open session, ordered by peer address.
    pub fn peers(&self) -> Vec<Arc<VirtualUdpConnection>> {
        self.sessions().values().cloned().collect()
    }

    /// Closes and forgets the session for `peer`.
    pub fn remove(&self, peer: &PeerAddress) -> Option<Arc<VirtualUdpConnection>> {
        let session = self.sessions().remove(&peer.canonical())?;
        session.disconnect();
        Some(session)
    }

    /// Closes every session.
    pub fn clear(&self) {
        let sessions = std::mem::take(&mut *self.sessions());
        for session in sessions.into_values() {
            session.disconnect();
        }
    }

    /// Queues `datagram` on the session of `source`.
    ///
    /// Returns the session if it was opened by this datagram.
    pub fn route(&self, source: &PeerAddress, datagram: Vec<u8>) -> Option<Arc<VirtualUdpConnection>> {
        let mut sessions = self.sessions();
        let key = source.canonical();

        if sessions.get(&key).is_some_and(|session| !session.is_connected()) {
            sessions.remove(&key);
        }

        if let Some(session) = sessions.get(&key) {
            session.add_to_buffer(datagram);
            return None;
        }

        match self.policy {
            NewPeerPolicy::Ignore => {
                tracing::debug!(%source, "dropping datagram from unknown peer");
                None
            }
            NewPeerPolicy::Accept => {
                let session = Arc::new(VirtualUdpConnection::new(
                    &self.shared,
                    source.clone(),
                    &self.config,
                ));
                session.add_to_buffer(datagram);
                sessions.insert(key, session.clone());
                tracing::debug!(%source, "new datagram peer");
                Some(session)
            }
        }
    }

    /// Routes the datagrams already waiting on the shared socket, returning the new sessions.
    ///
    /// A single call takes at most `queue_capacity` datagrams, so a flooded socket cannot keep the
    /// caller busy. Datagrams longer than `max_datagram_size` are dropped.
    pub fn dispatch_pending(&self) -> Result<Vec<Arc<VirtualUdpConnection>>, Error> {
        let mut opened = Vec::new();
        // One spare byte tells an oversized datagram apart from one that fits exactly.
        let mut buffer = vec![0; self.config.max_datagram_size.saturating_add(1)];

        for _ in 0..self.config.queue_capacity.max(1) {
            let Some(handle) = self.shared.handle() else {
                break;
            };
            let received = handle.try_recv_from(&mut buffer);
            drop(handle);

            match received {
                Ok((length, source)) if length > self.config.max_datagram_size => {
                    tracing::warn!(
                        source = ?source,
                        max_datagram_size = self.config.max_datagram_size,
                        "dropping oversized datagram",
                    );
                }
                Ok((length, Some(source))) => {
                    opened.extend(self.route(&source, buffer[..length].to_vec()));
                }
                Ok((length, None)) => {
                    tracing::warn!(length, "dropping datagram from an unaddressable peer");
                }
                Err(error) => match ClassificationTable::global().classify_io(&error, Operation::Read) {
                    Classification::None | Classification::Retry => break,
                    Classification::Skip => {}
                    Classification::Fatal => {
                        self.shared.disconnect();
                        break;
                    }
                    Classification::Unknown => {
                        return Err(Error::Unknown {
                            operation: Operation::Read,
                            source: error,
                        });
                    }
                },
            }
        }

        self.prune();
        Ok(opened)
    }

    /// Waits until the shared socket is readable, then routes what arrived.
    ///
    /// Returns an empty list once the shared socket is disconnected.
    pub async fn dispatch(&self) -> Result<Vec<Arc<VirtualUdpConnection>>, Error> {
        let Some(handle) = self.shared.handle() else {
            return Ok(Vec::new());
        };
        tokio::select! {
            readable = handle.readable() => readable.map_err(|source| Error::Unknown {
                operation: Operation::Read,
                source,
            })?,
            () = self.shared.closed() => return Ok(Vec::new()),
        }
        drop(handle);
        self.dispatch_pending()
    }

    fn prune(&self) {
        self.sessions().retain(|_, session| session.is_connected());
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::{Demultiplexer, NewPeerPolicy};
    use crate::handle::scripted::ScriptedSocket;
    use crate::{ConnectionResource, DatagramConfig, PeerAddress};

    fn scripted_demux(policy: NewPeerPolicy) -> Demultiplexer {
        let shared = Arc::new(ConnectionResource::scripted(Arc::new(ScriptedSocket::new())));
        Demultiplexer::new(shared, DatagramConfig::default(), policy)
    }

    fn receiving_demux(socket: ScriptedSocket, config: DatagramConfig) -> Demultiplexer {
        let shared = Arc::new(ConnectionResource::scripted(Arc::new(socket)));
        Demultiplexer::new(shared, config, NewPeerPolicy::Accept)
    }

    #[test]
    fn oversized_datagrams_are_dropped() {
        let peer: PeerAddress = "10.0.0.1:4000".parse().unwrap();
        let socket = ScriptedSocket::new()
            .datagram(peer.clone(), b"hello")
            .datagram(peer.clone(), b"hey")
            .datagram(peer.clone(), b"four");
        let demux = receiving_demux(
            socket,
            DatagramConfig {
                max_datagram_size: 4,
                ..DatagramConfig::default()
            },
        );

        let opened = demux.dispatch_pending().unwrap();
        assert_eq!(opened.len(), 1);
        assert_eq!(opened[0].read(), Some(b"hey".to_vec()));
        assert_eq!(opened[0].read(), Some(b"four".to_vec()));
        assert_eq!(opened[0].read(), None);
    }

    #[test]
    fn one_dispatch_takes_at_most_a_queue_of_datagrams() {
        let mut socket = ScriptedSocket::new();
        for host in 1..=3 {
            socket = socket.datagram(format!("10.0.0.{host}:4000").parse().unwrap(), b"x");
        }
        let demux = receiving_demux(
            socket,
            DatagramConfig {
                queue_capacity: 2,
                ..DatagramConfig::default()
            },
        );

        assert_eq!(demux.dispatch_pending().unwrap().len(), 2);
        assert_eq!(demux.dispatch_pending().unwrap().len(), 1);
        assert_eq!(demux.dispatch_pending().unwrap().len(), 0);
        assert_eq!(demux.peers().len(), 3);
    }

    #[test]
    fn datagrams_are_routed_by_source() {
        let demux = scripted_demux(NewPeerPolicy::Accept);
        let a: PeerAddress = "10.0.0.1:4000".parse().unwrap();
        let b: PeerAddress = "10.0.0.2:4000".parse().unwrap();

        let opened_a = demux.route(&a, b"a1".to_vec()).unwrap();
        let opened_b = demux.route(&b, b"b1".to_vec()).unwrap();
        assert!(demux.route(&a, b"a2".to_vec()).is_none());

        assert_eq!(opened_a.peer_address(), &a);
        assert_eq!(opened_a.read(), Some(b"a1".to_vec()));
        assert_eq!(opened_a.read(), Some(b"a2".to_vec()));
        assert_eq!(opened_a.read(), None);
        assert_eq!(opened_b.read(), Some(b"b1".to_vec()));
        assert_eq!(opened_b.read(), None);
        assert_eq!(demux.peers().len(), 2);
    }

    #[test]
    fn unknown_peers_can_be_ignored() {
        let demux = scripted_demux(NewPeerPolicy::Ignore);
        let known: PeerAddress = "10.0.0.1:4000".parse().unwrap();
        let session = demux.session(&known);

        assert!(demux.route(&"10.0.0.9:4000".parse().unwrap(), b"x".to_vec()).is_none());
        assert!(demux.route(&known, b"y".to_vec()).is_none());
        assert_eq!(demux.peers().len(), 1);
        assert_eq!(session.read(), Some(b"y".to_vec()));
    }

    #[test]
    fn closed_session_is_replaced() {
        let demux = scripted_demux(NewPeerPolicy::Accept);
        let peer: PeerAddress = "/tmp/peer.sock".parse().unwrap();

        let first = demux.route(&peer, b"one".to_vec()).unwrap();
        first.disconnect();

        let second = demux.route(&peer, b"two".to_vec()).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.read(), Some(b"two".to_vec()));
    }

    #[test]
    fn remove_closes_session() {
        let demux = scripted_demux(NewPeerPolicy::Accept);
        let peer: PeerAddress = "10.0.0.1:4000".parse().unwrap();
        let session = demux.route(&peer, b"x".to_vec()).unwrap();

        assert!(demux.remove(&peer).is_some());
        assert!(!session.is_connected());
        assert!(demux.get(&peer).is_none());
    }
}
