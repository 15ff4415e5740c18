//! The owner of one OS socket and its lifecycle.

use std::fmt::{self, Display, Formatter};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::handle::SocketHandle;
use crate::{
    AddressFamily, Classification, ClassificationTable, Error, EventRegistry, Operation,
    PeerAddress, Subscription, Transport,
};

/// Pause after a failed accept, so a persistent condition such as `EMFILE` does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Lifecycle of a [`ConnectionResource`].
///
/// The only transitions are `Idle -> Connected -> Disconnected` and `Idle -> Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// No socket has been opened yet.
    Idle,

    /// The socket is open and usable.
    Connected,

    /// The socket has been released; the resource can not be reused.
    Disconnected,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => f.write_str("idle"),
            Self::Connected => f.write_str("connected"),
            Self::Disconnected => f.write_str("disconnected"),
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: State,
    handle: Option<Arc<SocketHandle>>,
    peer: Option<PeerAddress>,
    local: Option<PeerAddress>,
}

/// Exclusive owner of one OS socket.
///
/// Disconnecting is idempotent: the socket is released and the disconnect listeners are notified
/// exactly once, however many times and from wherever [`ConnectionResource::disconnect`] is called.
#[derive(Debug)]
pub struct ConnectionResource {
    inner: Mutex<Inner>,
    closed: CancellationToken,
    disconnect_events: EventRegistry<()>,
}

impl Default for ConnectionResource {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionResource {
    /// Creates an idle resource.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: State::Idle,
                handle: None,
                peer: None,
                local: None,
            }),
            closed: CancellationToken::new(),
            disconnect_events: EventRegistry::new(),
        }
    }

    #[cfg(test)]
    pub(crate) fn scripted(socket: Arc<crate::handle::scripted::ScriptedSocket>) -> Self {
        let resource = Self::new();
        resource
            .install(SocketHandle::Scripted(socket), None)
            .expect("fresh resource is idle");
        resource
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_idle(&self) -> Result<(), Error> {
        match self.state() {
            State::Idle => Ok(()),
            state => Err(Error::InvalidState(state)),
        }
    }

    /// Takes ownership of an opened socket, unless the resource left `Idle` in the meantime.
    fn install(&self, handle: SocketHandle, peer: Option<PeerAddress>) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != State::Idle {
            // Dropping the handle closes the socket again.
            return Err(Error::InvalidState(inner.state));
        }
        inner.local = handle.local_address();
        inner.peer = peer;
        inner.handle = Some(Arc::new(handle));
        inner.state = State::Connected;
        Ok(())
    }

    /// Opens a client socket towards `address`.
    ///
    /// Stream transports connect; datagram transports bind an ephemeral local socket and remember
    /// `address` as the peer.
    pub async fn connect(&self, transport: Transport, address: &PeerAddress) -> Result<(), Error> {
        self.ensure_idle()?;

        let handle = match transport {
            Transport::Tcp => SocketHandle::connect_stream(address).await,
            Transport::Udp => SocketHandle::bind_ephemeral_datagram(address.family()),
        }
        .map_err(|source| Error::Open {
            address: address.clone(),
            source,
        })?;

        self.install(handle, Some(address.clone()))?;
        tracing::debug!(%transport, %address, "connected");
        Ok(())
    }

    /// Binds a server socket at `address`, returning the bound address.
    ///
    /// The returned address carries the actual port when `address` asked for port `0`.
    pub async fn bind(&self, transport: Transport, address: &PeerAddress) -> Result<PeerAddress, Error> {
        self.ensure_idle()?;

        let handle = match transport {
            Transport::Tcp => SocketHandle::bind_listener(address),
            Transport::Udp => SocketHandle::bind_datagram(address),
        }
        .map_err(|source| Error::Open {
            address: address.clone(),
            source,
        })?;

        self.install(handle, None)?;
        let local = self.local_address().unwrap_or_else(|| address.clone());
        tracing::debug!(%transport, address = %local, "bound");
        Ok(local)
    }

    /// Waits for the next connection on `listener` and takes ownership of it.
    ///
    /// Returns [`Error::InvalidState`] if the listener is not connected or gets disconnected while
    /// waiting.
    pub async fn accept(&self, listener: &ConnectionResource) -> Result<PeerAddress, Error> {
        self.ensure_idle()?;
        let handle = listener
            .handle()
            .ok_or_else(|| Error::InvalidState(listener.state()))?;

        loop {
            let accepted = tokio::select! {
                accepted = handle.accept() => accepted,
                () = listener.closed() => return Err(Error::InvalidState(State::Disconnected)),
            };
            if let Some(peer) = self.accepted(accepted, &handle)? {
                return Ok(peer);
            }

            tokio::select! {
                () = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                () = listener.closed() => return Err(Error::InvalidState(State::Disconnected)),
            }
        }
    }

    /// Takes ownership of a pending connection on `listener`, if there is one.
    pub fn try_accept(&self, listener: &ConnectionResource) -> Result<Option<PeerAddress>, Error> {
        self.ensure_idle()?;
        let handle = listener
            .handle()
            .ok_or_else(|| Error::InvalidState(listener.state()))?;

        match handle.accept().now_or_never() {
            None => Ok(None),
            Some(accepted) => self.accepted(accepted, &handle),
        }
    }

    /// Installs an accepted stream.
    ///
    /// Failed accepts are classified: only unknown errors reach the caller, anything else drops
    /// the pending connection and leaves this resource idle.
    fn accepted(
        &self,
        accepted: io::Result<(SocketHandle, PeerAddress)>,
        listener: &SocketHandle,
    ) -> Result<Option<PeerAddress>, Error> {
        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(error) => {
                return match ClassificationTable::global().classify_io(&error, Operation::Read) {
                    Classification::Unknown => Err(Error::Unknown {
                        operation: Operation::Read,
                        source: error,
                    }),
                    classification => {
                        tracing::debug!(?error, ?classification, listener = listener.kind(), "accept failed");
                        Ok(None)
                    }
                };
            }
        };
        self.install(stream, Some(peer.clone()))?;
        tracing::debug!(listener = listener.kind(), %peer, "accepted connection");
        Ok(Some(peer))
    }

    /// Releases the socket and notifies disconnect listeners.
    ///
    /// Returns `true` for the call that performed the transition, `false` for every later call.
    pub fn disconnect(&self) -> bool {
        let (handle, peer) = {
            let mut inner = self.lock();
            if inner.state == State::Disconnected {
                return false;
            }
            inner.state = State::Disconnected;
            (inner.handle.take(), inner.peer.clone())
        };

        if let Some(handle) = handle {
            handle.shutdown();
        }
        self.closed.cancel();
        self.disconnect_events.emit(());
        tracing::debug!(peer = ?peer.map(|peer| peer.canonical()), "disconnected");
        true
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        self.state() == State::Connected
    }

    /// The remote address given to [`ConnectionResource::connect`] or reported by accept.
    pub fn peer_address(&self) -> Option<PeerAddress> {
        self.lock().peer.clone()
    }

    /// The address the socket is bound to, if it can be addressed.
    pub fn local_address(&self) -> Option<PeerAddress> {
        self.lock().local.clone()
    }

    /// The family of the open socket, if any.
    pub fn family(&self) -> Option<AddressFamily> {
        let inner = self.lock();
        inner
            .peer
            .as_ref()
            .or(inner.local.as_ref())
            .map(PeerAddress::family)
    }

    /// Resolves once the resource has been disconnected.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    /// Attaches a listener called once when the resource disconnects.
    pub fn on_disconnect(&self, listener: impl FnMut(&()) + Send + 'static) -> Subscription<()> {
        self.disconnect_events.subscribe(listener)
    }

    /// The socket, only while connected.
    pub(crate) fn handle(&self) -> Option<Arc<SocketHandle>> {
        let inner = self.lock();
        match inner.state {
            State::Connected => inner.handle.clone(),
            State::Idle | State::Disconnected => None,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use test_case::test_case;

    use super::{ConnectionResource, State};
    use crate::handle::SocketHandle;
    use crate::handle::scripted::ScriptedSocket;
    use crate::{Error, PeerAddress, Transport};

    #[tokio::test]
    async fn disconnect_notifies_once() {
        let listener = ConnectionResource::new();
        let address = listener
            .bind(Transport::Tcp, &"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let client = ConnectionResource::new();
        client.connect(Transport::Tcp, &address).await.unwrap();
        assert_eq!(client.state(), State::Connected);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));
        client.on_disconnect({
            let count = count.clone();
            move |()| {
                count.fetch_add(1, Ordering::SeqCst);
                tx.send(()).unwrap();
            }
        });

        assert!(client.disconnect());
        assert!(!client.disconnect());
        assert!(!client.disconnect());

        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(client.state(), State::Disconnected);
        assert!(client.handle().is_none());
    }

    #[tokio::test]
    async fn disconnected_resource_is_not_resurrected() {
        let resource = ConnectionResource::new();
        resource.disconnect();

        let result = resource
            .bind(Transport::Udp, &"127.0.0.1:0".parse().unwrap())
            .await;
        assert!(matches!(result, Err(Error::InvalidState(State::Disconnected))));
        assert_eq!(resource.state(), State::Disconnected);
    }

    #[tokio::test]
    async fn try_accept_without_pending_connection() {
        let listener = ConnectionResource::new();
        let address = listener
            .bind(Transport::Tcp, &"127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();

        let idle = ConnectionResource::new();
        assert_eq!(idle.try_accept(&listener).unwrap(), None);
        assert_eq!(idle.state(), State::Idle);

        let client = ConnectionResource::new();
        client.connect(Transport::Tcp, &address).await.unwrap();
        let peer = idle.accept(&listener).await.unwrap();
        assert_eq!(idle.state(), State::Connected);
        assert_eq!(Some(peer), client.local_address());
    }

    #[test_case(libc::ECONNABORTED; "aborted before accept")]
    #[test_case(libc::EMFILE; "out of descriptors")]
    #[test_case(libc::EINTR; "interrupted")]
    fn failed_accept_leaves_resource_idle(code: i32) {
        let listener = SocketHandle::Scripted(Arc::new(ScriptedSocket::new()));
        let resource = ConnectionResource::new();

        let accepted = resource.accepted(Err(io::Error::from_raw_os_error(code)), &listener);
        assert_eq!(accepted.unwrap(), None);
        assert_eq!(resource.state(), State::Idle);
    }

    #[test]
    fn unknown_accept_error_is_surfaced() {
        let listener = SocketHandle::Scripted(Arc::new(ScriptedSocket::new()));
        let resource = ConnectionResource::new();

        let accepted = resource.accepted(Err(io::Error::from_raw_os_error(libc::EBADMSG)), &listener);
        assert!(matches!(accepted, Err(Error::Unknown { .. })));
        assert_eq!(resource.state(), State::Idle);
    }

    #[tokio::test]
    async fn unix_listener_removes_socket_file() {
        let directory = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::try_from(directory.path().join("server.sock")).unwrap();

        let listener = ConnectionResource::new();
        listener
            .bind(Transport::Tcp, &PeerAddress::unix(path.clone()))
            .await
            .unwrap();
        assert!(path.exists());

        listener.disconnect();
        assert!(!path.exists());
    }
}
