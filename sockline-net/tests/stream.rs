#![expect(missing_docs, reason = "test")]

use std::time::Duration;

use pretty_assertions::assert_eq;
use sockline_net::{
    AddressFamily, Client, ConnectionFactory, Error, FactoryConfig, Peer, PeerAddress, Readable,
    Sendable, Server, Transport,
};
use test_case::test_case;
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(10);
const TICK: Duration = Duration::from_millis(5);

fn factory(family: AddressFamily) -> ConnectionFactory {
    ConnectionFactory::new(FactoryConfig::new(Transport::Tcp, family)).unwrap()
}

async fn accept_one(server: &Server) -> Peer {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let Some(peer) = server.listen().unwrap().pop() {
                return peer;
            }
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .unwrap()
}

async fn connected(factory: &ConnectionFactory, address: &PeerAddress) -> (Server, Client, Peer) {
    let server = factory.make_server();
    let bound = server.bind(address).await.unwrap();

    let client = factory.make_client();
    client.connect(&bound).await.unwrap();
    let peer = accept_one(&server).await;
    (server, client, peer)
}

fn payload(length: usize) -> Vec<u8> {
    (0..length).map(|index| (index % 251) as u8).collect()
}

async fn echo_exact(client: Client, peer: Peer, length: usize) {
    let Client::Stream(client) = client else {
        panic!("stream factory built a datagram client");
    };
    let Peer::Stream(peer) = peer else {
        panic!("stream server produced a datagram peer");
    };
    let expected = payload(length);

    let sender = tokio::spawn({
        let expected = expected.clone();
        async move {
            assert!(client.send(&expected).await.unwrap());
            let echoed = client.read(length, true).await.unwrap();
            (client, echoed)
        }
    });

    let received = tokio::time::timeout(TIMEOUT, peer.read(length, true))
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(received.len(), length);
    assert!(peer.send(&received).await.unwrap());

    let (_client, echoed) = tokio::time::timeout(TIMEOUT, sender).await.unwrap().unwrap();
    assert_eq!(echoed.as_deref(), Some(expected.as_slice()));
}

#[test_case(1; "single byte")]
#[test_case(4096; "one page")]
#[test_case(1 << 20; "one mebibyte")]
#[tokio::test(flavor = "multi_thread")]
async fn tcp_exact_read_round_trip(length: usize) {
    let factory = factory(AddressFamily::Ipv4);
    let (_server, client, peer) = connected(&factory, &"127.0.0.1:0".parse().unwrap()).await;
    echo_exact(client, peer, length).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unix_exact_read_round_trip() {
    let directory = tempfile::tempdir().unwrap();
    let path = camino::Utf8PathBuf::try_from(directory.path().join("stream.sock")).unwrap();

    let factory = factory(AddressFamily::Unix);
    let (_server, client, peer) = connected(&factory, &PeerAddress::unix(path)).await;
    echo_exact(client, peer, 65536).await;
}

#[tokio::test]
async fn read_then_disconnect_fire_once() {
    let factory = factory(AddressFamily::Ipv4);
    let (server, client, peer) = connected(&factory, &"127.0.0.1:0".parse().unwrap()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    peer.on_read({
        let tx = tx.clone();
        move |data| {
            tx.send(format!("read:{}", String::from_utf8_lossy(data)))
                .unwrap();
        }
    });
    peer.on_disconnect(move |()| tx.send("disconnect".to_owned()).unwrap());

    assert!(client.send(b"PING").await.unwrap());
    let first = tokio::time::timeout(TIMEOUT, async {
        loop {
            server.read().await.unwrap();
            if let Ok(event) = rx.try_recv() {
                return event;
            }
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(first, "read:PING");

    assert!(client.disconnect());
    let second = tokio::time::timeout(TIMEOUT, async {
        loop {
            server.read().await.unwrap();
            if let Ok(event) = rx.try_recv() {
                return event;
            }
            tokio::time::sleep(TICK).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(second, "disconnect");

    for _ in 0..3 {
        server.read().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert!(server.peers().is_empty());
    assert!(!peer.is_connected());
}

#[tokio::test]
async fn no_io_after_disconnect() {
    let factory = factory(AddressFamily::Ipv4);
    let (_server, client, _peer) = connected(&factory, &"127.0.0.1:0".parse().unwrap()).await;

    assert!(client.disconnect());
    assert!(!client.disconnect());
    assert!(!client.send(b"late").await.unwrap());
    assert_eq!(client.receive().await.unwrap(), None);
}

#[tokio::test]
async fn connect_failures() {
    let factory = factory(AddressFamily::Ipv4);

    // Bind and release a port so nothing listens on it.
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = PeerAddress::try_from(probe.local_addr().unwrap()).unwrap();
    drop(probe);

    let client = factory.make_client();
    assert!(matches!(
        client.connect(&address).await,
        Err(Error::Open { .. })
    ));

    let client = factory.make_client();
    assert!(matches!(
        client.connect(&PeerAddress::unix("/tmp/nothing.sock")).await,
        Err(Error::AddressFamilyMismatch { .. })
    ));
}
