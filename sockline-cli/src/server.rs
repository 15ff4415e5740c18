//! The `server` subcommand: an echo server with keep-alive.

use std::time::Duration;

use eyre::WrapErr;
use sockline_net::{ConnectionFactory, Peer, PeerAddress, PingCapable, Server};
use sockline_protocol::KeepAlive;
use tokio::signal::unix::{SignalKind, signal};
use tokio::time::{Instant, MissedTickBehavior};

/// Polling cadence of the accept and read loop.
const TICK: Duration = Duration::from_millis(10);

fn label(peer: &Peer) -> String {
    peer.address()
        .map_or_else(|| "<unnamed>".to_owned(), |address| address.to_string())
}

/// Binds `address` and serves peers until SIGINT or SIGTERM.
#[tracing::instrument(skip(factory), fields(transport = %factory.config().transport))]
pub(crate) async fn run(
    factory: ConnectionFactory,
    address: PeerAddress,
    ping_interval: Duration,
) -> eyre::Result<()> {
    let server = factory.make_server();
    let bound = server
        .bind(&address)
        .await
        .wrap_err_with(|| format!("failed to bind {address}"))?;
    tracing::info!(%bound, "listening");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    let mut tick = tokio::time::interval(TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pings = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    pings.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut peers = Vec::new();
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = pings.tick() => ping(&peers).await,
            _ = tick.tick() => serve(&server, &mut peers).await?,
        }
    }

    server.disconnect();
    Ok(())
}

/// One tick: takes in new peers, then reads from and answers every peer.
async fn serve(server: &Server, peers: &mut Vec<KeepAlive<Peer>>) -> eyre::Result<()> {
    for peer in server.listen().wrap_err("failed to accept peers")? {
        let name = label(&peer);
        tracing::info!(peer = %name, "peer connected");

        let on_disconnect = name.clone();
        peer.on_disconnect(move |_| tracing::info!(peer = %on_disconnect, "peer disconnected"));

        let peer = KeepAlive::new(peer);
        peer.pong(move |packet| tracing::debug!(peer = %name, %packet, "pong"));
        peers.push(peer);
    }

    for peer in peers.iter() {
        answer(peer).await;
    }

    peers.retain(|peer| peer.provider().is_connected());
    Ok(())
}

/// Echoes every message `peer` has pending, returning how many were handled.
///
/// A datagram peer is polled until its queue is empty, a stream peer once per tick.
async fn answer(peer: &KeepAlive<Peer>) -> usize {
    let name = label(peer.provider());
    let mut answered = 0;
    loop {
        match peer.poll().await {
            Ok(messages) => {
                for message in messages {
                    tracing::info!(peer = %name, %message, "message");
                    match peer.send_message(&message).await {
                        Ok(true) => {}
                        Ok(false) => tracing::warn!(peer = %name, "echo was not sent"),
                        Err(error) => tracing::warn!(peer = %name, ?error, "echo failed"),
                    }
                    answered += 1;
                }
            }
            Err(error) => {
                tracing::warn!(peer = %name, ?error, "read failed, dropping peer");
                peer.provider().disconnect();
                return answered;
            }
        }

        match peer.provider() {
            Peer::Datagram(session) if session.buffer_len() > 0 => {}
            _ => return answered,
        }
    }
}

/// Pings every peer, dropping the ones with a ping still unanswered.
async fn ping(peers: &[KeepAlive<Peer>]) {
    for peer in peers {
        let name = label(peer.provider());
        if let Some(missed) = peer.outstanding().first() {
            tracing::warn!(peer = %name, %missed, "no pong received, dropping peer");
            peer.provider().disconnect();
            continue;
        }

        let packet = peer.next_packet();
        match peer.ping(packet).await {
            Ok(true) => tracing::debug!(peer = %name, %packet, "ping"),
            Ok(false) => tracing::warn!(peer = %name, %packet, "ping was not sent"),
            Err(error) => tracing::warn!(peer = %name, ?error, "ping failed"),
        }
    }
}
