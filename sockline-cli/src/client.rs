//! The `client` subcommand: sends messages and pings, then waits for the answers.

use std::time::Duration;

use eyre::WrapErr;
use sockline_net::{ConnectionFactory, PeerAddress, PingCapable};
use sockline_protocol::KeepAlive;

/// Connects to `address`, sends `messages` and `pings` pings, and logs replies until every answer
/// arrived or `wait` elapsed.
#[tracing::instrument(skip(factory, messages), fields(transport = %factory.config().transport))]
pub(crate) async fn run(
    factory: ConnectionFactory,
    address: PeerAddress,
    messages: Vec<String>,
    pings: usize,
    wait: Duration,
) -> eyre::Result<()> {
    let client = KeepAlive::new(factory.make_client());
    client
        .provider()
        .connect(&address)
        .await
        .wrap_err_with(|| format!("failed to connect to {address}"))?;
    tracing::info!(local = ?client.provider().local_address(), "connected");

    let (pong_tx, mut pong_rx) = tokio::sync::mpsc::unbounded_channel();
    client.pong(move |packet| {
        // The receiver is gone once the wait below is over.
        let _ = pong_tx.send(*packet);
    });

    for message in &messages {
        if !client.send_message(message).await? {
            eyre::bail!("failed to send {message:?}");
        }
    }
    for _ in 0..pings {
        let packet = client.next_packet();
        if !client.ping(packet).await? {
            eyre::bail!("failed to send ping {packet}");
        }
        tracing::debug!(%packet, "ping");
    }

    let deadline = tokio::time::sleep(wait);
    tokio::pin!(deadline);

    let (mut replies, mut pongs) = (0, 0);
    while replies < messages.len() || pongs < pings {
        if !client.provider().is_connected() {
            tracing::warn!("server closed the connection");
            break;
        }

        tokio::select! {
            () = &mut deadline => {
                tracing::warn!(
                    missing_replies = messages.len().saturating_sub(replies),
                    outstanding = ?client.outstanding(),
                    "timed out waiting for answers",
                );
                break;
            }
            Some(packet) = pong_rx.recv() => {
                tracing::info!(%packet, "pong");
                pongs += 1;
            }
            readable = client.provider().readable() => {
                readable?;
                for reply in client.poll().await? {
                    tracing::info!(%reply, "reply");
                    replies += 1;
                }
            }
        }
    }

    client.provider().disconnect();
    Ok(())
}
