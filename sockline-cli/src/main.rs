//! `sockline`, a line-based echo server and client.

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;

use self::endpoint::Endpoint;

mod client;
mod endpoint;
mod eyre_tracing_error;
mod server;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Arguments {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Echoes every message back and keeps peers alive with pings.
    Server {
        #[command(flatten)]
        endpoint: Endpoint,

        /// Seconds between two pings to each peer.
        #[arg(long, default_value_t = 5)]
        ping_interval: u64,
    },

    /// Sends messages and pings to a server and logs the answers.
    Client {
        #[command(flatten)]
        endpoint: Endpoint,

        /// A message to send, may be repeated.
        #[arg(long = "message")]
        messages: Vec<String>,

        /// Number of pings to send.
        #[arg(long, default_value_t = 1)]
        pings: usize,

        /// Seconds to wait for replies and pongs.
        #[arg(long, default_value_t = 5)]
        wait: u64,
    },
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    let args = Arguments::parse();

    eyre_tracing_error::install()?;

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .with_env_var("SOCKLINE_LOG")
                    .from_env()?,
            )
            .with_writer(std::io::stderr)
            .compact()
            .finish()
            .with(tracing_error::ErrorLayer::default()),
    )?;

    match args.command {
        Command::Server {
            endpoint,
            ping_interval,
        } => {
            let factory = endpoint.factory()?;
            server::run(factory, endpoint.address, Duration::from_secs(ping_interval)).await
        }
        Command::Client {
            endpoint,
            messages,
            pings,
            wait,
        } => {
            let factory = endpoint.factory()?;
            client::run(
                factory,
                endpoint.address,
                messages,
                pings,
                Duration::from_secs(wait),
            )
            .await
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use clap::{CommandFactory, Parser};
    use pretty_assertions::assert_eq;

    use super::{Arguments, Command};

    #[test]
    fn arguments_are_consistent() {
        Arguments::command().debug_assert();
    }

    #[test]
    fn client_messages_repeat() {
        let args = Arguments::try_parse_from([
            "sockline",
            "client",
            "--address",
            "127.0.0.1:7000",
            "--message",
            "one",
            "--message",
            "two",
            "--pings",
            "3",
        ])
        .unwrap();

        let Command::Client {
            messages, pings, ..
        } = args.command
        else {
            panic!("expected the client command");
        };
        assert_eq!(messages, ["one", "two"]);
        assert_eq!(pings, 3);
    }

    #[test]
    fn bad_addresses_are_rejected() {
        assert!(Arguments::try_parse_from(["sockline", "server", "--address", "localhost"]).is_err());
    }
}
