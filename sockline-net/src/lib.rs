//! Socket connections over TCP, UDP and Unix domain sockets.
//!
//! A [`ConnectionFactory`] turns a validated [`FactoryConfig`] into [`Client`]s and [`Server`]s.
//! Underneath, every OS socket is owned by a [`ConnectionResource`]; stream traffic goes through
//! the retrying [`SocketChannel`], and datagram servers split their single socket into per-peer
//! [`VirtualUdpConnection`]s through a [`Demultiplexer`].
//!
//! Socket errors are never handled by raw code. Every failed attempt is mapped through a
//! [`ClassificationTable`] to a [`Classification`] that decides between retrying, skipping,
//! disconnecting or surfacing the error.
//!
//! Everything here runs on Tokio and must be used from within a runtime.

#![forbid(unsafe_code)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

mod address;
mod capability;
mod channel;
mod classify;
mod client;
mod config;
mod connection;
mod demux;
mod error;
mod event;
mod factory;
mod handle;
mod resource;
mod server;
mod virtual_udp;

pub use address::{PeerAddress, PeerAddressParseError};
pub use capability::{PingCapable, PingPacket, Readable, Sendable};
pub use channel::SocketChannel;
pub use classify::{Classification, ClassificationTable, Operation};
pub use client::{Client, DatagramClient, StreamClient};
pub use config::{
    AddressFamily, ConfigurationError, DatagramConfig, FactoryConfig, OverflowPolicy, RetryPolicy,
    Transport,
};
pub use connection::Connection;
pub use demux::{Demultiplexer, NewPeerPolicy};
pub use error::Error;
pub use event::{EventRegistry, Subscription};
pub use factory::ConnectionFactory;
pub use resource::{ConnectionResource, State};
pub use server::{DatagramServer, Peer, Server, StreamServer};
pub use virtual_udp::VirtualUdpConnection;
