//! Entry point: validated configuration in, clients and servers out.

use crate::{Client, ConfigurationError, FactoryConfig, Server};

/// Creates clients and servers sharing one validated configuration.
#[derive(Debug, Clone)]
pub struct ConnectionFactory {
    config: FactoryConfig,
}

impl ConnectionFactory {
    /// Validates `config` and creates the factory.
    pub fn new(config: FactoryConfig) -> Result<Self, ConfigurationError> {
        config.validate()?;
        tracing::debug!(
            transport = %config.transport,
            address_family = %config.address_family,
            "connection factory ready",
        );
        Ok(Self { config })
    }

    /// Builds the factory from `(parameter, value)` string pairs.
    ///
    /// See [`FactoryConfig::from_params`] for the accepted parameters.
    pub fn from_params<'a>(
        params: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<Self, ConfigurationError> {
        Self::new(FactoryConfig::from_params(params)?)
    }

    /// The configuration every client and server is created with.
    pub fn config(&self) -> &FactoryConfig {
        &self.config
    }

    /// Creates an unconnected client.
    pub fn make_client(&self) -> Client {
        Client::new(&self.config)
    }

    /// Creates an unbound server.
    pub fn make_server(&self) -> Server {
        Server::new(&self.config)
    }
}
