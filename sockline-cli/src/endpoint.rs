//! Command line options shared by the server and the client.

use camino::{Utf8Path, Utf8PathBuf};
use eyre::WrapErr;
use sockline_net::{AddressFamily, ConnectionFactory, FactoryConfig, PeerAddress, Transport};

/// Where to connect or bind, and with which factory settings.
#[derive(clap::Args, Debug)]
pub(crate) struct Endpoint {
    /// `ip:port` or a Unix socket path (absolute or starting with `./`).
    #[arg(long, env = "SOCKLINE_ADDRESS")]
    pub(crate) address: PeerAddress,

    /// Overrides the transport from the configuration file.
    #[arg(long)]
    transport: Option<Transport>,

    /// Overrides the address family. Defaults to the family of `--address`.
    #[arg(long)]
    family: Option<AddressFamily>,

    /// TOML file with the factory configuration.
    #[arg(long, env = "SOCKLINE_CONFIG")]
    config: Option<Utf8PathBuf>,
}

impl Endpoint {
    /// Resolves the configuration and builds a validated factory.
    pub(crate) fn factory(&self) -> eyre::Result<ConnectionFactory> {
        let mut config = match &self.config {
            Some(path) => load(path)?,
            None => FactoryConfig {
                address_family: self.address.family(),
                ..FactoryConfig::default()
            },
        };
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(family) = self.family {
            config.address_family = family;
        }

        ConnectionFactory::new(config).wrap_err("invalid connection configuration")
    }
}

fn load(path: &Utf8Path) -> eyre::Result<FactoryConfig> {
    let text = std::fs::read_to_string(path).wrap_err_with(|| format!("failed to read {path}"))?;
    toml::from_str(&text).wrap_err_with(|| format!("failed to parse {path}"))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::Write;
    use std::time::Duration;

    use camino::Utf8PathBuf;
    use pretty_assertions::assert_eq;
    use sockline_net::{AddressFamily, OverflowPolicy, Transport};

    use super::Endpoint;

    fn endpoint(address: &str, config: Option<Utf8PathBuf>) -> Endpoint {
        // Reports cannot be created before a handler is installed.
        let _ = crate::eyre_tracing_error::install();
        Endpoint {
            address: address.parse().unwrap(),
            transport: None,
            family: None,
            config,
        }
    }

    #[test]
    fn family_follows_the_address() {
        let factory = endpoint("/tmp/sockline.sock", None).factory().unwrap();
        assert_eq!(factory.config().address_family, AddressFamily::Unix);
        assert_eq!(factory.config().transport, Transport::Tcp);
    }

    #[test]
    fn file_settings_and_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
transport = "udp"
read_buffer_size = 512

[retry]
backoff = 2
max_attempts = 10

[datagram]
queue_capacity = 4
overflow = "reject-newest"
"#
        )
        .unwrap();
        let path = Utf8PathBuf::from_path_buf(file.path().to_owned()).unwrap();

        let factory = endpoint("127.0.0.1:7000", Some(path.clone())).factory().unwrap();
        let config = factory.config();
        assert_eq!(config.transport, Transport::Udp);
        assert_eq!(config.read_buffer_size, 512);
        assert_eq!(config.retry.backoff, Duration::from_millis(2));
        assert_eq!(config.retry.max_attempts, 10);
        assert_eq!(config.datagram.queue_capacity, 4);
        assert_eq!(config.datagram.overflow, OverflowPolicy::RejectNewest);

        let mut overridden = endpoint("127.0.0.1:7000", Some(path));
        overridden.transport = Some(Transport::Tcp);
        assert_eq!(overridden.factory().unwrap().config().transport, Transport::Tcp);
    }

    #[test]
    fn invalid_files_are_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "read_buffer_size = 0").unwrap();
        let path = Utf8PathBuf::from_path_buf(file.path().to_owned()).unwrap();
        let error = endpoint("127.0.0.1:7000", Some(path)).factory().unwrap_err();
        assert_eq!(error.to_string(), "invalid connection configuration");

        let missing = Utf8PathBuf::from("/nonexistent/sockline.toml");
        let error = endpoint("127.0.0.1:7000", Some(missing)).factory().unwrap_err();
        assert!(error.to_string().contains("/nonexistent/sockline.toml"));
    }
}
