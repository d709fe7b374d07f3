use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Command line interface configuration
#[derive(Parser, Debug)]
#[command(
    author, version,
    about = "Short link redirect proxy (SOCKS5 + HTTP on one port)",
    long_about = "shortlink-proxy resolves single-label hostnames to full URLs and answers with a redirect.\n\nClients may talk plain HTTP or connect through SOCKS5 (as routed by the served PAC file); both arrive on the same port.\n\nEndpoints:\n- GET /check, /health : status JSON\n- GET /proxy.pac      : proxy auto-config script\n- anything else       : redirect by Host header\n\nSend SIGUSR1 to reload the mapping file.\n"
)]
pub struct Cli {
    /// Port to listen on (HTTP and SOCKS5)
    #[arg(short, long, env = "PORT", default_value_t = 80)]
    pub port: u16,

    /// IP address to bind the listener
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_ip: IpAddr,

    /// JSON document holding the short link mappings
    #[arg(short, long, env = "CONFIG_FILE", default_value = "config.json")]
    pub config_file: PathBuf,

    /// Seconds to wait for in-flight requests on shutdown
    #[arg(long, default_value_t = 10)]
    pub shutdown_timeout: u64,

    /// Seconds a new connection may take to send its first request bytes
    /// (including the SOCKS5 handshake)
    #[arg(long, default_value_t = 30)]
    pub handshake_timeout: u64,
}

/// Proxy server configuration derived from CLI arguments
#[derive(Clone, Debug)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub config_file: PathBuf,
    pub shutdown_timeout: Duration,
    pub handshake_timeout: Duration,
}

impl ProxyConfig {
    /// Create ProxyConfig from CLI arguments
    pub fn from_cli(args: Cli) -> Self {
        Self {
            listen_addr: SocketAddr::new(args.listen_ip, args.port),
            config_file: args.config_file,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
        }
    }

    /// Port clients should use, as reported by the PAC script and /check
    pub fn port(&self) -> u16 {
        self.listen_addr.port()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_standalone_deployment() {
        let cli = Cli::try_parse_from(["shortlink-proxy"]).unwrap();
        let config = ProxyConfig::from_cli(cli);

        // PORT / CONFIG_FILE may be set in the environment running the tests
        if std::env::var_os("PORT").is_none() {
            assert_eq!(config.port(), 80);
        }
        if std::env::var_os("CONFIG_FILE").is_none() {
            assert_eq!(config.config_file, PathBuf::from("config.json"));
        }
        assert_eq!(config.listen_addr.ip(), "0.0.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "shortlink-proxy",
            "--port",
            "8172",
            "--listen-ip",
            "127.0.0.1",
            "--config-file",
            "/etc/shortlinks.json",
            "--shutdown-timeout",
            "3",
        ])
        .unwrap();
        let config = ProxyConfig::from_cli(cli);

        assert_eq!(config.listen_addr, "127.0.0.1:8172".parse().unwrap());
        assert_eq!(config.config_file, PathBuf::from("/etc/shortlinks.json"));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(Cli::try_parse_from(["shortlink-proxy", "--port", "70000"]).is_err());
    }
}
