use crate::config::Config;
use crate::crypto::{resolve_method, CipherKind, CryptoContext, SharedCryptoContext};
use crate::error::{Error, Result};
use rand::Rng;
use std::time::Duration;

pub mod address;
pub mod socks;
pub mod tunnel;

pub use address::Address;

#[cfg(debug_assertions)]
#[macro_export]
macro_rules! debug_log {
    ($( $args:expr ),*) => { {use log::debug;debug!( $( $args ),* ); }}
}

#[cfg(not(debug_assertions))]
#[macro_export]
macro_rules! debug_log {
    ($( $args:expr ),*) => {};
}

/// Everything a relay needs to reach the tunnel endpoint: the injected
/// crypto caches, the credentials, and the configured server pool.
pub struct ProxyContext {
    pub crypto: SharedCryptoContext,
    pub password: String,
    pub method: Option<CipherKind>,
    pub server_hosts: Vec<String>,
    pub server_ports: Vec<u16>,
    pub timeout: Duration,
}

impl ProxyContext {
    pub fn from_config(config: &Config) -> Result<ProxyContext> {
        let method = resolve_method(config.method.as_deref())?;
        if config.server.is_empty() || config.server_port.is_empty() {
            return Err(Error::Config("no tunnel endpoint configured".into()));
        }
        Ok(ProxyContext {
            crypto: CryptoContext::new_shared(),
            password: config.password.clone(),
            method,
            server_hosts: config.server.clone(),
            server_ports: config.server_port.clone(),
            timeout: Duration::from_secs(config.timeout),
        })
    }

    /// One tunnel endpoint, host and port each picked uniformly at
    /// random from the configured pools. A `"host:port"` host entry
    /// overrides the picked port.
    pub fn pick_server(&self) -> Address {
        let mut rng = rand::thread_rng();
        let host = &self.server_hosts[rng.gen_range(0..self.server_hosts.len())];
        let port = self.server_ports[rng.gen_range(0..self.server_ports.len())];
        Address::from_host_port(host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(json: serde_json::Value) -> Config {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_pick_server_single() {
        let config = test_config(serde_json::json!({
            "server": "10.0.0.1",
            "server_port": 8388,
            "local_port": 1080,
            "password": "pw",
            "method": "aes-256-cfb"
        }));
        let ctx = ProxyContext::from_config(&config).unwrap();
        assert_eq!(
            ctx.pick_server(),
            Address::SocketAddress("10.0.0.1:8388".parse().unwrap())
        );
        assert_eq!(ctx.method, Some(CipherKind::Aes256Cfb));
        assert_eq!(ctx.timeout, Duration::from_secs(600));
    }

    #[test]
    fn test_pick_server_embedded_port_overrides() {
        let config = test_config(serde_json::json!({
            "server": ["10.0.0.1:9999"],
            "server_port": [8388],
            "local_port": 1080,
            "password": "pw"
        }));
        let ctx = ProxyContext::from_config(&config).unwrap();
        assert_eq!(
            ctx.pick_server(),
            Address::SocketAddress("10.0.0.1:9999".parse().unwrap())
        );
        // no method means the table cipher
        assert_eq!(ctx.method, None);
    }

    #[test]
    fn test_pick_server_draws_from_pool() {
        let config = test_config(serde_json::json!({
            "server": ["10.0.0.1", "10.0.0.2"],
            "server_port": [8388, 8389],
            "local_port": 1080,
            "password": "pw",
            "method": "rc4-md5"
        }));
        let ctx = ProxyContext::from_config(&config).unwrap();
        for _ in 0..32 {
            match ctx.pick_server() {
                Address::SocketAddress(sa) => {
                    assert!(matches!(sa.port(), 8388 | 8389));
                    assert!(matches!(
                        sa.ip().to_string().as_str(),
                        "10.0.0.1" | "10.0.0.2"
                    ));
                }
                other => panic!("unexpected pick {:?}", other),
            }
        }
    }

    #[test]
    fn test_unknown_method_fails_at_startup() {
        let config = test_config(serde_json::json!({
            "server": "10.0.0.1",
            "server_port": 8388,
            "local_port": 1080,
            "password": "pw",
            "method": "chacha99-ietf"
        }));
        assert!(ProxyContext::from_config(&config).is_err());
    }
}
