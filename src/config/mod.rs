use crate::error::{Error, Result};
use serde::de::{Deserializer, SeqAccess, Visitor};
use serde::Deserialize;
use std::convert::TryFrom;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

fn default_timeout() -> u64 {
    600
}

/// Structured process configuration, deserialized from a JSON file. The
/// `server`/`server_port` fields accept both a single value and a list;
/// host entries may embed their own `"host:port"`.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    #[serde(deserialize_with = "string_or_list")]
    pub server: Vec<String>,
    #[serde(deserialize_with = "port_or_list")]
    pub server_port: Vec<u16>,
    pub local_port: u16,
    #[serde(default)]
    pub local_address: Option<String>,
    pub password: String,
    /// Cipher method name; `"table"` or absent selects the legacy
    /// substitution cipher.
    #[serde(default)]
    pub method: Option<String>,
    /// Idle timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub verbose: bool,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::Config(format!("found an error in {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.is_empty() {
            return Err(Error::Config("server must not be empty".into()));
        }
        if self.server_port.is_empty() {
            return Err(Error::Config("server_port must not be empty".into()));
        }
        if self.password.is_empty() {
            return Err(Error::Config("password must not be empty".into()));
        }
        Ok(())
    }
}

fn string_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct StringOrList;

    impl<'de> Visitor<'de> for StringOrList {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a string or a list of strings")
        }

        fn visit_str<E>(self, s: &str) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            Ok(vec![s.to_owned()])
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut values = Vec::new();
            while let Some(v) = seq.next_element::<String>()? {
                values.push(v);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(StringOrList)
}

fn port_or_list<'de, D>(deserializer: D) -> std::result::Result<Vec<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    struct PortOrList;

    impl<'de> Visitor<'de> for PortOrList {
        type Value = Vec<u16>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a port number or a list of port numbers")
        }

        fn visit_u64<E>(self, v: u64) -> std::result::Result<Self::Value, E>
        where
            E: serde::de::Error,
        {
            let port = u16::try_from(v)
                .map_err(|_| serde::de::Error::custom(format!("port {} out of range", v)))?;
            Ok(vec![port])
        }

        fn visit_seq<A>(self, mut seq: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: SeqAccess<'de>,
        {
            let mut values = Vec::new();
            while let Some(v) = seq.next_element::<u16>()? {
                values.push(v);
            }
            Ok(values)
        }
    }

    deserializer.deserialize_any(PortOrList)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_value, json};

    #[test]
    fn test_deserialize_minimal_config() {
        let config = from_value::<Config>(json!({
            "server": "203.0.113.5",
            "server_port": 8388,
            "local_port": 1080,
            "password": "barfoo!"
        }))
        .unwrap();
        assert_eq!(config.server, vec!["203.0.113.5"]);
        assert_eq!(config.server_port, vec![8388]);
        assert_eq!(config.method, None);
        assert_eq!(config.timeout, 600);
        assert!(!config.verbose);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_list_config() {
        let config = from_value::<Config>(json!({
            "server": ["203.0.113.5", "203.0.113.6:8382"],
            "server_port": [8381, 8382],
            "local_port": 1080,
            "local_address": "127.0.0.1",
            "password": "barfoo!",
            "method": "aes-256-cfb",
            "timeout": 300,
            "verbose": true
        }))
        .unwrap();
        assert_eq!(config.server.len(), 2);
        assert_eq!(config.server_port, vec![8381, 8382]);
        assert_eq!(config.method.as_deref(), Some("aes-256-cfb"));
        assert_eq!(config.timeout, 300);
        assert!(config.verbose);
    }

    #[test]
    fn test_empty_password_is_rejected() {
        let config = from_value::<Config>(json!({
            "server": "203.0.113.5",
            "server_port": 8388,
            "local_port": 1080,
            "password": ""
        }))
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_port_out_of_range_is_rejected() {
        assert!(from_value::<Config>(json!({
            "server": "203.0.113.5",
            "server_port": 99999,
            "local_port": 1080,
            "password": "x"
        }))
        .is_err());
    }
}
