//! Server settings read from `SHOPBOOK_*` environment variables.

use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::mailer::Branding;
use crate::notify::OutboxSettings;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub metrics_port: Option<u16>,
    pub resend_api_key: Option<String>,
    pub mail_from: String,
    pub admin_email: Option<String>,
    pub outbox_capacity: usize,
    pub shop_name: String,
    pub shop_address: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value for {}: {:?}", self.var, self.value)
    }
}

impl std::error::Error for ConfigError {}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError { var, value }),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let metrics_port = match lookup("SHOPBOOK_METRICS_PORT") {
            None => None,
            Some(value) => Some(value.parse().map_err(|_| ConfigError {
                var: "SHOPBOOK_METRICS_PORT",
                value,
            })?),
        };
        Ok(Self {
            port: parsed(&lookup, "SHOPBOOK_PORT", 5433)?,
            bind: lookup("SHOPBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("SHOPBOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            password: lookup("SHOPBOOK_PASSWORD").unwrap_or_else(|| "shopbook".into()),
            max_connections: parsed(&lookup, "SHOPBOOK_MAX_CONNECTIONS", 256)?,
            compact_threshold: parsed(&lookup, "SHOPBOOK_COMPACT_THRESHOLD", 1000)?,
            tls_cert: lookup("SHOPBOOK_TLS_CERT"),
            tls_key: lookup("SHOPBOOK_TLS_KEY"),
            metrics_port,
            resend_api_key: lookup("SHOPBOOK_RESEND_API_KEY"),
            mail_from: lookup("SHOPBOOK_MAIL_FROM")
                .unwrap_or_else(|| "Auto Repair Shop <noreply@example.com>".into()),
            admin_email: lookup("SHOPBOOK_ADMIN_EMAIL"),
            outbox_capacity: parsed(&lookup, "SHOPBOOK_OUTBOX_CAPACITY", 1024)?,
            shop_name: lookup("SHOPBOOK_SHOP_NAME").unwrap_or_else(|| "Auto Repair Shop".into()),
            shop_address: lookup("SHOPBOOK_SHOP_ADDRESS"),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("shop.wal")
    }

    pub fn outbox(&self) -> OutboxSettings {
        OutboxSettings {
            capacity: self.outbox_capacity,
            admin_email: self.admin_email.clone(),
            branding: Branding {
                shop_name: self.shop_name.clone(),
                address: self.shop_address.clone(),
            },
            ..OutboxSettings::default()
        }
    }

    /// Build a TLS acceptor when both cert and key are configured.
    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        let (cert_path, key_path) = match (self.tls_cert.as_deref(), self.tls_key.as_deref()) {
            (None, None) => return Ok(None),
            (Some(c), Some(k)) => (c, k),
            _ => {
                return Err(io::Error::new(
                    ErrorKind::InvalidInput,
                    "both SHOPBOOK_TLS_CERT and SHOPBOOK_TLS_KEY must be set, or neither",
                ));
            }
        };

        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
            .ok_or_else(|| {
                io::Error::new(ErrorKind::InvalidInput, "no private key found in key file")
            })?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(Some(TlsAcceptor::from(Arc::new(config))))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|var| map.get(var).cloned())
    }

    #[test]
    fn defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:5433");
        assert_eq!(config.wal_path(), PathBuf::from("./data/shop.wal"));
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.compact_threshold, 1000);
        assert_eq!(config.metrics_port, None);
        assert!(config.resend_api_key.is_none());
        assert!(config.tls_acceptor().unwrap().is_none());
    }

    #[test]
    fn overrides() {
        let config = from_pairs(&[
            ("SHOPBOOK_PORT", "6000"),
            ("SHOPBOOK_BIND", "127.0.0.1"),
            ("SHOPBOOK_DATA_DIR", "/var/lib/shop"),
            ("SHOPBOOK_METRICS_PORT", "9100"),
            ("SHOPBOOK_ADMIN_EMAIL", "desk@shop.example"),
            ("SHOPBOOK_OUTBOX_CAPACITY", "8"),
            ("SHOPBOOK_SHOP_NAME", "Harbour Auto"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6000");
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/shop/shop.wal"));
        assert_eq!(config.metrics_port, Some(9100));
        let outbox = config.outbox();
        assert_eq!(outbox.capacity, 8);
        assert_eq!(outbox.admin_email.as_deref(), Some("desk@shop.example"));
        assert_eq!(outbox.branding.shop_name, "Harbour Auto");
    }

    #[test]
    fn bad_numbers_are_reported() {
        let err = from_pairs(&[("SHOPBOOK_PORT", "lots")]).unwrap_err();
        assert_eq!(err.var, "SHOPBOOK_PORT");
        let err = from_pairs(&[("SHOPBOOK_METRICS_PORT", "-1")]).unwrap_err();
        assert_eq!(err.var, "SHOPBOOK_METRICS_PORT");
    }

    #[test]
    fn tls_needs_both_halves() {
        let config = from_pairs(&[("SHOPBOOK_TLS_CERT", "/tmp/cert.pem")]).unwrap();
        let err = config.tls_acceptor().err().expect("expected an error");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
