use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls;

use crate::model::SettingsRow;

/// Process configuration, read once at startup from `BOOKD_*` variables.
/// Unparseable numbers fall back to their defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// Connection user that acts as the business. Any other user must be a
    /// customer ULID.
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub scan_interval: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub defaults_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "bookd".into(),
            admin_user: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            scan_interval: Duration::from_secs(30),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
            defaults_file: None,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let parsed = |key: &str| var(key).and_then(|s| s.trim().parse::<u64>().ok());
        Self {
            port: parsed("BOOKD_PORT")
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(d.port),
            bind: var("BOOKD_BIND").unwrap_or(d.bind),
            data_dir: var("BOOKD_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: var("BOOKD_PASSWORD").unwrap_or(d.password),
            admin_user: var("BOOKD_ADMIN_USER").unwrap_or(d.admin_user),
            max_connections: parsed("BOOKD_MAX_CONNECTIONS")
                .and_then(|n| usize::try_from(n).ok())
                .filter(|n| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed("BOOKD_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            scan_interval: parsed("BOOKD_SCAN_INTERVAL_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(d.scan_interval),
            metrics_port: parsed("BOOKD_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            tls_cert: var("BOOKD_TLS_CERT"),
            tls_key: var("BOOKD_TLS_KEY"),
            defaults_file: var("BOOKD_DEFAULTS_FILE").map(PathBuf::from),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Global default business settings, used by tenants without their own row.
pub fn load_defaults(path: Option<&Path>) -> io::Result<Option<SettingsRow>> {
    let Some(path) = path else { return Ok(None) };
    let row: SettingsRow = serde_json::from_reader(BufReader::new(File::open(path)?))
        .map_err(|e| io::Error::new(ErrorKind::InvalidData, format!("{}: {e}", path.display())))?;
    Ok(Some(row))
}

pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both BOOKD_TLS_CERT and BOOKD_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}
