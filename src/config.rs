use std::path::PathBuf;

/// Server settings, read from `LOTLEDGER_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub admin_user: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            password: "lotledger".into(),
            admin_user: "admin".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers keep their default.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let num = |key: &str| get(key).and_then(|s| s.trim().parse().ok());
        Self {
            bind: get("LOTLEDGER_BIND").unwrap_or(d.bind),
            port: num("LOTLEDGER_PORT").unwrap_or(d.port),
            data_dir: get("LOTLEDGER_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("LOTLEDGER_PASSWORD").unwrap_or(d.password),
            admin_user: get("LOTLEDGER_ADMIN_USER").unwrap_or(d.admin_user),
            max_connections: get("LOTLEDGER_MAX_CONNECTIONS")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(d.max_connections),
            compact_threshold: get("LOTLEDGER_COMPACT_THRESHOLD")
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(d.compact_threshold),
            metrics_port: num("LOTLEDGER_METRICS_PORT"),
            tls_cert: get("LOTLEDGER_TLS_CERT"),
            tls_key: get("LOTLEDGER_TLS_KEY"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}
