use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read from `BOOKD_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends between compactions.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    /// Required by the on-demand reminder job when set.
    pub jobs_secret: Option<String>,
    /// Zero disables the periodic reminder sweep.
    pub reminder_interval: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}")]
    Invalid { var: &'static str, value: String },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let max_connections = parsed(&get, "BOOKD_MAX_CONNECTIONS")?.unwrap_or(256);
        if max_connections == 0 {
            return Err(ConfigError::Zero("BOOKD_MAX_CONNECTIONS"));
        }

        Ok(Self {
            bind: get("BOOKD_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "BOOKD_PORT")?.unwrap_or(5433),
            data_dir: get("BOOKD_DATA_DIR").map_or_else(|| PathBuf::from("./data"), PathBuf::from),
            password: get("BOOKD_PASSWORD").unwrap_or_else(|| "bookd".into()),
            max_connections,
            compact_threshold: parsed(&get, "BOOKD_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&get, "BOOKD_METRICS_PORT")?,
            tls_cert: get("BOOKD_TLS_CERT").map(PathBuf::from),
            tls_key: get("BOOKD_TLS_KEY").map(PathBuf::from),
            jobs_secret: get("BOOKD_JOBS_SECRET"),
            reminder_interval: Duration::from_secs(
                parsed(&get, "BOOKD_REMINDER_INTERVAL_SECS")?.unwrap_or(1800),
            ),
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookd.wal")
    }
}

fn parsed<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    get(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}
