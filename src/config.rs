use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read from `BRANCHLEDGER_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub pending_ttl: Option<Duration>,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5434,
            data_dir: PathBuf::from("./data"),
            password: "branchledger".into(),
            max_connections: 256,
            compact_threshold: 1000,
            pending_ttl: None,
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

    /// Build from any key lookup. Unparseable numbers fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            bind: lookup("BRANCHLEDGER_BIND").unwrap_or(d.bind),
            port: parsed(&lookup, "BRANCHLEDGER_PORT").unwrap_or(d.port),
            data_dir: lookup("BRANCHLEDGER_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: lookup("BRANCHLEDGER_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&lookup, "BRANCHLEDGER_MAX_CONNECTIONS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(d.max_connections),
            compact_threshold: parsed(&lookup, "BRANCHLEDGER_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            pending_ttl: parsed(&lookup, "BRANCHLEDGER_PENDING_TTL_SECS")
                .filter(|s: &u64| *s > 0)
                .map(Duration::from_secs),
            metrics_port: parsed(&lookup, "BRANCHLEDGER_METRICS_PORT"),
            tls_cert: lookup("BRANCHLEDGER_TLS_CERT"),
            tls_key: lookup("BRANCHLEDGER_TLS_KEY"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Look up `key` and parse it, ignoring surrounding whitespace.
fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|s| s.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c.listen_addr(), "0.0.0.0:5434");
        assert_eq!(c.wal_path(), PathBuf::from("./data/ledger.wal"));
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.compact_threshold, 1000);
        assert!(c.pending_ttl.is_none());
        assert!(c.metrics_port.is_none());
    }

    #[test]
    fn reads_overrides() {
        let c = config(&[
            ("BRANCHLEDGER_PORT", "6000"),
            ("BRANCHLEDGER_DATA_DIR", "/var/lib/ledger"),
            ("BRANCHLEDGER_PENDING_TTL_SECS", " 3600 "),
            ("BRANCHLEDGER_METRICS_PORT", "9100"),
        ]);
        assert_eq!(c.port, 6000);
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/ledger/ledger.wal"));
        assert_eq!(c.pending_ttl, Some(Duration::from_secs(3600)));
        assert_eq!(c.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let c = config(&[
            ("BRANCHLEDGER_PORT", "not-a-port"),
            ("BRANCHLEDGER_MAX_CONNECTIONS", "0"),
            ("BRANCHLEDGER_PENDING_TTL_SECS", "0"),
        ]);
        assert_eq!(c.port, 5434);
        assert_eq!(c.max_connections, 256);
        assert!(c.pending_ttl.is_none());
    }

    #[test]
    fn numeric_settings_of_different_widths() {
        let c = config(&[
            ("BRANCHLEDGER_PORT", "65535"),
            ("BRANCHLEDGER_MAX_CONNECTIONS", "4096"),
            ("BRANCHLEDGER_COMPACT_THRESHOLD", "5000000000"),
            ("BRANCHLEDGER_PENDING_TTL_SECS", "90"),
        ]);
        assert_eq!(c.port, u16::MAX);
        assert_eq!(c.max_connections, 4096);
        assert_eq!(c.compact_threshold, 5_000_000_000);
        assert_eq!(c.pending_ttl, Some(Duration::from_secs(90)));

        // Out of range for a port, in range for the others.
        assert_eq!(config(&[("BRANCHLEDGER_PORT", "70000")]).port, 5434);
    }
}
