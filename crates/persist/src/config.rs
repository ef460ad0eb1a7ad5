use serde::Deserialize;

use vellum_core::consts::{MAX_OBJECT_CACHE_ENTRIES, TEXT_INDEX_MAX_PER_APP};

/// Tuning knobs shared by the store and the synchronizer.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub db_path: String,
    pub cache_max_entries: usize,
    /// Retries after the first attempt of a serializable transaction.
    pub txn_retries: u32,
    pub retry_backoff_ms: (u64, u64),
    pub textidx_wake_timeout_secs: u64,
    pub textidx_batch: usize,
    /// Has no effect unless built with the `zstd` feature.
    pub compress_blobs: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cache_max_entries: MAX_OBJECT_CACHE_ENTRIES,
            txn_retries: 3,
            retry_backoff_ms: (100, 500),
            textidx_wake_timeout_secs: 600,
            textidx_batch: TEXT_INDEX_MAX_PER_APP,
            compress_blobs: false,
        }
    }
}

impl StoreConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            db_path: std::env::var("VELLUM_DB_PATH").unwrap_or(d.db_path),
            cache_max_entries: env_parse("VELLUM_CACHE_MAX").unwrap_or(d.cache_max_entries),
            txn_retries: env_parse("VELLUM_TXN_RETRIES").unwrap_or(d.txn_retries),
            textidx_wake_timeout_secs: env_parse("VELLUM_TEXTIDX_TIMEOUT_SECS").unwrap_or(d.textidx_wake_timeout_secs),
            compress_blobs: std::env::var("VELLUM_COMPRESS")
                .ok()
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(d.compress_blobs),
            ..d
        }
    }

    pub fn with_db_path(mut self, path: impl Into<String>) -> Self {
        self.db_path = path.into();
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".vellum");
        let _ = std::fs::create_dir_all(&p);
        p.push("vellum.db");
        return p.to_string_lossy().to_string();
    }
    "vellum.db".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = StoreConfig::default().with_db_path("/tmp/x.db");
        assert_eq!(c.db_path, "/tmp/x.db");
        assert_eq!(c.cache_max_entries, 8096);
        assert_eq!(c.txn_retries, 3);
        assert_eq!(c.textidx_batch, 16);
        assert_eq!(c.textidx_wake_timeout_secs, 600);
    }
}
