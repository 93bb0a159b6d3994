use moodscan_core::DetectorBackend;
use std::path::PathBuf;
use std::str::FromStr;

use crate::upload::FilenamePolicy;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Directory uploads are written to (default: storage/app/private).
    pub storage_dir: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    pub detector: DetectorBackend,
    pub filename_policy: FilenamePolicy,
    /// Allowed CORS origins. Empty means any origin (reflected).
    pub cors_origins: Vec<String>,
    pub cors_allow_credentials: bool,
    /// Request body limit in bytes; `None` disables the limit.
    pub max_upload_bytes: Option<usize>,
    /// ONNX Runtime intra-op threads per session.
    pub intra_threads: usize,
}

impl Config {
    /// Load configuration from `MOODSCAN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let sanitize = parse_bool(lookup("MOODSCAN_SANITIZE_FILENAMES"), false);

        Self {
            host: lookup("MOODSCAN_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_or(lookup("MOODSCAN_PORT"), 6969),
            storage_dir: lookup("MOODSCAN_STORAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("storage/app/private")),
            model_dir: lookup("MOODSCAN_MODEL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(moodscan_core::default_model_dir),
            detector: parse_or(lookup("MOODSCAN_DETECTOR"), DetectorBackend::Scrfd),
            filename_policy: if sanitize { FilenamePolicy::Sanitize } else { FilenamePolicy::Raw },
            cors_origins: parse_origins(lookup("MOODSCAN_CORS_ORIGINS")),
            cors_allow_credentials: parse_bool(lookup("MOODSCAN_CORS_ALLOW_CREDENTIALS"), true),
            max_upload_bytes: lookup("MOODSCAN_MAX_UPLOAD_BYTES").and_then(|v| v.parse().ok()),
            intra_threads: parse_or(lookup("MOODSCAN_INTRA_THREADS"), 2),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    match value.as_deref().map(str::trim) {
        Some("1") | Some("true") | Some("yes") => true,
        Some("0") | Some("false") | Some("no") => false,
        _ => default,
    }
}

/// Comma-separated origin list; `*` anywhere means any origin.
fn parse_origins(value: Option<String>) -> Vec<String> {
    let Some(value) = value else {
        return Vec::new();
    };
    let origins: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .map(str::to_string)
        .collect();

    if origins.iter().any(|o| o == "*") {
        Vec::new()
    } else {
        origins
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.bind_address(), "127.0.0.1:6969");
        assert_eq!(config.storage_dir, PathBuf::from("storage/app/private"));
        assert_eq!(config.detector, DetectorBackend::Scrfd);
        assert_eq!(config.filename_policy, FilenamePolicy::Raw);
        assert!(config.cors_origins.is_empty());
        assert!(config.cors_allow_credentials);
        assert_eq!(config.max_upload_bytes, None);
        assert_eq!(config.intra_threads, 2);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("MOODSCAN_HOST", "0.0.0.0"),
            ("MOODSCAN_PORT", "8080"),
            ("MOODSCAN_STORAGE_DIR", "/var/lib/moodscan/uploads"),
            ("MOODSCAN_MODEL_DIR", "/opt/models"),
            ("MOODSCAN_DETECTOR", "skip"),
            ("MOODSCAN_SANITIZE_FILENAMES", "true"),
            ("MOODSCAN_CORS_ORIGINS", "http://localhost:8000, https://app.example.com"),
            ("MOODSCAN_CORS_ALLOW_CREDENTIALS", "0"),
            ("MOODSCAN_MAX_UPLOAD_BYTES", "10485760"),
        ]);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.storage_dir, PathBuf::from("/var/lib/moodscan/uploads"));
        assert_eq!(config.model_dir, PathBuf::from("/opt/models"));
        assert_eq!(config.detector, DetectorBackend::Skip);
        assert_eq!(config.filename_policy, FilenamePolicy::Sanitize);
        assert_eq!(config.cors_origins, vec!["http://localhost:8000", "https://app.example.com"]);
        assert!(!config.cors_allow_credentials);
        assert_eq!(config.max_upload_bytes, Some(10 * 1024 * 1024));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config_from(&[
            ("MOODSCAN_PORT", "not-a-port"),
            ("MOODSCAN_DETECTOR", "mtcnn"),
            ("MOODSCAN_SANITIZE_FILENAMES", "maybe"),
        ]);
        assert_eq!(config.port, 6969);
        assert_eq!(config.detector, DetectorBackend::Scrfd);
        assert_eq!(config.filename_policy, FilenamePolicy::Raw);
    }

    #[test]
    fn test_wildcard_origin_means_any() {
        let config = config_from(&[("MOODSCAN_CORS_ORIGINS", "http://a.test,*")]);
        assert!(config.cors_origins.is_empty());
    }
}
