use rollcall_core::{Metric, SignatureMatcher};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Service configuration.
///
/// Built from defaults, then an optional TOML file, then `ROLLCALL_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory enrollment photos are kept under, one subdirectory per person.
    pub photo_dir: PathBuf,
    /// JSON index of precomputed face observations.
    pub signature_index: PathBuf,
    /// Minimum normalized score for a match.
    pub match_threshold: f32,
    pub metric: Metric,
    /// Expected signature length (128 for dlib encodings). Unset accepts any.
    pub signature_dim: Option<usize>,
    /// Extraction budget per photo; slower extractions count as failures.
    pub extraction_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            db_path: data_dir.join("attendance.db"),
            photo_dir: data_dir.join("photos"),
            signature_index: data_dir.join("signatures.json"),
            match_threshold: rollcall_core::matcher::DEFAULT_THRESHOLD,
            metric: Metric::Cosine,
            signature_dim: None,
            extraction_timeout_ms: 5_000,
        }
    }
}

fn default_data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load an optional TOML file, then apply environment overrides.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_PHOTO_DIR") {
            self.photo_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_SIGNATURE_INDEX") {
            self.signature_index = PathBuf::from(v);
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_MATCH_THRESHOLD") {
            self.match_threshold = v;
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_METRIC") {
            self.metric = v;
        }
        if let Some(v) = lookup("ROLLCALL_SIGNATURE_DIM") {
            // "0" or "any" clears the dimension check.
            self.signature_dim = v.parse().ok().filter(|d: &usize| *d > 0);
        }
        if let Some(v) = parsed(&lookup, "ROLLCALL_EXTRACTION_TIMEOUT_MS") {
            self.extraction_timeout_ms = v;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.match_threshold) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be within [0, 1], got {}",
                self.match_threshold
            )));
        }
        if self.extraction_timeout_ms == 0 {
            return Err(ConfigError::Invalid("extraction_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn matcher(&self) -> SignatureMatcher {
        SignatureMatcher::new(self.metric, self.match_threshold).with_dimension(self.signature_dim)
    }

    pub fn extraction_budget(&self) -> Duration {
        Duration::from_millis(self.extraction_timeout_ms)
    }
}

/// Parse an override, ignoring values that do not parse.
fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparseable override");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.signature_dim, None);
        assert_eq!(config.extraction_budget(), Duration::from_secs(5));
        assert!(config.db_path.ends_with("rollcall/attendance.db"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("ROLLCALL_DB_PATH", "/srv/school.db"),
            ("ROLLCALL_MATCH_THRESHOLD", "0.45"),
            ("ROLLCALL_METRIC", "euclidean"),
            ("ROLLCALL_SIGNATURE_DIM", "128"),
            ("ROLLCALL_EXTRACTION_TIMEOUT_MS", "250"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/srv/school.db"));
        assert_eq!(config.match_threshold, 0.45);
        assert_eq!(config.metric, Metric::Euclidean);
        assert_eq!(config.signature_dim, Some(128));
        assert_eq!(config.extraction_budget(), Duration::from_millis(250));

        let matcher = config.matcher();
        assert_eq!(matcher.threshold, 0.45);
        assert_eq!(matcher.dimension, Some(128));
    }

    #[test]
    fn test_bad_override_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("ROLLCALL_MATCH_THRESHOLD", "high"),
            ("ROLLCALL_SIGNATURE_DIM", "any"),
        ]));
        assert_eq!(config.match_threshold, 0.6);
        assert_eq!(config.signature_dim, None);
    }

    #[test]
    fn test_toml_file() {
        let path =
            std::env::temp_dir().join(format!("rollcall-config-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
db_path = "/var/lib/rollcall/a.db"
match_threshold = 0.7
metric = "euclidean"
signature_dim = 128
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/a.db"));
        assert_eq!(config.match_threshold, 0.7);
        assert_eq!(config.metric, Metric::Euclidean);
        assert_eq!(config.signature_dim, Some(128));
        // Unset keys keep their defaults.
        assert_eq!(config.extraction_timeout_ms, 5_000);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn test_validate_threshold_range() {
        let config = Config {
            match_threshold: 1.5,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }
}
