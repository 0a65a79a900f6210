use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::{Error, Result};

pub const DAM_ROOT: &str = "/content/dam";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub threads: usize,
    pub generations: u64,
    pub max_assets: Option<u64>,
    pub failure_tolerance: u64,
    pub paths: PathsConfig,
    pub logging: LoggingConfig,
    pub aem: AemConfig,
    pub structure: StructureConfig,
    pub retry: RetryPolicy,
    pub image: ImageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub input_dir: PathBuf,
    pub output_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub file: Option<PathBuf>,
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AemConfig {
    pub enabled: bool,
    pub host: String,
    pub destination: String,
    pub put_into_date_folder: bool,
    #[serde(skip_serializing)]
    pub token: Option<String>,
    pub token_file: PathBuf,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StructureConfig {
    pub enabled: bool,
    pub file: PathBuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            generations: 1000,
            max_assets: None,
            failure_tolerance: 0,
            paths: PathsConfig::default(),
            logging: LoggingConfig::default(),
            aem: AemConfig::default(),
            structure: StructureConfig::default(),
            retry: RetryPolicy::default(),
            image: ImageConfig::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("img"),
            output_dir: Some(PathBuf::from("out")),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            file: Some(PathBuf::from("image_processing.log")),
            level: "INFO".to_string(),
        }
    }
}

impl Default for AemConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "http://localhost:4502".to_string(),
            destination: "/content/dam/images".to_string(),
            put_into_date_folder: false,
            token: None,
            token_file: PathBuf::from("local_development_token.json"),
            request_timeout_secs: 60,
        }
    }
}

impl Default for StructureConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            file: PathBuf::from("data/customer_structure.csv"),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            width: 1024,
            height: 768,
        }
    }
}

impl RunConfig {
    /// Defaults, then the optional TOML file, then the process environment.
    /// Not validated: callers apply their own overrides first.
    pub fn load(settings_file: Option<&Path>) -> Result<Self> {
        let mut config = match settings_file {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!("config read failed: {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(text)
            .map_err(|e| Error::invalid_config(format!("config invalid: {e}")))?;
        config.normalize();
        Ok(config)
    }

    /// Overlays the recognized environment variables using `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string());

        if let Some(v) = get("NUM_THREADS") {
            self.threads = parse_value("NUM_THREADS", &v)?;
        }
        if let Some(v) = get("NUM_GENERATIONS") {
            self.generations = parse_value("NUM_GENERATIONS", &v)?;
        }
        if let Some(v) = get("MAX_ASSETS") {
            self.max_assets = if v.is_empty() {
                None
            } else {
                Some(parse_value("MAX_ASSETS", &v)?)
            };
        }
        if let Some(v) = get("FAILURE_TOLERANCE") {
            self.failure_tolerance = parse_value("FAILURE_TOLERANCE", &v)?;
        }
        if let Some(v) = get("INPUT_DIR") {
            self.paths.input_dir = PathBuf::from(v);
        }
        if let Some(v) = get("OUTPUT_DIR") {
            self.paths.output_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG_FILE") {
            self.logging.file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = get("AEM_ENABLED") {
            self.aem.enabled = parse_bool("AEM_ENABLED", &v)?;
        }
        if let Some(v) = get("AEM_HOST") {
            self.aem.host = v;
        }
        if let Some(v) = get("AEM_DESTINATION") {
            self.aem.destination = v;
        }
        if let Some(v) = get("AEM_PUT_INTO_DATE_FOLDER") {
            self.aem.put_into_date_folder = parse_bool("AEM_PUT_INTO_DATE_FOLDER", &v)?;
        }
        if let Some(v) = get("AEM_TOKEN") {
            self.aem.token = Some(v);
        }
        if let Some(v) = get("AEM_TOKEN_FILE") {
            self.aem.token_file = PathBuf::from(v);
        }
        if let Some(v) = get("AEM_REQUEST_TIMEOUT_SECS") {
            self.aem.request_timeout_secs = parse_value("AEM_REQUEST_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("REPLICATE_CUSTOMER_STRUCTURE") {
            self.structure.enabled = parse_bool("REPLICATE_CUSTOMER_STRUCTURE", &v)?;
        }
        if let Some(v) = get("REPLICATE_CUSTOMER_STRUCTURE_FILE") {
            self.structure.file = PathBuf::from(v);
        }
        if let Some(v) = get("MAX_RETRIES") {
            self.retry.max_attempts = parse_value("MAX_RETRIES", &v)?;
        }
        if let Some(v) = get("RETRY_BASE_DELAY_MS") {
            self.retry.base_delay_ms = parse_value("RETRY_BASE_DELAY_MS", &v)?;
        }
        if let Some(v) = get("RETRY_MAX_DELAY_MS") {
            self.retry.max_delay_ms = parse_value("RETRY_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = get("AUTH_RETRY_LIMIT") {
            self.retry.auth_retry_limit = parse_value("AUTH_RETRY_LIMIT", &v)?;
        }
        if let Some(v) = get("IMAGE_WIDTH") {
            self.image.width = parse_value("IMAGE_WIDTH", &v)?;
        }
        if let Some(v) = get("IMAGE_HEIGHT") {
            self.image.height = parse_value("IMAGE_HEIGHT", &v)?;
        }

        self.normalize();
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(Error::invalid_config("NUM_THREADS must be >= 1"));
        }
        self.retry.validate()?;
        if self.image.width == 0 || self.image.height == 0 {
            return Err(Error::invalid_config("image dimensions must be > 0"));
        }
        if !self.aem.destination.starts_with('/') {
            return Err(Error::invalid_config(format!(
                "AEM_DESTINATION must be an absolute repository path (got {:?})",
                self.aem.destination
            )));
        }
        if self.aem.enabled {
            if !(self.aem.host.starts_with("http://") || self.aem.host.starts_with("https://")) {
                return Err(Error::invalid_config(format!(
                    "AEM_HOST must be an http(s) URL (got {:?})",
                    self.aem.host
                )));
            }
            if self.aem.request_timeout_secs == 0 {
                return Err(Error::invalid_config("AEM_REQUEST_TIMEOUT_SECS must be > 0"));
            }
        }
        Ok(())
    }

    fn normalize(&mut self) {
        if self
            .paths
            .output_dir
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.paths.output_dir = None;
        }
        if self
            .logging
            .file
            .as_ref()
            .is_some_and(|p| p.as_os_str().is_empty())
        {
            self.logging.file = None;
        }
        if self.aem.token.as_deref().is_some_and(str::is_empty) {
            self.aem.token = None;
        }
        while self.aem.host.ends_with('/') {
            self.aem.host.pop();
        }
        while self.aem.destination.len() > 1 && self.aem.destination.ends_with('/') {
            self.aem.destination.pop();
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::invalid_config(format!("{key}={value:?}: {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(Error::invalid_config(format!(
            "{key}={other:?}: expected true/false"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn env_overrides_defaults() {
        let vars = env(&[
            ("NUM_THREADS", "8"),
            ("AEM_ENABLED", "TRUE"),
            ("AEM_HOST", "https://author.example.com/"),
            ("AEM_DESTINATION", "/content/dam/gen/"),
            ("AEM_PUT_INTO_DATE_FOLDER", "yes"),
            ("OUTPUT_DIR", ""),
            ("MAX_RETRIES", "5"),
        ]);
        let mut config = RunConfig::default();
        config.apply_env(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.threads, 8);
        assert!(config.aem.enabled);
        assert_eq!(config.aem.host, "https://author.example.com");
        assert_eq!(config.aem.destination, "/content/dam/gen");
        assert!(config.aem.put_into_date_folder);
        assert_eq!(config.paths.output_dir, None);
        assert_eq!(config.retry.max_attempts, 5);
        config.validate().unwrap();
    }

    #[test]
    fn unparseable_env_value_is_rejected() {
        let vars = env(&[("NUM_THREADS", "four")]);
        let mut config = RunConfig::default();
        let err = config.apply_env(|k| vars.get(k).cloned()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
        assert!(err.to_string().contains("NUM_THREADS"));

        let vars = env(&[("AEM_ENABLED", "maybe")]);
        assert!(config.apply_env(|k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn zero_threads_fails_validation() {
        let config = RunConfig {
            threads: 0,
            ..RunConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_destination_fails_validation() {
        let mut config = RunConfig::default();
        config.aem.enabled = true;
        config.aem.destination = "images".to_string();
        assert!(config.validate().is_err());

        config.aem.enabled = false;
        assert!(config.validate().is_err());

        config.aem.destination = "/content/dam/images".to_string();
        config.validate().unwrap();
    }

    #[test]
    fn load_leaves_validation_to_later_overrides() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("settings.toml");
        std::fs::write(&path, "threads = 0\n").unwrap();

        let mut config = RunConfig::load(Some(&path)).unwrap();
        config.threads = 4;
        config.validate().unwrap();
    }

    #[test]
    fn toml_file_is_layered_under_env() {
        let mut config = RunConfig::from_toml_str(
            r#"
threads = 2
generations = 10

[aem]
enabled = true
destination = "/content/dam/seed"

[retry]
max_attempts = 4
"#,
        )
        .unwrap();
        assert_eq!(config.threads, 2);
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.aem.host, "http://localhost:4502");

        let vars = env(&[("NUM_THREADS", "6")]);
        config.apply_env(|k| vars.get(k).cloned()).unwrap();
        assert_eq!(config.threads, 6);
        assert_eq!(config.generations, 10);
        assert_eq!(config.aem.destination, "/content/dam/seed");
    }
}
