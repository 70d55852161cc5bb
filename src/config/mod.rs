//! Configuration parsing module
//!
//! Reads a JSON5 file with `${VAR}` environment substitution, applies
//! `LINKWALL_*` environment overrides, and produces typed [`Settings`].
//! The running process keeps settings in a [`SharedSettings`] that is
//! swapped on reload.

use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use thiserror::Error;

use crate::media::{FetchConfig, TransformConfig};
use crate::server::ratelimit::{RateLimitConfig, NAMESPACE_PUBLIC, NAMESPACE_UPLOAD};
use crate::store::StorageLayout;

/// Config file name looked up in the state dir and working directory
pub const CONFIG_FILE_NAME: &str = "linkwall.json5";

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse JSON5 at {path}: {message}")]
    ParseError { path: String, message: String },

    #[error("Failed to read config file {path}: {message}")]
    ReadError { path: String, message: String },

    #[error("Missing environment variable: {var}")]
    MissingEnvVar { var: String },

    #[error("Invalid value for {var}: {value}")]
    InvalidOverride { var: String, value: String },

    #[error("Invalid configuration: {0}")]
    Deserialize(String),

    #[error("Validation error at {path}: {message}")]
    Validation { path: String, message: String },
}

/// Settings shared between the server, the ingestor and the reload task.
pub type SharedSettings = Arc<RwLock<Settings>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub server: ServerSettings,
    pub storage: StorageSettings,
    pub ingest: IngestSettings,
    pub fetch: FetchSettings,
    pub rate_limit: RateLimitSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerSettings {
    pub bind: String,
    /// Use X-Forwarded-For / X-Real-IP for client addresses
    pub trust_proxy_headers: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            trust_proxy_headers: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageSettings {
    pub data_dir: PathBuf,
    pub metadata_file: String,
    pub images_dir: String,
    pub previews_dir: String,
    pub public_base: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let layout = StorageLayout::new("data");
        Self {
            data_dir: layout.data_dir,
            metadata_file: layout.metadata_file,
            images_dir: layout.images_dir,
            previews_dir: layout.previews_dir,
            public_base: layout.public_base,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct IngestSettings {
    pub max_upload_mb: u64,
    pub max_concurrent_uploads: usize,
    /// Root for local-path ingestion; `None` disables it
    pub external_media_root: Option<PathBuf>,
    /// 0 keeps everything
    pub max_stored_images: usize,
    pub preview_width: u32,
    pub preview_height: u32,
    pub jpeg_quality: u8,
}

impl Default for IngestSettings {
    fn default() -> Self {
        let transform = TransformConfig::default();
        Self {
            max_upload_mb: 50,
            max_concurrent_uploads: crate::server::upload_gate::DEFAULT_MAX_CONCURRENT_UPLOADS,
            external_media_root: None,
            max_stored_images: 0,
            preview_width: transform.preview_width,
            preview_height: transform.preview_height,
            jpeg_quality: transform.jpeg_quality,
        }
    }
}

impl IngestSettings {
    pub fn max_upload_bytes(&self) -> u64 {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FetchSettings {
    pub proxy: Option<String>,
    pub insecure_tls: bool,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub header_timeout_secs: u64,
}

impl Default for FetchSettings {
    fn default() -> Self {
        let fetch = FetchConfig::default();
        Self {
            proxy: None,
            insecure_tls: false,
            timeout_secs: fetch.timeout.as_secs(),
            connect_timeout_secs: fetch.connect_timeout.as_secs(),
            header_timeout_secs: fetch.header_timeout.as_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitSettings {
    pub public_per_minute: u32,
    pub upload_per_minute: u32,
    pub burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            public_per_minute: crate::server::ratelimit::DEFAULT_PUBLIC_PER_MINUTE,
            upload_per_minute: crate::server::ratelimit::DEFAULT_UPLOAD_PER_MINUTE,
            burst: crate::server::ratelimit::DEFAULT_BURST,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggingSettings {
    pub level: String,
    /// "plaintext" or "json"
    pub format: String,
    /// Log to this file instead of stdout
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plaintext".to_string(),
            file: None,
        }
    }
}

impl Settings {
    pub fn layout(&self) -> StorageLayout {
        StorageLayout {
            data_dir: self.storage.data_dir.clone(),
            metadata_file: self.storage.metadata_file.clone(),
            images_dir: self.storage.images_dir.clone(),
            previews_dir: self.storage.previews_dir.clone(),
            public_base: self.storage.public_base.trim_end_matches('/').to_string(),
        }
    }

    pub fn transform_config(&self) -> TransformConfig {
        TransformConfig {
            preview_width: self.ingest.preview_width,
            preview_height: self.ingest.preview_height,
            jpeg_quality: self.ingest.jpeg_quality,
        }
    }

    /// Fetch settings for one call; the body cap is the upload cap.
    pub fn fetch_config(&self) -> FetchConfig {
        FetchConfig {
            max_size: self.ingest.max_upload_bytes(),
            timeout: Duration::from_secs(self.fetch.timeout_secs),
            connect_timeout: Duration::from_secs(self.fetch.connect_timeout_secs),
            header_timeout: Duration::from_secs(self.fetch.header_timeout_secs),
            proxy: self.fetch.proxy.clone().filter(|p| !p.is_empty()),
            insecure_tls: self.fetch.insecure_tls,
        }
    }

    pub fn rate_limit_config(&self) -> RateLimitConfig {
        let mut config = RateLimitConfig::default()
            .with_limit(NAMESPACE_PUBLIC, self.rate_limit.public_per_minute)
            .with_limit(NAMESPACE_UPLOAD, self.rate_limit.upload_per_minute)
            .with_burst(self.rate_limit.burst);
        config.trust_proxy_headers = self.server.trust_proxy_headers;
        config
    }

    /// Check value ranges. Returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |path: &str, message: &str| {
            Err(ConfigError::Validation {
                path: path.to_string(),
                message: message.to_string(),
            })
        };

        if self.ingest.max_upload_mb == 0 {
            return invalid("ingest.maxUploadMb", "must be greater than 0");
        }
        if self.ingest.max_concurrent_uploads == 0 {
            return invalid("ingest.maxConcurrentUploads", "must be greater than 0");
        }
        if !(1..=100).contains(&self.ingest.jpeg_quality) {
            return invalid("ingest.jpegQuality", "must be between 1 and 100");
        }
        if self.ingest.preview_width == 0 || self.ingest.preview_height == 0 {
            return invalid("ingest.previewWidth/previewHeight", "must be greater than 0");
        }
        if self.fetch.timeout_secs == 0 {
            return invalid("fetch.timeoutSecs", "must be greater than 0");
        }
        if let Some(proxy) = self.fetch.proxy.as_deref().filter(|p| !p.is_empty()) {
            if url::Url::parse(proxy).is_err() {
                return invalid("fetch.proxy", "must be an absolute URL");
            }
        }
        if self.storage.metadata_file.is_empty()
            || self.storage.metadata_file.contains(['/', '\\'])
        {
            return invalid("storage.metadataFile", "must be a plain file name");
        }
        Ok(())
    }
}

/// Get the config file path.
/// Priority: LINKWALL_CONFIG_PATH > LINKWALL_STATE_DIR/linkwall.json5 > ./linkwall.json5
pub fn get_config_path() -> PathBuf {
    if let Ok(path) = env::var("LINKWALL_CONFIG_PATH") {
        return PathBuf::from(path);
    }

    if let Ok(state_dir) = env::var("LINKWALL_STATE_DIR") {
        return PathBuf::from(state_dir).join(CONFIG_FILE_NAME);
    }

    PathBuf::from(CONFIG_FILE_NAME)
}

/// Load settings from the default path with environment overrides.
pub fn load_settings() -> Result<Settings, ConfigError> {
    load_settings_from(&get_config_path())
}

/// Load settings from `path`. A missing file yields defaults.
pub fn load_settings_from(path: &Path) -> Result<Settings, ConfigError> {
    let value = load_config_value(path)?;
    let mut settings: Settings =
        serde_json::from_value(value).map_err(|e| ConfigError::Deserialize(e.to_string()))?;
    apply_env_overrides(&mut settings, |key| env::var(key).ok())?;
    settings.validate()?;
    Ok(settings)
}

/// Read, parse and env-substitute the raw config document.
pub fn load_config_value(path: &Path) -> Result<Value, ConfigError> {
    if !path.exists() {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let content = fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut value = parse_json5(&content, path)?;
    substitute_env_vars(&mut value)?;
    Ok(value)
}

/// Re-read the config file and swap it into `shared`.
///
/// On error the current settings stay in place.
pub fn reload(shared: &SharedSettings) -> Result<(), ConfigError> {
    let path = get_config_path();
    let fresh = load_settings_from(&path)?;
    let mut current = shared.write();
    if *current != fresh {
        tracing::info!(target: "config", path = %path.display(), "Configuration reloaded");
        *current = fresh;
    }
    Ok(())
}

/// Reload settings on every SIGHUP until `cancel` fires.
#[cfg(unix)]
pub fn spawn_reload_on_sighup(
    shared: SharedSettings,
    cancel: tokio_util::sync::CancellationToken,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = hangup.recv() => {
                    if received.is_none() {
                        break;
                    }
                    if let Err(e) = reload(&shared) {
                        tracing::warn!(target: "config", error = %e, "Configuration reload failed");
                    }
                }
            }
        }
    }))
}

/// Apply `LINKWALL_*` overrides. `lookup` returns the variable's value.
pub fn apply_env_overrides<F>(settings: &mut Settings, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
        value.trim().parse().map_err(|_| ConfigError::InvalidOverride {
            var: var.to_string(),
            value: value.to_string(),
        })
    }

    if let Some(bind) = lookup("LINKWALL_BIND").filter(|v| !v.is_empty()) {
        settings.server.bind = bind;
    }
    if let Some(dir) = lookup("LINKWALL_DATA_DIR").filter(|v| !v.is_empty()) {
        settings.storage.data_dir = PathBuf::from(dir);
    }
    if let Some(v) = lookup("LINKWALL_MAX_UPLOAD_MB").filter(|v| !v.is_empty()) {
        settings.ingest.max_upload_mb = parse("LINKWALL_MAX_UPLOAD_MB", &v)?;
    }
    if let Some(v) = lookup("LINKWALL_MAX_CONCURRENT_UPLOADS").filter(|v| !v.is_empty()) {
        settings.ingest.max_concurrent_uploads = parse("LINKWALL_MAX_CONCURRENT_UPLOADS", &v)?;
    }
    if let Some(v) = lookup("LINKWALL_MAX_STORED_IMAGES").filter(|v| !v.is_empty()) {
        settings.ingest.max_stored_images = parse("LINKWALL_MAX_STORED_IMAGES", &v)?;
    }
    // Empty values clear these two.
    if let Some(root) = lookup("LINKWALL_EXTERNAL_MEDIA_ROOT") {
        settings.ingest.external_media_root =
            Some(PathBuf::from(root)).filter(|p| !p.as_os_str().is_empty());
    }
    if let Some(proxy) = lookup("LINKWALL_PROXY") {
        settings.fetch.proxy = Some(proxy).filter(|p| !p.is_empty());
    }
    Ok(())
}

/// Parse JSON5 content
fn parse_json5(content: &str, path: &Path) -> Result<Value, ConfigError> {
    json5::from_str(content).map_err(|e| ConfigError::ParseError {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

/// Substitute environment variables in string values.
/// Pattern: ${VAR} where VAR matches [A-Z_][A-Z0-9_]*
/// Escape with $${VAR} to get literal ${VAR}
fn substitute_env_vars(value: &mut Value) -> Result<(), ConfigError> {
    match value {
        Value::String(s) => {
            *s = substitute_env_in_string(s)?;
        }
        Value::Object(obj) => {
            for (_, v) in obj.iter_mut() {
                substitute_env_vars(v)?;
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                substitute_env_vars(item)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Substitute environment variables in a single string
fn substitute_env_in_string(s: &str) -> Result<String, ConfigError> {
    static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\$?\{([A-Z_][A-Z0-9_]*)\}").expect("env var pattern is valid")
    });

    let mut result = String::with_capacity(s.len());
    let mut last_end = 0;

    for caps in ENV_VAR_PATTERN.captures_iter(s) {
        let (Some(full_match), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let var_name = var.as_str();

        result.push_str(&s[last_end..full_match.start()]);

        if full_match.as_str().starts_with("$$") {
            result.push_str(&format!("${{{}}}", var_name));
        } else {
            let value = env::var(var_name).map_err(|_| ConfigError::MissingEnvVar {
                var: var_name.to_string(),
            })?;
            result.push_str(&value);
        }

        last_end = full_match.end();
    }

    result.push_str(&s[last_end..]);

    Ok(result)
}
