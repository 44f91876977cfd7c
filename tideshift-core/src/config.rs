//! Centralized configuration for Tideshift.
//!
//! All tunable parameters of the caching engine are defined here and passed
//! explicitly into each component at construction time.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::TideshiftError;

/// Size of a single memory cache unit.
pub const MEMORY_UNIT_SIZE: usize = 32 * 1024;

/// Central configuration for all Tideshift components.
///
/// Groups related configuration settings into logical sections.
/// Supports environment variable overrides and JSON settings files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TideshiftConfig {
    pub cache: CacheConfig,
    pub playlist: PlaylistConfig,
    pub network: NetworkConfig,
}

/// Storage backend for the time-shift window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    /// Fixed 32 KiB heap units
    Memory,
    /// Large chunk files in the cache directory
    File,
}

impl std::str::FromStr for CacheBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(CacheBackend::Memory),
            "file" => Ok(CacheBackend::File),
            _ => Err(format!("Invalid cache backend: {s}")),
        }
    }
}

/// Chunk store configuration.
///
/// Controls where and how much of the live stream is retained for
/// pause and rewind.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory holding file cache chunks
    pub cache_dir: PathBuf,
    /// Whether the player may pause and rewind live channels
    pub timeshift_enabled: bool,
    /// Maximum bytes retained in the time-shift window
    pub timeshift_buffer_size: u64,
    /// Time-shift storage backend
    pub backend: CacheBackend,
    /// Size of a single file cache chunk
    pub file_chunk_size: u64,
    /// Ring size used when time-shift is disabled
    pub off_timeshift_cache_size: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("tideshift"),
            timeshift_enabled: true,
            timeshift_buffer_size: 512 * 1024 * 1024, // 512 MiB
            backend: CacheBackend::Memory,
            file_chunk_size: 128 * 1024 * 1024, // 128 MiB
            off_timeshift_cache_size: 4 * 1024 * 1024, // 4 MiB
        }
    }
}

impl CacheConfig {
    /// Number of memory units needed to hold the time-shift window.
    pub fn memory_size_factor(&self) -> usize {
        (self.timeshift_buffer_size as usize)
            .div_ceil(MEMORY_UNIT_SIZE)
            .max(1)
    }

    /// Number of ring units used when time-shift is disabled.
    pub fn cyclic_unit_count(&self) -> usize {
        (self.off_timeshift_cache_size as usize)
            .div_ceil(MEMORY_UNIT_SIZE)
            .max(2)
    }
}

/// Segmented playlist (HLS) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaylistConfig {
    /// Maximum bytes of downloaded segments kept in memory
    pub cache_size_limit: u64,
    /// Segment depth for archive/VOD delegates
    pub segments_to_cache: usize,
    /// Minimum delay between two fetches of a live playlist
    #[serde(with = "duration_ms")]
    pub min_reload_interval: Duration,
}

impl Default for PlaylistConfig {
    fn default() -> Self {
        Self {
            cache_size_limit: 60 * 1024 * 1024, // 60 MB
            segments_to_cache: 20,
            min_reload_interval: Duration::from_secs(1),
        }
    }
}

/// Network and source reader configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// How long opening a channel waits for the first bytes
    #[serde(with = "duration_ms")]
    pub channel_reload_timeout: Duration,
    /// Timeout of a single source read issued by the writer task
    #[serde(with = "duration_ms")]
    pub source_read_timeout: Duration,
    /// HTTP connect and request timeout
    #[serde(with = "duration_ms")]
    pub http_timeout: Duration,
    /// Sleep increment while polling a cache for more data
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// User agent for HTTP requests
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            channel_reload_timeout: Duration::from_secs(5),
            source_read_timeout: Duration::from_secs(1),
            http_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_millis(50),
            user_agent: "tideshift/0.1.0".to_string(),
        }
    }
}

impl TideshiftConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Loads a JSON settings file, then applies environment overrides.
    ///
    /// # Errors
    ///
    /// - `TideshiftError::Io` - If the file cannot be read
    /// - `TideshiftError::Configuration` - If the file is not valid settings JSON
    pub fn from_json_file(path: &Path) -> Result<Self, TideshiftError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self =
            serde_json::from_str(&raw).map_err(|e| TideshiftError::Configuration {
                reason: format!("{}: {e}", path.display()),
            })?;
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("TIDESHIFT_CACHE_DIR") {
            self.cache.cache_dir = PathBuf::from(dir);
        }

        if let Ok(enabled) = std::env::var("TIDESHIFT_TIMESHIFT_ENABLED") {
            if let Ok(value) = enabled.parse::<bool>() {
                self.cache.timeshift_enabled = value;
            }
        }

        if let Ok(size) = std::env::var("TIDESHIFT_TIMESHIFT_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                self.cache.timeshift_buffer_size = bytes;
            }
        }

        if let Ok(backend) = std::env::var("TIDESHIFT_TIMESHIFT_BACKEND") {
            match backend.parse::<CacheBackend>() {
                Ok(value) => self.cache.backend = value,
                Err(reason) => tracing::warn!("Ignoring TIDESHIFT_TIMESHIFT_BACKEND: {reason}"),
            }
        }

        if let Ok(size) = std::env::var("TIDESHIFT_OFF_TIMESHIFT_SIZE") {
            if let Ok(bytes) = size.parse::<u64>() {
                self.cache.off_timeshift_cache_size = bytes;
            }
        }

        if let Ok(depth) = std::env::var("TIDESHIFT_SEGMENTS_TO_CACHE") {
            if let Ok(count) = depth.parse::<usize>() {
                self.playlist.segments_to_cache = count;
            }
        }

        if let Ok(timeout) = std::env::var("TIDESHIFT_CHANNEL_RELOAD_TIMEOUT_MS") {
            if let Ok(millis) = timeout.parse::<u64>() {
                self.network.channel_reload_timeout = Duration::from_millis(millis);
            }
        }
    }

    /// Creates a configuration optimized for testing.
    ///
    /// Small windows and short timeouts keep tests fast.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig {
                timeshift_buffer_size: 4 * MEMORY_UNIT_SIZE as u64,
                file_chunk_size: 64 * 1024,
                off_timeshift_cache_size: 4 * MEMORY_UNIT_SIZE as u64,
                ..Default::default()
            },
            playlist: PlaylistConfig {
                min_reload_interval: Duration::from_millis(10),
                ..Default::default()
            },
            network: NetworkConfig {
                channel_reload_timeout: Duration::from_millis(500),
                source_read_timeout: Duration::from_millis(100),
                poll_interval: Duration::from_millis(5),
                ..Default::default()
            },
        }
    }
}

/// Serializes durations as integer milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
