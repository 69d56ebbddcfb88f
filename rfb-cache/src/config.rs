//! Typed configuration records consumed by the cache core.
//!
//! Parsing and loading (CLI flags, config files) happen outside the core;
//! these records arrive fully typed and are validated before use.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Session (ContentCache) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Master switch for the session cache.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Server session cache capacity in MiB.
    #[serde(default = "default_memory_mib")]
    pub memory_mib: usize,

    /// Minimum rectangle area (pixels) eligible for caching.
    #[serde(default = "default_min_rect_size")]
    pub min_rect_size_pixels: u32,

    /// Entry TTL in seconds (0 = no expiry).
    #[serde(default)]
    pub max_age_seconds: u32,
}

fn default_true() -> bool {
    true
}

fn default_memory_mib() -> usize {
    2048
}

fn default_min_rect_size() -> u32 {
    4096 // 64x64
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_mib: default_memory_mib(),
            min_rect_size_pixels: default_min_rect_size(),
            max_age_seconds: 0,
        }
    }
}

impl CacheConfig {
    pub fn memory_bytes(&self) -> usize {
        self.memory_mib.saturating_mul(1024 * 1024)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.memory_mib == 0 {
            return Err("cache memory capacity cannot be 0 when enabled".into());
        }
        Ok(())
    }
}

/// Viewer-side persistent cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentCacheConfig {
    /// Master switch for the disk-backed cache.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// In-memory tier capacity in MiB.
    #[serde(default = "default_memory_mib")]
    pub memory_mib: usize,

    /// Disk capacity in MiB. Defaults to twice the memory tier.
    #[serde(default)]
    pub disk_mib: Option<usize>,

    /// Target shard size in MiB.
    #[serde(default = "default_shard_mib")]
    pub shard_mib: usize,

    /// Cache directory. Defaults to a per-user cache location.
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Arbitrate disk writes with other viewer processes sharing the
    /// directory.
    #[serde(default = "default_true")]
    pub coordinate: bool,
}

fn default_shard_mib() -> usize {
    64
}

impl Default for PersistentCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            memory_mib: default_memory_mib(),
            disk_mib: None,
            shard_mib: default_shard_mib(),
            directory: None,
            coordinate: true,
        }
    }
}

impl PersistentCacheConfig {
    pub fn memory_bytes(&self) -> usize {
        self.memory_mib.saturating_mul(1024 * 1024)
    }

    /// Disk capacity in bytes; disk must hold at least the memory tier.
    pub fn disk_bytes(&self) -> usize {
        let mib = self.disk_mib.unwrap_or(self.memory_mib * 2);
        mib.max(self.memory_mib).saturating_mul(1024 * 1024)
    }

    pub fn shard_bytes(&self) -> usize {
        self.shard_mib.saturating_mul(1024 * 1024)
    }

    /// Resolve the cache directory, falling back to the platform cache dir.
    pub fn directory(&self) -> PathBuf {
        self.directory.clone().unwrap_or_else(|| {
            dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("rfb-rectcache")
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.enabled && self.memory_mib == 0 {
            return Err("persistent memory capacity cannot be 0 when enabled".into());
        }
        if self.enabled && self.shard_mib == 0 {
            return Err("shard size cannot be 0".into());
        }
        if let Some(disk) = self.disk_mib {
            if disk < self.memory_mib {
                return Err(format!(
                    "disk capacity {} MiB is below memory capacity {} MiB",
                    disk, self.memory_mib
                ));
            }
        }
        Ok(())
    }
}

/// Content hashing configuration. Must be identical on server and viewer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashConfig {
    /// Rectangle area (pixels) at which sampled hashing kicks in.
    #[serde(default = "default_sample_area_threshold")]
    pub sample_area_threshold: u64,

    /// Sampling step in pixels, both dimensions.
    #[serde(default = "default_sample_stride")]
    pub sample_stride: usize,
}

fn default_sample_area_threshold() -> u64 {
    262_144
}

fn default_sample_stride() -> usize {
    4
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            sample_area_threshold: default_sample_area_threshold(),
            sample_stride: default_sample_stride(),
        }
    }
}

impl HashConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_stride == 0 {
            return Err("sample stride cannot be 0".into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cache = CacheConfig::default();
        assert!(cache.enabled);
        assert_eq!(cache.memory_mib, 2048);
        assert_eq!(cache.min_rect_size_pixels, 4096);
        assert_eq!(cache.max_age_seconds, 0);
        cache.validate().unwrap();

        let persistent = PersistentCacheConfig::default();
        assert_eq!(persistent.shard_mib, 64);
        assert_eq!(persistent.disk_bytes(), 2 * persistent.memory_bytes());
        persistent.validate().unwrap();

        let hash = HashConfig::default();
        assert_eq!(hash.sample_area_threshold, 262_144);
        assert_eq!(hash.sample_stride, 4);
    }

    #[test]
    fn test_validation_failures() {
        let cache = CacheConfig {
            enabled: true,
            memory_mib: 0,
            ..CacheConfig::default()
        };
        assert!(cache.validate().is_err());

        let persistent = PersistentCacheConfig {
            disk_mib: Some(100),
            memory_mib: 200,
            ..PersistentCacheConfig::default()
        };
        assert!(persistent.validate().is_err());

        let hash = HashConfig {
            sample_stride: 0,
            ..HashConfig::default()
        };
        assert!(hash.validate().is_err());
    }

    #[test]
    fn test_disk_floor_is_memory_capacity() {
        let persistent = PersistentCacheConfig {
            memory_mib: 100,
            disk_mib: Some(100),
            ..PersistentCacheConfig::default()
        };
        assert_eq!(persistent.disk_bytes(), 100 * 1024 * 1024);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let cache: CacheConfig = serde_json::from_str("{}").unwrap();
        assert!(cache.enabled);
        assert_eq!(cache.memory_mib, 2048);

        let persistent: PersistentCacheConfig =
            serde_json::from_str(r#"{"memory_mib": 64, "shard_mib": 8}"#).unwrap();
        assert_eq!(persistent.memory_mib, 64);
        assert_eq!(persistent.shard_mib, 8);
        assert_eq!(persistent.disk_bytes(), 128 * 1024 * 1024);
    }

    #[test]
    fn test_explicit_directory_wins() {
        let persistent = PersistentCacheConfig {
            directory: Some(PathBuf::from("/tmp/custom-cache")),
            ..PersistentCacheConfig::default()
        };
        assert_eq!(persistent.directory(), PathBuf::from("/tmp/custom-cache"));
    }
}
