//! Cache configuration
//!
//! Tier capacities and memory thresholds for the raster page cache. The value
//! is built once at startup and passed into [`RasterPageCache`] and
//! [`MemoryBudgetManager`] explicitly.
//!
//! [`RasterPageCache`]: crate::RasterPageCache
//! [`MemoryBudgetManager`]: crate::MemoryBudgetManager

use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::memory_budget::MemoryBudgetConfig;

/// Default number of raw decoded pages kept in memory.
pub const DEFAULT_RAW_CAPACITY: usize = 12;

/// Default number of filter-applied pages kept in memory.
pub const DEFAULT_FILTER_CAPACITY: usize = 6;

/// Configuration for the raster page cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum entries in the raw (decoded) tier
    pub raw_capacity: usize,
    /// Maximum entries in the filter-applied tier
    pub filter_capacity: usize,
    /// Memory budget thresholds
    pub memory: MemoryBudgetConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            raw_capacity: DEFAULT_RAW_CAPACITY,
            filter_capacity: DEFAULT_FILTER_CAPACITY,
            memory: MemoryBudgetConfig::default(),
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with the given tier capacities.
    pub fn new(raw_capacity: usize, filter_capacity: usize) -> Self {
        Self {
            raw_capacity,
            filter_capacity,
            ..Default::default()
        }
    }

    /// Sets the raw tier capacity.
    pub fn with_raw_capacity(mut self, capacity: usize) -> Self {
        self.raw_capacity = capacity;
        self
    }

    /// Sets the filter tier capacity.
    pub fn with_filter_capacity(mut self, capacity: usize) -> Self {
        self.filter_capacity = capacity;
        self
    }

    /// Sets the memory budget thresholds.
    pub fn with_memory(mut self, memory: MemoryBudgetConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Raw tier capacity, never zero.
    pub fn raw_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.raw_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Filter tier capacity, never zero.
    pub fn filter_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.filter_capacity).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns a copy with zero capacities raised to one and memory ratios
    /// clamped into range.
    pub fn validated(self) -> Self {
        Self {
            raw_capacity: self.raw_capacity().get(),
            filter_capacity: self.filter_capacity().get(),
            memory: self.memory.validated(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.raw_capacity, DEFAULT_RAW_CAPACITY);
        assert_eq!(config.filter_capacity, DEFAULT_FILTER_CAPACITY);
        assert!(config.raw_capacity > config.filter_capacity);
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::default()
            .with_raw_capacity(20)
            .with_filter_capacity(8)
            .with_memory(MemoryBudgetConfig::default().with_memory_limit_mb(128));

        assert_eq!(config.raw_capacity, 20);
        assert_eq!(config.filter_capacity, 8);
        assert_eq!(config.memory.memory_limit, Some(128 * 1024 * 1024));
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let config = CacheConfig::new(0, 0).validated();
        assert_eq!(config.raw_capacity, 1);
        assert_eq!(config.filter_capacity, 1);
    }

    #[test]
    fn test_validation_clamps_fraction() {
        let config = CacheConfig::default()
            .with_memory(MemoryBudgetConfig::default().with_max_allowed_fraction(1.5))
            .validated();
        assert!(config.memory.max_allowed_fraction < 1.0);
    }

    #[test]
    fn test_json_roundtrip_with_partial_fields() {
        let config: CacheConfig = serde_json::from_str(r#"{"raw_capacity": 3}"#).unwrap();
        assert_eq!(config.raw_capacity, 3);
        assert_eq!(config.filter_capacity, DEFAULT_FILTER_CAPACITY);

        let json = serde_json::to_string(&config).unwrap();
        let parsed: CacheConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, config);
    }
}
