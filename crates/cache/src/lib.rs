//! Reader page cache library
//!
//! Bounded two-tier raster cache (raw decoded pages and filter-applied
//! variants) with LRU eviction, single-owner bitmap handles and a memory
//! budget that sizes decodes and reports pressure.

pub mod bitmap;
pub mod config;
pub mod filter;
pub mod memory_budget;
pub mod raster;

pub use bitmap::{estimated_byte_size, BitmapReadGuard, PageBitmap, PageView, BYTES_PER_PIXEL};
pub use config::{CacheConfig, DEFAULT_FILTER_CAPACITY, DEFAULT_RAW_CAPACITY};
pub use filter::{FilterFingerprint, PageFilter};
pub use memory_budget::{
    FixedMemoryProbe, ListenerId, MemoryBudgetConfig, MemoryBudgetManager, MemoryPressure,
    MemoryProbe, MemoryReport, SystemMemoryProbe, BYTES_PER_MB, FALLBACK_TOTAL_MEMORY,
};
pub use raster::{BookId, CacheKey, CacheStats, FilterCacheKey, RasterPageCache, TierStats};
