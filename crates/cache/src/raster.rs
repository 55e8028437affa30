//! Two-tier raster page cache with LRU eviction
//!
//! The raw tier holds decoded pages keyed by `(book_id, page_index)`. The
//! filter tier holds filter-applied variants, additionally keyed by the
//! filter fingerprint. Each tier has a fixed entry capacity, strict LRU
//! eviction and its own lock. Evicted, replaced and removed entries have
//! their pixel buffers released explicitly once the tier lock is dropped,
//! before the call that displaced them returns.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::bitmap::{PageBitmap, PageView};
use crate::config::CacheConfig;
use crate::filter::FilterFingerprint;
use crate::memory_budget::MemoryBudgetManager;

/// Identifier of a book as assigned by the library layer
pub type BookId = u64;

/// Identifies a decoded raster page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub book_id: BookId,
    pub page_index: u32,
}

impl CacheKey {
    pub fn new(book_id: BookId, page_index: u32) -> Self {
        Self {
            book_id,
            page_index,
        }
    }
}

/// Identifies a filter-applied variant of a raster page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterCacheKey {
    pub book_id: BookId,
    pub page_index: u32,
    pub fingerprint: FilterFingerprint,
}

impl FilterCacheKey {
    pub fn new(book_id: BookId, page_index: u32, fingerprint: FilterFingerprint) -> Self {
        Self {
            book_id,
            page_index,
            fingerprint,
        }
    }
}

trait TierKey: Copy + Eq + Hash + std::fmt::Debug {
    fn book_id(&self) -> BookId;
}

impl TierKey for CacheKey {
    fn book_id(&self) -> BookId {
        self.book_id
    }
}

impl TierKey for FilterCacheKey {
    fn book_id(&self) -> BookId {
        self.book_id
    }
}

/// One cached image plus its estimated byte footprint
struct CacheEntry {
    bitmap: PageBitmap,
    byte_size: usize,
}

impl CacheEntry {
    fn new(bitmap: PageBitmap) -> Self {
        let byte_size = bitmap.byte_size();
        Self { bitmap, byte_size }
    }
}

/// Statistics for one cache tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierStats {
    /// Entries currently cached
    pub entries: usize,
    /// Maximum entries before eviction
    pub capacity: usize,
    /// Estimated bytes held by cached entries
    pub memory_used: usize,
    /// Number of lookups that found an entry
    pub hits: u64,
    /// Number of lookups that found nothing
    pub misses: u64,
    /// Number of entries evicted to make room
    pub evictions: u64,
}

impl TierStats {
    /// Calculate the tier hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits, self.misses)
    }
}

/// Snapshot of both cache tiers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub raw: TierStats,
    pub filtered: TierStats,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.raw.hits + self.filtered.hits
    }

    pub fn misses(&self) -> u64 {
        self.raw.misses + self.filtered.misses
    }

    /// Combined hit rate; 0 when nothing has been looked up yet
    pub fn hit_rate(&self) -> f64 {
        hit_rate(self.hits(), self.misses())
    }

    pub fn memory_used(&self) -> usize {
        self.raw.memory_used + self.filtered.memory_used
    }

    pub fn total_entries(&self) -> usize {
        self.raw.entries + self.filtered.entries
    }

    pub fn evictions(&self) -> u64 {
        self.raw.evictions + self.filtered.evictions
    }
}

fn hit_rate(hits: u64, misses: u64) -> f64 {
    let total = hits + misses;
    if total == 0 {
        0.0
    } else {
        hits as f64 / total as f64
    }
}

/// Internal state of one tier
struct Tier<K: TierKey> {
    name: &'static str,
    entries: LruCache<K, CacheEntry>,
    memory_used: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: TierKey> Tier<K> {
    fn new(name: &'static str, capacity: NonZeroUsize) -> Self {
        Self {
            name,
            entries: LruCache::new(capacity),
            memory_used: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn get(&mut self, key: &K) -> Option<PageView> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits += 1;
                Some(entry.bitmap.view())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    /// Insert `bitmap`, returning whatever it displaced.
    fn insert(&mut self, key: K, bitmap: PageBitmap) -> (PageView, Vec<CacheEntry>) {
        let mut displaced = Vec::new();

        if let Some(old) = self.entries.pop(&key) {
            self.memory_used = self.memory_used.saturating_sub(old.byte_size);
            displaced.push(old);
        } else if self.entries.len() >= self.entries.cap().get() {
            if let Some((evicted_key, evicted)) = self.entries.pop_lru() {
                self.memory_used = self.memory_used.saturating_sub(evicted.byte_size);
                self.evictions += 1;
                trace!(tier = self.name, key = ?evicted_key, bytes = evicted.byte_size, "evicted LRU page");
                displaced.push(evicted);
            }
        }

        let entry = CacheEntry::new(bitmap);
        let view = entry.bitmap.view();
        self.memory_used += entry.byte_size;
        self.entries.put(key, entry);
        (view, displaced)
    }

    fn remove(&mut self, key: &K) -> Option<CacheEntry> {
        let entry = self.entries.pop(key)?;
        self.memory_used = self.memory_used.saturating_sub(entry.byte_size);
        Some(entry)
    }

    fn remove_book(&mut self, book_id: BookId) -> Vec<CacheEntry> {
        let keys: Vec<K> = self
            .entries
            .iter()
            .filter(|(key, _)| key.book_id() == book_id)
            .map(|(key, _)| *key)
            .collect();
        keys.iter().filter_map(|key| self.remove(key)).collect()
    }

    /// Drop up to `count` least recently used entries.
    fn trim(&mut self, count: usize) -> Vec<CacheEntry> {
        let mut trimmed = Vec::with_capacity(count.min(self.entries.len()));
        while trimmed.len() < count {
            match self.entries.pop_lru() {
                Some((_, entry)) => {
                    self.memory_used = self.memory_used.saturating_sub(entry.byte_size);
                    self.evictions += 1;
                    trimmed.push(entry);
                }
                None => break,
            }
        }
        trimmed
    }

    fn drain(&mut self) -> Vec<CacheEntry> {
        let mut drained = Vec::with_capacity(self.entries.len());
        while let Some((_, entry)) = self.entries.pop_lru() {
            drained.push(entry);
        }
        self.memory_used = 0;
        drained
    }

    fn reset_counters(&mut self) {
        self.hits = 0;
        self.misses = 0;
        self.evictions = 0;
    }

    fn stats(&self) -> TierStats {
        TierStats {
            entries: self.entries.len(),
            capacity: self.entries.cap().get(),
            memory_used: self.memory_used,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
        }
    }
}

/// Bounded two-tier cache for decoded and filtered page images
///
/// Thread-safe: each tier sits behind its own mutex, so a `put` interleaved
/// with a `get` on the same key observes either the old or the new entry,
/// never a partial one. When both tiers are touched the raw tier is always
/// locked first.
///
/// # Example
///
/// ```
/// use image::RgbaImage;
/// use reader_cache::{PageBitmap, PageFilter, RasterPageCache};
///
/// let cache = RasterPageCache::with_capacities(3, 2);
/// cache.put_raw_page(1, 0, PageBitmap::new(RgbaImage::new(64, 96)));
///
/// let page = cache.get_raw_page(1, 0).expect("page 0 is cached");
/// assert_eq!(page.width(), 64);
///
/// let sepia = PageFilter::default().with_saturation(-60.0);
/// assert!(cache.get_filtered_page(1, 0, sepia.fingerprint()).is_none());
/// assert_eq!(cache.cache_hit_rate(), 0.5);
/// ```
pub struct RasterPageCache {
    raw: Mutex<Tier<CacheKey>>,
    filtered: Mutex<Tier<FilterCacheKey>>,
    budget: Option<Arc<MemoryBudgetManager>>,
}

impl RasterPageCache {
    /// Create a cache from configuration, charging its memory to `budget`
    pub fn new(config: &CacheConfig, budget: Arc<MemoryBudgetManager>) -> Self {
        Self {
            raw: Mutex::new(Tier::new("raw", config.raw_capacity())),
            filtered: Mutex::new(Tier::new("filtered", config.filter_capacity())),
            budget: Some(budget),
        }
    }

    /// Create a standalone cache with the given tier capacities
    ///
    /// Zero capacities are raised to one.
    pub fn with_capacities(raw_capacity: usize, filter_capacity: usize) -> Self {
        let config = CacheConfig::new(raw_capacity, filter_capacity);
        Self {
            raw: Mutex::new(Tier::new("raw", config.raw_capacity())),
            filtered: Mutex::new(Tier::new("filtered", config.filter_capacity())),
            budget: None,
        }
    }

    /// Store a decoded page, evicting the least recently used raw page if
    /// the tier is full. Returns a read-only view of the stored page.
    pub fn put_raw_page(&self, book_id: BookId, page_index: u32, bitmap: PageBitmap) -> PageView {
        let bytes = bitmap.byte_size();
        let (view, displaced) = self
            .raw
            .lock()
            .insert(CacheKey::new(book_id, page_index), bitmap);
        self.charge(bytes);
        self.release(displaced);
        view
    }

    /// Look up a decoded page, marking it most recently used on a hit
    pub fn get_raw_page(&self, book_id: BookId, page_index: u32) -> Option<PageView> {
        self.raw.lock().get(&CacheKey::new(book_id, page_index))
    }

    /// Store a filter-applied page
    pub fn put_filtered_page(
        &self,
        book_id: BookId,
        page_index: u32,
        fingerprint: FilterFingerprint,
        bitmap: PageBitmap,
    ) -> PageView {
        let bytes = bitmap.byte_size();
        let (view, displaced) = self
            .filtered
            .lock()
            .insert(FilterCacheKey::new(book_id, page_index, fingerprint), bitmap);
        self.charge(bytes);
        self.release(displaced);
        view
    }

    /// Look up a filter-applied page
    pub fn get_filtered_page(
        &self,
        book_id: BookId,
        page_index: u32,
        fingerprint: FilterFingerprint,
    ) -> Option<PageView> {
        self.filtered
            .lock()
            .get(&FilterCacheKey::new(book_id, page_index, fingerprint))
    }

    /// Check for a raw page without touching recency or counters
    pub fn contains_raw(&self, book_id: BookId, page_index: u32) -> bool {
        self.raw
            .lock()
            .entries
            .contains(&CacheKey::new(book_id, page_index))
    }

    /// Check for a filtered page without touching recency or counters
    pub fn contains_filtered(
        &self,
        book_id: BookId,
        page_index: u32,
        fingerprint: FilterFingerprint,
    ) -> bool {
        self.filtered
            .lock()
            .entries
            .contains(&FilterCacheKey::new(book_id, page_index, fingerprint))
    }

    /// Remove and release one raw page. Returns false if it was not cached.
    pub fn remove_raw_page(&self, book_id: BookId, page_index: u32) -> bool {
        let removed = self.raw.lock().remove(&CacheKey::new(book_id, page_index));
        match removed {
            Some(entry) => {
                self.release(vec![entry]);
                true
            }
            None => false,
        }
    }

    /// Remove every raw and filtered page of `book_id`
    ///
    /// Returns the number of entries released. Other books are untouched.
    pub fn remove_book(&self, book_id: BookId) -> usize {
        let mut removed = self.raw.lock().remove_book(book_id);
        removed.extend(self.filtered.lock().remove_book(book_id));
        let count = removed.len();
        debug!(book_id, released = count, "removed book from page cache");
        self.release(removed);
        count
    }

    /// Release every filtered page
    pub fn clear_filter_cache(&self) {
        let drained = self.filtered.lock().drain();
        debug!(released = drained.len(), "cleared filter cache");
        self.release(drained);
    }

    /// Release every page in both tiers
    ///
    /// Hit and miss counters are kept; use [`reset_stats`] to zero them.
    ///
    /// [`reset_stats`]: RasterPageCache::reset_stats
    pub fn clear_all(&self) {
        let mut drained = self.raw.lock().drain();
        drained.extend(self.filtered.lock().drain());
        debug!(released = drained.len(), "cleared page cache");
        self.release(drained);
    }

    /// Evict up to `count` least recently used filtered pages
    pub fn trim_filter_tier(&self, count: usize) -> usize {
        let trimmed = self.filtered.lock().trim(count);
        let released = trimmed.len();
        self.release(trimmed);
        released
    }

    /// Evict up to `count` least recently used raw pages
    pub fn trim_raw_tier(&self, count: usize) -> usize {
        let trimmed = self.raw.lock().trim(count);
        let released = trimmed.len();
        self.release(trimmed);
        released
    }

    /// Zero hit, miss and eviction counters without touching entries
    pub fn reset_stats(&self) {
        self.raw.lock().reset_counters();
        self.filtered.lock().reset_counters();
    }

    /// Cumulative hit rate across both tiers since the last reset
    pub fn cache_hit_rate(&self) -> f64 {
        self.cache_stats().hit_rate()
    }

    /// Estimated bytes held by both tiers
    pub fn memory_usage(&self) -> usize {
        let raw = self.raw.lock().memory_used;
        let filtered = self.filtered.lock().memory_used;
        raw + filtered
    }

    /// Get current cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        let raw = self.raw.lock().stats();
        let filtered = self.filtered.lock().stats();
        CacheStats { raw, filtered }
    }

    fn charge(&self, bytes: usize) {
        if let Some(budget) = &self.budget {
            budget.record_allocation(bytes);
        }
    }

    /// Refund and release displaced entries. Called without any tier lock
    /// held, so a release that waits on a reader cannot stall other tiers.
    fn release(&self, entries: Vec<CacheEntry>) {
        for entry in entries {
            if let Some(budget) = &self.budget {
                budget.record_deallocation(entry.byte_size);
            }
            entry.bitmap.recycle();
        }
    }
}

impl Drop for RasterPageCache {
    fn drop(&mut self) {
        self.clear_all();
    }
}

impl std::fmt::Debug for RasterPageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RasterPageCache")
            .field("stats", &self.cache_stats())
            .finish()
    }
}
