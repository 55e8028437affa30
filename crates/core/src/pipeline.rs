//! Page image pipeline
//!
//! Ties the external decoder to the two cache tiers:
//!
//! 1. Look up the filter tier (skipped for identity filters)
//! 2. Look up the raw tier
//! 3. Decode on miss, downsampled to the target size
//! 4. Cache the raw page, apply the filter, cache the filtered page
//!
//! After every insert the memory budget is checked. On critical pressure the
//! filter tier is trimmed first, then the raw tier, until usage is back at
//! the target utilization.

use std::sync::Arc;

use image::RgbaImage;
use reader_cache::{
    BookId, CacheConfig, MemoryBudgetManager, MemoryPressure, PageBitmap, PageFilter, PageView,
    RasterPageCache,
};
use tracing::{debug, trace, warn};

/// Error type returned by decoders
pub type DecodeError = Box<dyn std::error::Error + Send + Sync>;

/// Source of decoded page images, keyed by book and page.
pub trait PageDecoder: Send + Sync {
    /// Full-resolution size of a page, without decoding pixels
    fn page_size(&self, book_id: BookId, page_index: u32) -> Result<(u32, u32), DecodeError>;

    /// Decode a page, reducing each dimension by `sample_size` (a power of two)
    fn decode(
        &self,
        book_id: BookId,
        page_index: u32,
        sample_size: u32,
    ) -> Result<RgbaImage, DecodeError>;
}

/// Errors from loading a page through the pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("failed to decode page {page_index} of book {book_id}")]
    Decode {
        book_id: BookId,
        page_index: u32,
        #[source]
        source: DecodeError,
    },

    #[error("decoder returned an empty image for page {page_index} of book {book_id}")]
    EmptyImage { book_id: BookId, page_index: u32 },
}

/// Decoder-to-cache facade used by the render surface
pub struct PagePipeline<D> {
    decoder: D,
    cache: Arc<RasterPageCache>,
    budget: Arc<MemoryBudgetManager>,
}

impl<D: PageDecoder> PagePipeline<D> {
    /// Create a pipeline with a budget that probes system memory
    pub fn new(decoder: D, config: &CacheConfig) -> Self {
        Self::with_budget(decoder, config, Arc::new(MemoryBudgetManager::new(config.memory)))
    }

    /// Create a pipeline charging its cache to an existing budget
    pub fn with_budget(decoder: D, config: &CacheConfig, budget: Arc<MemoryBudgetManager>) -> Self {
        let config = config.validated();
        let cache = Arc::new(RasterPageCache::new(&config, Arc::clone(&budget)));
        Self {
            decoder,
            cache,
            budget,
        }
    }

    pub fn cache(&self) -> &Arc<RasterPageCache> {
        &self.cache
    }

    pub fn budget(&self) -> &Arc<MemoryBudgetManager> {
        &self.budget
    }

    pub fn decoder(&self) -> &D {
        &self.decoder
    }

    /// Load a page with `filter` applied.
    ///
    /// `target` is the display size in pixels; decodes larger than twice the
    /// target are downsampled. `None` decodes at full resolution.
    pub fn load_page(
        &self,
        book_id: BookId,
        page_index: u32,
        filter: &PageFilter,
        target: Option<(u32, u32)>,
    ) -> Result<PageView, PipelineError> {
        if filter.is_identity() {
            return self.load_raw_page(book_id, page_index, target);
        }

        let fingerprint = filter.fingerprint();
        if let Some(view) = self.cache.get_filtered_page(book_id, page_index, fingerprint) {
            trace!(book_id, page_index, "filtered page cache hit");
            return Ok(view);
        }

        let raw = self.raw_pixels(book_id, page_index, target)?;
        let filtered = filter.apply(&raw);
        let view =
            self.cache
                .put_filtered_page(book_id, page_index, fingerprint, PageBitmap::new(filtered));
        self.relieve_memory_pressure();
        Ok(view)
    }

    /// Load a page without any filter
    pub fn load_raw_page(
        &self,
        book_id: BookId,
        page_index: u32,
        target: Option<(u32, u32)>,
    ) -> Result<PageView, PipelineError> {
        if let Some(view) = self.cache.get_raw_page(book_id, page_index) {
            trace!(book_id, page_index, "raw page cache hit");
            return Ok(view);
        }
        let image = self.decode(book_id, page_index, target)?;
        let view = self.cache.put_raw_page(book_id, page_index, PageBitmap::new(image));
        self.relieve_memory_pressure();
        Ok(view)
    }

    /// Decode pages that are not cached yet into the raw tier.
    ///
    /// Returns the number of pages decoded. Stops at the first decode error.
    pub fn prefetch<I>(
        &self,
        book_id: BookId,
        pages: I,
        target: Option<(u32, u32)>,
    ) -> Result<usize, PipelineError>
    where
        I: IntoIterator<Item = u32>,
    {
        let mut decoded = 0;
        for page_index in pages {
            if self.cache.contains_raw(book_id, page_index) {
                continue;
            }
            let image = self.decode(book_id, page_index, target)?;
            self.cache.put_raw_page(book_id, page_index, PageBitmap::new(image));
            self.relieve_memory_pressure();
            decoded += 1;
        }
        debug!(book_id, decoded, "prefetched pages");
        Ok(decoded)
    }

    /// Drop every cached page of a book
    pub fn close_book(&self, book_id: BookId) -> usize {
        self.cache.remove_book(book_id)
    }

    /// Check the budget and trim the cache on critical pressure.
    ///
    /// The most recently used entry of each tier is kept so a view handed
    /// out by the current call stays readable.
    pub fn relieve_memory_pressure(&self) -> MemoryPressure {
        let pressure = self.budget.check_memory_pressure();
        if pressure != MemoryPressure::Critical {
            return pressure;
        }

        let over = self.budget.bytes_to_evict();
        let mut trimmed = 0;
        while self.budget.bytes_to_evict() > 0
            && self.cache.cache_stats().filtered.entries > 1
            && self.cache.trim_filter_tier(1) > 0
        {
            trimmed += 1;
        }
        while self.budget.bytes_to_evict() > 0
            && self.cache.cache_stats().raw.entries > 1
            && self.cache.trim_raw_tier(1) > 0
        {
            trimmed += 1;
        }

        let after = self.budget.pressure();
        warn!(
            over,
            trimmed,
            remaining = self.budget.bytes_to_evict(),
            pressure = ?after,
            "trimmed page cache under critical memory pressure"
        );
        after
    }

    // Raw pixels for filtering; a page evicted between lookup and read is
    // decoded again.
    fn raw_pixels(
        &self,
        book_id: BookId,
        page_index: u32,
        target: Option<(u32, u32)>,
    ) -> Result<RgbaImage, PipelineError> {
        if let Some(image) = self
            .cache
            .get_raw_page(book_id, page_index)
            .and_then(|view| view.to_image())
        {
            return Ok(image);
        }
        let image = self.decode(book_id, page_index, target)?;
        self.cache
            .put_raw_page(book_id, page_index, PageBitmap::new(image.clone()));
        self.relieve_memory_pressure();
        Ok(image)
    }

    fn decode(
        &self,
        book_id: BookId,
        page_index: u32,
        target: Option<(u32, u32)>,
    ) -> Result<RgbaImage, PipelineError> {
        let wrap = |source| PipelineError::Decode {
            book_id,
            page_index,
            source,
        };

        let sample_size = match target {
            Some((target_width, target_height)) => {
                let (width, height) = self.decoder.page_size(book_id, page_index).map_err(wrap)?;
                MemoryBudgetManager::calculate_sample_size(width, height, target_width, target_height)
            }
            None => 1,
        };

        let image = self
            .decoder
            .decode(book_id, page_index, sample_size)
            .map_err(wrap)?;
        if image.width() == 0 || image.height() == 0 {
            return Err(PipelineError::EmptyImage {
                book_id,
                page_index,
            });
        }
        debug!(
            book_id,
            page_index,
            sample_size,
            width = image.width(),
            height = image.height(),
            "decoded page"
        );
        Ok(image)
    }
}

impl<D> std::fmt::Debug for PagePipeline<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PagePipeline")
            .field("cache", &self.cache)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use reader_cache::{FixedMemoryProbe, MemoryBudgetConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Produces solid grey pages of a fixed size and counts decodes
    struct SolidDecoder {
        width: u32,
        height: u32,
        decodes: AtomicUsize,
    }

    impl SolidDecoder {
        fn new(width: u32, height: u32) -> Self {
            Self {
                width,
                height,
                decodes: AtomicUsize::new(0),
            }
        }

        fn decodes(&self) -> usize {
            self.decodes.load(Ordering::SeqCst)
        }
    }

    impl PageDecoder for SolidDecoder {
        fn page_size(&self, _book_id: BookId, _page_index: u32) -> Result<(u32, u32), DecodeError> {
            Ok((self.width, self.height))
        }

        fn decode(
            &self,
            _book_id: BookId,
            page_index: u32,
            sample_size: u32,
        ) -> Result<RgbaImage, DecodeError> {
            if page_index == 99 {
                return Err("corrupt page".into());
            }
            self.decodes.fetch_add(1, Ordering::SeqCst);
            let shade = (page_index % 200) as u8 + 20;
            Ok(RgbaImage::from_pixel(
                self.width / sample_size,
                self.height / sample_size,
                Rgba([shade, shade, shade, 255]),
            ))
        }
    }

    fn pipeline(width: u32, height: u32) -> PagePipeline<SolidDecoder> {
        let budget = Arc::new(MemoryBudgetManager::with_probe(
            MemoryBudgetConfig::default(),
            FixedMemoryProbe(1 << 30),
        ));
        PagePipeline::with_budget(SolidDecoder::new(width, height), &CacheConfig::new(4, 2), budget)
    }

    #[test]
    fn test_raw_load_is_cached() {
        let pipeline = pipeline(40, 60);
        let first = pipeline.load_raw_page(1, 0, None).unwrap();
        let second = pipeline.load_raw_page(1, 0, None).unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(pipeline.decoder().decodes(), 1);
        assert_eq!(pipeline.cache().cache_stats().raw.hits, 1);
    }

    #[test]
    fn test_identity_filter_skips_filter_tier() {
        let pipeline = pipeline(40, 60);
        pipeline.load_page(1, 0, &PageFilter::default(), None).unwrap();

        let stats = pipeline.cache().cache_stats();
        assert_eq!(stats.raw.entries, 1);
        assert_eq!(stats.filtered.entries, 0);
    }

    #[test]
    fn test_filtered_load_reuses_raw_page() {
        let pipeline = pipeline(40, 60);
        let dark = PageFilter::default().with_invert(true);
        let grey = PageFilter::default().with_grayscale(true);

        pipeline.load_raw_page(1, 0, None).unwrap();
        let inverted = pipeline.load_page(1, 0, &dark, None).unwrap();
        pipeline.load_page(1, 0, &grey, None).unwrap();

        assert_eq!(pipeline.decoder().decodes(), 1);
        let stats = pipeline.cache().cache_stats();
        assert_eq!(stats.filtered.entries, 2);

        let pixels = inverted.to_image().unwrap();
        assert_eq!(pixels.get_pixel(0, 0).0, [235, 235, 235, 255]);

        // Second request for the same filter is served from the filter tier
        let again = pipeline.load_page(1, 0, &dark, None).unwrap();
        assert_eq!(again.id(), inverted.id());
        assert_eq!(pipeline.cache().cache_stats().filtered.hits, 1);
    }

    #[test]
    fn test_target_size_downsamples() {
        let pipeline = pipeline(400, 800);
        let view = pipeline.load_raw_page(1, 0, Some((100, 200))).unwrap();
        assert_eq!((view.width(), view.height()), (100, 200));

        let full = pipeline.load_raw_page(1, 1, Some((400, 800))).unwrap();
        assert_eq!((full.width(), full.height()), (400, 800));
    }

    #[test]
    fn test_decode_error_propagates() {
        let pipeline = pipeline(40, 60);
        let err = pipeline.load_raw_page(1, 99, None).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Decode {
                book_id: 1,
                page_index: 99,
                ..
            }
        ));
        assert!(!pipeline.cache().contains_raw(1, 99));
    }

    #[test]
    fn test_empty_image_is_an_error() {
        let pipeline = pipeline(0, 10);
        let err = pipeline.load_raw_page(1, 0, None).unwrap_err();
        assert!(matches!(err, PipelineError::EmptyImage { .. }));
    }

    #[test]
    fn test_prefetch_skips_cached_pages() {
        let pipeline = pipeline(20, 20);
        pipeline.load_raw_page(3, 1, None).unwrap();

        let decoded = pipeline.prefetch(3, 0..3, None).unwrap();
        assert_eq!(decoded, 2);
        assert_eq!(pipeline.decoder().decodes(), 3);
        assert!((0..3).all(|page| pipeline.cache().contains_raw(3, page)));
    }

    #[test]
    fn test_close_book() {
        let pipeline = pipeline(20, 20);
        pipeline.prefetch(1, 0..2, None).unwrap();
        pipeline.prefetch(2, 0..2, None).unwrap();

        assert_eq!(pipeline.close_book(1), 2);
        assert!(pipeline.cache().contains_raw(2, 0));
        assert!(!pipeline.cache().contains_raw(1, 0));
    }

    #[test]
    fn test_critical_pressure_trims_cache() {
        // 10_000 byte budget; each 20x20 page is 1_600 bytes
        let budget = Arc::new(MemoryBudgetManager::with_probe(
            MemoryBudgetConfig::default(),
            FixedMemoryProbe(40_000),
        ));
        let warnings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&warnings);
        budget.add_memory_warning_listener(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let pipeline = PagePipeline::with_budget(
            SolidDecoder::new(20, 20),
            &CacheConfig::new(12, 6),
            Arc::clone(&budget),
        );

        pipeline.prefetch(1, 0..6, None).unwrap();

        let target = (budget.max_allowed_memory() as f64 * 0.7) as usize;
        assert!(budget.current_usage() <= target);
        assert!(warnings.load(Ordering::SeqCst) >= 1);
        // Oldest pages went first
        assert!(!pipeline.cache().contains_raw(1, 0));
        assert!(pipeline.cache().contains_raw(1, 5));
        assert_eq!(budget.current_usage(), pipeline.cache().memory_usage());
    }
}
