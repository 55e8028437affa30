//! Reader core library
//!
//! Page image pipeline and reader configuration, plus re-exports of the
//! cache, layout and scheduler crates so callers depend on one crate.

pub mod config;
pub mod pipeline;

pub use config::{ConfigError, ConfigKey, ReaderConfig};
pub use pipeline::{DecodeError, PageDecoder, PagePipeline, PipelineError};

pub use reader_cache::{
    BookId, CacheConfig, CacheStats, FilterFingerprint, MemoryBudgetConfig, MemoryBudgetManager,
    MemoryPressure, MemoryReport, PageBitmap, PageFilter, PageView, RasterPageCache, TierStats,
};
pub use reader_layout::{
    ChapterContent, ContentBlock, Margins, PageLayout, TextLine, TextMeasurer, TextPage,
    TextPaginationEngine, TypographyConfig, Viewport,
};
pub use reader_scheduler::{
    CancellationToken, LayoutOutcome, LayoutRequest, LayoutService, LayoutTicket, SchedulerError,
};
