//! Reader text layout
//!
//! Turns chapter markup into ordered content blocks and lays those blocks out
//! into fixed-size pages of positioned lines. Layout is pure: no I/O, no
//! shared state, identical input gives identical pages.

pub mod blocks;
pub mod measure;
pub mod paginate;
pub mod typography;

pub use blocks::{clean_text, parse_blocks, ContentBlock, ImageBlock, TextBlock, BULLET, PARAGRAPH_INDENT};
pub use measure::{HeuristicMeasurer, MonospaceMeasurer, TextMeasurer};
pub use paginate::{wrap_text, ChapterContent, PageLayout, TextLine, TextPage, TextPaginationEngine};
pub use typography::{Margins, TypographyConfig, Viewport};
