//! Single-pass pagination of chapter content into fixed-size pages
//!
//! Coordinates are relative to the content area (viewport minus margins):
//! `y = 0` is the top of the content area and no line's `bottom` exceeds
//! the content height.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blocks::{parse_blocks, ContentBlock, ImageBlock, TextBlock};
use crate::measure::{is_full_width, HeuristicMeasurer, TextMeasurer};
use crate::typography::{TypographyConfig, Viewport};

/// Share of the line box above the baseline, after half-leading.
const ASCENT_EM: f32 = 0.8;

/// Relative slack when testing whether an element still fits the page.
/// Summed line heights drift from the exact product in f32.
const FIT_TOLERANCE: f32 = 1e-5;

/// One laid-out line of text, or a single image
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextLine {
    pub text: String,
    pub top: f32,
    pub baseline: f32,
    pub bottom: f32,
    pub left: f32,
    /// Measured end of the text, or the image's right edge
    pub right: f32,
    pub is_title: bool,
    pub is_paragraph_start: bool,
    pub is_paragraph_end: bool,
    pub is_image: bool,
    /// Image reference for image lines
    pub image_src: Option<String>,
    /// Chapter character offset of the first character on this line
    pub char_start: usize,
    /// One past the last character; images span exactly one position
    pub char_end: usize,
}

impl TextLine {
    pub fn height(&self) -> f32 {
        self.bottom - self.top
    }

    pub fn char_len(&self) -> usize {
        self.char_end - self.char_start
    }
}

/// One page of a chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPage {
    /// Zero-based page index within the chapter
    pub index: usize,
    pub chapter_index: usize,
    pub chapter_title: Option<String>,
    pub lines: Vec<TextLine>,
    /// Realized content height: bottom of the last line
    pub height: f32,
    /// Total pages in the chapter
    pub page_count: usize,
}

impl TextPage {
    /// Character offset of the first position on this page
    pub fn char_start(&self) -> usize {
        self.lines.first().map_or(0, |line| line.char_start)
    }

    /// One past the last character position on this page
    pub fn char_end(&self) -> usize {
        self.lines.last().map_or(0, |line| line.char_end)
    }

    /// Plain text of the page with one line per `\n`
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .filter(|line| !line.is_image)
            .map(|line| line.text.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Result of one layout pass over a chapter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageLayout {
    pub pages: Vec<TextPage>,
    /// Character positions in the chapter, including one per image
    pub total_chars: usize,
}

impl PageLayout {
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn page(&self, index: usize) -> Option<&TextPage> {
        self.pages.get(index)
    }

    /// Index of the page holding chapter position `offset`.
    ///
    /// Offsets past the end resolve to the last page, so a bookmark saved
    /// against a longer layout still lands somewhere sensible.
    pub fn page_for_char_offset(&self, offset: usize) -> Option<usize> {
        if self.pages.is_empty() {
            return None;
        }
        let after = self.pages.partition_point(|page| page.char_start() <= offset);
        Some(after.saturating_sub(1))
    }
}

/// Chapter input to pagination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterContent {
    pub index: usize,
    pub title: Option<String>,
    pub blocks: Vec<ContentBlock>,
}

impl ChapterContent {
    pub fn new(index: usize, title: Option<String>, blocks: Vec<ContentBlock>) -> Self {
        Self {
            index,
            title,
            blocks,
        }
    }

    /// Parse chapter markup into blocks
    pub fn from_markup(index: usize, title: Option<String>, markup: &str) -> Self {
        Self::new(index, title, parse_blocks(markup))
    }

    /// True when the body has no paragraph and no image
    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| match block {
            ContentBlock::Text(text) => text.is_empty(),
            ContentBlock::Image(_) => false,
        })
    }
}

/// Lays chapters out into pages
#[derive(Clone)]
pub struct TextPaginationEngine {
    config: TypographyConfig,
    measurer: Arc<dyn TextMeasurer>,
}

impl TextPaginationEngine {
    /// Create an engine using the heuristic glyph-width measurer
    pub fn new(config: TypographyConfig) -> Self {
        Self::with_measurer(config, Arc::new(HeuristicMeasurer))
    }

    pub fn with_measurer(config: TypographyConfig, measurer: Arc<dyn TextMeasurer>) -> Self {
        Self {
            config: config.validated(),
            measurer,
        }
    }

    pub fn config(&self) -> &TypographyConfig {
        &self.config
    }

    /// Lay out `chapter` for `viewport`.
    ///
    /// An empty body or a content area with no positive width and height
    /// gives an empty layout.
    pub fn paginate(&self, chapter: &ChapterContent, viewport: Viewport) -> PageLayout {
        let (width, height) = self.config.content_size(viewport);
        if !(width > 0.0 && height > 0.0) || !width.is_finite() || !height.is_finite() {
            debug!(
                chapter = chapter.index,
                width, height, "content area is empty, nothing to lay out"
            );
            return PageLayout::default();
        }
        if chapter.is_empty() {
            debug!(chapter = chapter.index, "chapter body is empty");
            return PageLayout::default();
        }

        let mut builder = PageBuilder::new(chapter, width, height);

        if let Some(title) = chapter.title.as_deref().filter(|t| !t.trim().is_empty()) {
            self.layout_title(&mut builder, title);
        }

        for block in &chapter.blocks {
            match block {
                ContentBlock::Text(text) => self.layout_text(&mut builder, text),
                ContentBlock::Image(image) => self.layout_image(&mut builder, image),
            }
        }

        let layout = builder.finish();
        debug!(
            chapter = chapter.index,
            pages = layout.pages.len(),
            chars = layout.total_chars,
            "paginated chapter"
        );
        layout
    }

    fn layout_title(&self, builder: &mut PageBuilder, title: &str) {
        let size = self.config.title_size;
        let line_height = self.config.title_line_height();
        let lines = wrap_text(self.measurer.as_ref(), title.trim(), size, builder.width);
        let count = lines.len();
        for (i, text) in lines.into_iter().enumerate() {
            let line_width = self.measurer.measure(&text, size);
            builder.push_text_line(text, size, line_width, line_height, LineKind {
                title: true,
                paragraph_start: i == 0,
                paragraph_end: i + 1 == count,
            });
        }
        builder.advance(line_height / 2.0);
    }

    fn layout_text(&self, builder: &mut PageBuilder, block: &TextBlock) {
        let size = self.config.text_size;
        let line_height = self.config.body_line_height();
        for paragraph in block.paragraphs() {
            let lines = wrap_text(self.measurer.as_ref(), paragraph, size, builder.width);
            let count = lines.len();
            for (i, text) in lines.into_iter().enumerate() {
                let line_width = self.measurer.measure(&text, size);
                builder.push_text_line(text, size, line_width, line_height, LineKind {
                    title: false,
                    paragraph_start: i == 0,
                    paragraph_end: i + 1 == count,
                });
            }
            builder.advance(self.config.paragraph_gap());
        }
    }

    fn layout_image(&self, builder: &mut PageBuilder, image: &ImageBlock) {
        let max_height = builder.height * self.config.max_image_fraction;
        let (width, height) = match image.intrinsic_size() {
            Some((w, h)) => {
                // Fit inside the content width and max height, never upscale
                let scale = (builder.width / w).min(max_height / h).min(1.0);
                (w * scale, h * scale)
            }
            None => {
                let height = (builder.height * self.config.default_image_fraction).min(max_height);
                (builder.width, height)
            }
        };
        builder.push_image(image.src.clone(), width, height);
        builder.advance(self.config.image_spacing);
    }
}

impl std::fmt::Debug for TextPaginationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextPaginationEngine")
            .field("config", &self.config)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
struct LineKind {
    title: bool,
    paragraph_start: bool,
    paragraph_end: bool,
}

/// Forward-pass accumulator
struct PageBuilder {
    chapter_index: usize,
    chapter_title: Option<String>,
    width: f32,
    height: f32,
    pages: Vec<TextPage>,
    lines: Vec<TextLine>,
    current_y: f32,
    char_offset: usize,
}

impl PageBuilder {
    fn new(chapter: &ChapterContent, width: f32, height: f32) -> Self {
        Self {
            chapter_index: chapter.index,
            chapter_title: chapter.title.clone(),
            width,
            height,
            pages: Vec::new(),
            lines: Vec::new(),
            current_y: 0.0,
            char_offset: 0,
        }
    }

    /// Reserve `height` for the next element, breaking the page first if it
    /// would overflow a non-empty page. Returns the element's top.
    fn reserve(&mut self, height: f32) -> f32 {
        let limit = self.height + self.height * FIT_TOLERANCE;
        if self.current_y + height > limit && !self.lines.is_empty() {
            self.close_page();
        }
        let top = self.current_y;
        self.current_y += height;
        top
    }

    fn advance(&mut self, gap: f32) {
        if !self.lines.is_empty() {
            self.current_y += gap;
        }
    }

    fn push_text_line(
        &mut self,
        text: String,
        size: f32,
        line_width: f32,
        line_height: f32,
        kind: LineKind,
    ) {
        let top = self.reserve(line_height);
        // An oversized line sits alone on its page, clipped to the content box
        let bottom = (top + line_height).min(self.height);
        let baseline = (top + (line_height - size) / 2.0 + size * ASCENT_EM).min(bottom);
        let chars = text.chars().count();

        self.lines.push(TextLine {
            text,
            top,
            baseline,
            bottom,
            left: 0.0,
            right: line_width.min(self.width),
            is_title: kind.title,
            is_paragraph_start: kind.paragraph_start,
            is_paragraph_end: kind.paragraph_end,
            is_image: false,
            image_src: None,
            char_start: self.char_offset,
            char_end: self.char_offset + chars,
        });
        self.char_offset += chars;
    }

    fn push_image(&mut self, src: String, width: f32, height: f32) {
        let top = self.reserve(height);
        let bottom = (top + height).min(self.height);
        let left = ((self.width - width) / 2.0).max(0.0);

        self.lines.push(TextLine {
            text: String::new(),
            top,
            baseline: bottom,
            bottom,
            left,
            right: left + width,
            is_title: false,
            is_paragraph_start: false,
            is_paragraph_end: false,
            is_image: true,
            image_src: Some(src),
            char_start: self.char_offset,
            char_end: self.char_offset + 1,
        });
        self.char_offset += 1;
    }

    fn close_page(&mut self) {
        let lines = std::mem::take(&mut self.lines);
        let height = lines.last().map_or(0.0, |line| line.bottom);
        self.pages.push(TextPage {
            index: self.pages.len(),
            chapter_index: self.chapter_index,
            chapter_title: self.chapter_title.clone(),
            lines,
            height,
            page_count: 0,
        });
        self.current_y = 0.0;
    }

    fn finish(mut self) -> PageLayout {
        if !self.lines.is_empty() {
            self.close_page();
        }
        let page_count = self.pages.len();
        for page in &mut self.pages {
            page.page_count = page_count;
        }
        PageLayout {
            pages: self.pages,
            total_chars: self.char_offset,
        }
    }
}

/// Greedy line breaking at spaces and between full-width glyphs.
///
/// A token wider than `max_width` is broken between characters; every line
/// holds at least one character, so a width narrower than one glyph still
/// terminates.
pub fn wrap_text(
    measurer: &dyn TextMeasurer,
    text: &str,
    size_px: f32,
    max_width: f32,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut pending_space = false;

    for atom in atoms(text) {
        let atom = match atom {
            Atom::Space => {
                pending_space = !line.is_empty();
                continue;
            }
            Atom::Word(word) => word,
        };

        let mut candidate = line.clone();
        if pending_space {
            candidate.push(' ');
        }
        candidate.push_str(atom);
        pending_space = false;

        if measurer.measure(&candidate, size_px) <= max_width {
            line = candidate;
            continue;
        }

        if !line.is_empty() {
            lines.push(std::mem::take(&mut line));
        }

        if measurer.measure(atom, size_px) <= max_width {
            line.push_str(atom);
            continue;
        }

        for ch in atom.chars() {
            let mut candidate = line.clone();
            candidate.push(ch);
            if !line.is_empty() && measurer.measure(&candidate, size_px) > max_width {
                lines.push(std::mem::replace(&mut line, ch.to_string()));
            } else {
                line = candidate;
            }
        }
    }

    if !line.is_empty() {
        lines.push(line);
    }
    lines
}

enum Atom<'a> {
    Space,
    Word(&'a str),
}

/// Break units: whitespace runs, Latin words, single full-width glyphs.
fn atoms(text: &str) -> Vec<Atom<'_>> {
    let mut atoms = Vec::new();
    let mut word_start: Option<usize> = None;

    for (i, ch) in text.char_indices() {
        let full_width = is_full_width(ch);
        if full_width || ch.is_whitespace() {
            if let Some(start) = word_start.take() {
                atoms.push(Atom::Word(&text[start..i]));
            }
            if full_width {
                atoms.push(Atom::Word(&text[i..i + ch.len_utf8()]));
            } else if !matches!(atoms.last(), Some(Atom::Space)) {
                atoms.push(Atom::Space);
            }
        } else if word_start.is_none() {
            word_start = Some(i);
        }
    }
    if let Some(start) = word_start {
        atoms.push(Atom::Word(&text[start..]));
    }
    atoms
}
