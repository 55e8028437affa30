//! Chapter markup to content blocks
//!
//! A deliberately small scanner: chapter bodies are XHTML fragments, but the
//! paginator only needs ordered text runs and image references, so there is
//! no DOM. Invisible sections and comments are dropped, block structure is
//! reduced to newlines and entities are decoded with `html-escape`.

use serde::{Deserialize, Serialize};

/// Full-width double space put in front of every prose paragraph.
pub const PARAGRAPH_INDENT: &str = "\u{3000}\u{3000}";

/// Marker put in front of list items.
pub const BULLET: char = '\u{2022}';

/// One unit of chapter content, in source order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ContentBlock {
    Text(TextBlock),
    Image(ImageBlock),
}

/// Cleaned text: paragraphs separated by `\n`, at most one blank line in a row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TextBlock {
    pub text: String,
}

impl TextBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    /// Non-blank paragraphs in order
    pub fn paragraphs(&self) -> impl Iterator<Item = &str> {
        self.text.split('\n').filter(|p| !p.trim().is_empty())
    }

    pub fn is_empty(&self) -> bool {
        self.paragraphs().next().is_none()
    }
}

/// An embedded image reference, with its intrinsic size when the markup
/// declares one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageBlock {
    pub src: String,
    pub width: Option<f32>,
    pub height: Option<f32>,
}

impl ImageBlock {
    pub fn new(src: impl Into<String>) -> Self {
        Self {
            src: src.into(),
            width: None,
            height: None,
        }
    }

    pub fn with_size(mut self, width: f32, height: f32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    /// Intrinsic size if both dimensions are known and positive
    pub fn intrinsic_size(&self) -> Option<(f32, f32)> {
        match (self.width, self.height) {
            (Some(w), Some(h)) if w > 0.0 && h > 0.0 => Some((w, h)),
            _ => None,
        }
    }
}

/// Split chapter markup into text and image blocks in document order.
///
/// Without any image tag the whole cleaned body comes back as a single
/// [`TextBlock`], even when it is empty.
pub fn parse_blocks(markup: &str) -> Vec<ContentBlock> {
    let visible = strip_invisible(markup);
    let mut blocks = Vec::new();
    let mut text_start = 0;
    let mut cursor = 0;
    let mut found_image = false;

    while let Some(tag) = next_tag(&visible, cursor) {
        cursor = tag.end;
        if let Some(image) = image_from_tag(&tag) {
            found_image = true;
            push_text(&mut blocks, &visible[text_start..tag.start]);
            blocks.push(ContentBlock::Image(image));
            text_start = tag.end;
        }
    }

    if !found_image {
        return vec![ContentBlock::Text(TextBlock::new(clean_text(&visible)))];
    }

    push_text(&mut blocks, &visible[text_start..]);
    blocks
}

fn push_text(blocks: &mut Vec<ContentBlock>, fragment: &str) {
    let text = clean_text(fragment);
    if !text.is_empty() {
        blocks.push(ContentBlock::Text(TextBlock::new(text)));
    }
}

/// Reduce a markup fragment to indented plain-text paragraphs.
pub fn clean_text(fragment: &str) -> String {
    let mut flat = String::with_capacity(fragment.len());
    let mut cursor = 0;
    while let Some(tag) = next_tag(fragment, cursor) {
        push_run(&mut flat, &fragment[cursor..tag.start]);
        flat.push_str(tag_replacement(&tag));
        cursor = tag.end;
    }
    push_run(&mut flat, &fragment[cursor..]);

    let decoded = html_escape::decode_html_entities(&flat);

    let mut lines: Vec<String> = Vec::new();
    let mut pending_blank = false;
    for line in decoded.split('\n') {
        let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");
        if collapsed.is_empty() {
            pending_blank = !lines.is_empty();
            continue;
        }
        if pending_blank {
            lines.push(String::new());
            pending_blank = false;
        }
        if collapsed.starts_with(BULLET) {
            lines.push(collapsed);
        } else {
            lines.push(format!("{PARAGRAPH_INDENT}{collapsed}"));
        }
    }
    lines.join("\n")
}

/// Source whitespace is not significant; structure comes from tags only.
fn push_run(out: &mut String, run: &str) {
    out.extend(run.chars().map(|c| match c {
        '\n' | '\r' | '\t' => ' ',
        other => other,
    }));
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "dl", "dt", "dd",
    "blockquote", "section", "article", "aside", "header", "footer", "nav", "figure",
    "figcaption", "pre", "table", "tr",
];

fn tag_replacement(tag: &Tag<'_>) -> &'static str {
    match tag.name.as_str() {
        "br" | "hr" => "\n",
        "li" if !tag.closing => "\n\u{2022} ",
        name if tag.closing && BLOCK_TAGS.contains(&name) => "\n",
        _ => "",
    }
}

fn image_from_tag(tag: &Tag<'_>) -> Option<ImageBlock> {
    if tag.closing {
        return None;
    }
    let src = match tag.name.as_str() {
        "img" => attribute(tag.attrs, "src"),
        "image" => attribute(tag.attrs, "xlink:href").or_else(|| attribute(tag.attrs, "href")),
        _ => None,
    }?;
    if src.trim().is_empty() {
        return None;
    }

    Some(ImageBlock {
        src: src.trim().to_string(),
        width: attribute(tag.attrs, "width").and_then(|v| parse_dimension(&v)),
        height: attribute(tag.attrs, "height").and_then(|v| parse_dimension(&v)),
    })
}

fn parse_dimension(value: &str) -> Option<f32> {
    value
        .trim()
        .trim_end_matches("px")
        .parse::<f32>()
        .ok()
        .filter(|v| v.is_finite() && *v > 0.0)
}

struct Tag<'a> {
    start: usize,
    end: usize,
    name: String,
    closing: bool,
    attrs: &'a str,
}

/// Find the next `<...>` at or after `from`. `>` inside quoted attribute
/// values does not end the tag. An unterminated `<` ends the scan.
fn next_tag(source: &str, from: usize) -> Option<Tag<'_>> {
    let start = from + source.get(from..)?.find('<')?;
    let inner_start = start + 1;

    let mut quote: Option<char> = None;
    let mut close = None;
    for (offset, ch) in source[inner_start..].char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '>') => {
                close = Some(inner_start + offset);
                break;
            }
            _ => {}
        }
    }
    let close = close?;

    let inner = &source[inner_start..close];
    let (closing, inner) = match inner.strip_prefix('/') {
        Some(rest) => (true, rest),
        None => (false, inner),
    };
    let name_end = inner
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(inner.len());

    Some(Tag {
        start,
        end: close + 1,
        name: inner[..name_end].to_ascii_lowercase(),
        closing,
        attrs: &inner[name_end..],
    })
}

/// Value of attribute `name` (case-insensitive), entity-decoded.
fn attribute(attrs: &str, name: &str) -> Option<String> {
    let mut rest = attrs;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '/');
        if rest.is_empty() {
            return None;
        }

        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace() || c == '/')
            .unwrap_or(rest.len());
        let key = &rest[..key_end];
        rest = rest[key_end..].trim_start();

        let value = match rest.strip_prefix('=') {
            Some(after_eq) => {
                let after_eq = after_eq.trim_start();
                let (value, remainder) = match after_eq.chars().next() {
                    Some(q @ ('"' | '\'')) => {
                        let quoted = &after_eq[1..];
                        match quoted.find(q) {
                            Some(end) => (&quoted[..end], &quoted[end + 1..]),
                            None => (quoted, ""),
                        }
                    }
                    _ => {
                        let end = after_eq
                            .find(char::is_whitespace)
                            .unwrap_or(after_eq.len());
                        (&after_eq[..end], &after_eq[end..])
                    }
                };
                rest = remainder;
                Some(value)
            }
            None => None,
        };

        if key.eq_ignore_ascii_case(name) {
            return value.map(|v| html_escape::decode_html_entities(v).into_owned());
        }
    }
}

/// Drop comments and `head`/`script`/`style` elements with their content.
fn strip_invisible(markup: &str) -> String {
    let mut visible = strip_comments(markup);
    for name in ["head", "script", "style"] {
        visible = strip_element(&visible, name);
    }
    visible
}

fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut rest = source;
    while let Some(start) = rest.find("<!--") {
        out.push_str(&rest[..start]);
        rest = match rest[start + 4..].find("-->") {
            Some(end) => &rest[start + 4 + end + 3..],
            None => "",
        };
    }
    out.push_str(rest);
    out
}

fn strip_element(source: &str, name: &str) -> String {
    // ASCII lowercasing keeps byte offsets aligned with `source`
    let lower = source.to_ascii_lowercase();
    let open = format!("<{name}");
    let close = format!("</{name}");
    let mut out = String::with_capacity(source.len());
    let mut pos = 0;

    while let Some(found) = lower[pos..].find(&open) {
        let start = pos + found;
        let after_name = start + open.len();
        let at_boundary = lower[after_name..]
            .chars()
            .next()
            .map_or(true, |c| c == '>' || c == '/' || c.is_whitespace());
        if !at_boundary {
            // e.g. <header> while stripping <head>
            out.push_str(&source[pos..after_name]);
            pos = after_name;
            continue;
        }

        out.push_str(&source[pos..start]);
        let open_end = match lower[after_name..].find('>') {
            Some(gt) => after_name + gt + 1,
            None => {
                pos = source.len();
                break;
            }
        };
        if lower[..open_end].ends_with("/>") {
            pos = open_end;
            continue;
        }
        pos = match lower[open_end..].find(&close) {
            Some(found_close) => {
                let close_start = open_end + found_close;
                lower[close_start..]
                    .find('>')
                    .map_or(source.len(), |gt| close_start + gt + 1)
            }
            None => source.len(),
        };
    }

    out.push_str(&source[pos..]);
    out
}
