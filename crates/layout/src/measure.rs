//! Text measurement seam
//!
//! Pagination only needs advance widths. A renderer with a real font engine
//! implements [`TextMeasurer`]; without one, [`HeuristicMeasurer`] keeps the
//! layout deterministic from per-glyph width classes.

/// Measures the rendered width of a run of text.
pub trait TextMeasurer: Send + Sync {
    /// Width in pixels of `text` set at `size_px`.
    fn measure(&self, text: &str, size_px: f32) -> f32;
}

/// Per-glyph width estimate in ems.
///
/// CJK ideographs, kana, hangul and full-width forms are one em wide; Latin
/// glyphs fall into narrow/regular/wide classes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicMeasurer;

impl TextMeasurer for HeuristicMeasurer {
    fn measure(&self, text: &str, size_px: f32) -> f32 {
        text.chars().map(glyph_em_width).sum::<f32>() * size_px
    }
}

/// Every glyph advances by the same fraction of the font size.
#[derive(Debug, Clone, Copy)]
pub struct MonospaceMeasurer {
    pub advance_em: f32,
}

impl MonospaceMeasurer {
    pub fn new(advance_em: f32) -> Self {
        Self { advance_em }
    }
}

impl Default for MonospaceMeasurer {
    fn default() -> Self {
        Self { advance_em: 0.6 }
    }
}

impl TextMeasurer for MonospaceMeasurer {
    fn measure(&self, text: &str, size_px: f32) -> f32 {
        text.chars().count() as f32 * self.advance_em * size_px
    }
}

/// True for glyphs a CJK font sets on a full em square.
pub fn is_full_width(ch: char) -> bool {
    matches!(ch as u32,
        0x1100..=0x115F      // Hangul Jamo
        | 0x2E80..=0x303E    // CJK radicals, punctuation
        | 0x3041..=0x33FF    // kana, CJK symbols
        | 0x3400..=0x4DBF    // CJK extension A
        | 0x4E00..=0x9FFF    // CJK unified ideographs
        | 0xA960..=0xA97F
        | 0xAC00..=0xD7A3    // Hangul syllables
        | 0xF900..=0xFAFF
        | 0xFE30..=0xFE4F
        | 0xFF00..=0xFF60    // full-width forms
        | 0xFFE0..=0xFFE6
        | 0x20000..=0x2FFFD
    )
}

fn glyph_em_width(ch: char) -> f32 {
    if is_full_width(ch) {
        return 1.0;
    }
    match ch {
        ' ' | '\u{00A0}' => 0.32,
        '\t' => 1.28,
        'i' | 'l' | 'I' | '|' | '!' => 0.24,
        '.' | ',' | ':' | ';' | '\'' | '"' | '`' => 0.23,
        '-' | '\u{2010}'..='\u{2014}' => 0.34,
        '(' | ')' | '[' | ']' | '{' | '}' => 0.30,
        'f' | 't' | 'j' | 'r' => 0.34,
        'm' | 'w' | 'M' | 'W' | '@' | '%' | '&' | '#' => 0.74,
        '\u{2022}' => 0.45,
        c if c.is_ascii_digit() => 0.52,
        c if c.is_ascii_uppercase() => 0.64,
        c if c.is_ascii_lowercase() => 0.52,
        c if c.is_whitespace() => 0.32,
        c if c.is_ascii_punctuation() => 0.42,
        _ => 0.56,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cjk_glyphs_are_one_em() {
        let m = HeuristicMeasurer;
        assert_eq!(m.measure("漢字", 20.0), 40.0);
        assert_eq!(m.measure("\u{3000}", 10.0), 10.0);
        assert_eq!(m.measure("かな", 10.0), 20.0);
    }

    #[test]
    fn test_narrow_latin_is_narrower_than_wide() {
        let m = HeuristicMeasurer;
        assert!(m.measure("iii", 16.0) < m.measure("mmm", 16.0));
        assert_eq!(m.measure("", 16.0), 0.0);
    }

    #[test]
    fn test_width_scales_with_size() {
        let m = HeuristicMeasurer;
        let small = m.measure("Reader", 10.0);
        let large = m.measure("Reader", 20.0);
        assert!((large - 2.0 * small).abs() < 1e-3);
    }

    #[test]
    fn test_monospace_counts_chars() {
        let m = MonospaceMeasurer::new(0.5);
        assert_eq!(m.measure("abcd", 10.0), 20.0);
        assert_eq!(m.measure("漢字", 10.0), 10.0);
    }
}
