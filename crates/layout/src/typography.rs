//! Typography and page geometry settings

use serde::{Deserialize, Serialize};

/// Page margins in pixels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Margins {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

impl Margins {
    pub fn uniform(margin: f32) -> Self {
        Self {
            top: margin,
            right: margin,
            bottom: margin,
            left: margin,
        }
    }

    pub fn horizontal(&self) -> f32 {
        self.left + self.right
    }

    pub fn vertical(&self) -> f32 {
        self.top + self.bottom
    }
}

impl Default for Margins {
    fn default() -> Self {
        Self {
            top: 24.0,
            right: 16.0,
            bottom: 24.0,
            left: 16.0,
        }
    }
}

/// Viewport size in pixels, as reported by the render surface
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Reader typography settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypographyConfig {
    /// Body text size in pixels
    pub text_size: f32,
    /// Line height as a multiple of the font size
    pub line_spacing: f32,
    /// Gap after each paragraph, as a multiple of the body text size
    pub paragraph_spacing: f32,
    /// Chapter title size in pixels
    pub title_size: f32,
    pub margins: Margins,
    /// Height of an image without intrinsic size, as a share of content height
    pub default_image_fraction: f32,
    /// Upper bound on image height as a share of content height
    pub max_image_fraction: f32,
    /// Gap after each image in pixels
    pub image_spacing: f32,
}

impl Default for TypographyConfig {
    fn default() -> Self {
        Self {
            text_size: 18.0,
            line_spacing: 1.5,
            paragraph_spacing: 0.5,
            title_size: 24.0,
            margins: Margins::default(),
            default_image_fraction: 0.6,
            max_image_fraction: 0.8,
            image_spacing: 12.0,
        }
    }
}

impl TypographyConfig {
    pub fn with_text_size(mut self, size: f32) -> Self {
        self.text_size = size;
        self
    }

    pub fn with_line_spacing(mut self, spacing: f32) -> Self {
        self.line_spacing = spacing;
        self
    }

    pub fn with_paragraph_spacing(mut self, spacing: f32) -> Self {
        self.paragraph_spacing = spacing;
        self
    }

    pub fn with_title_size(mut self, size: f32) -> Self {
        self.title_size = size;
        self
    }

    pub fn with_margins(mut self, margins: Margins) -> Self {
        self.margins = margins;
        self
    }

    pub fn with_image_fractions(mut self, default_fraction: f32, max_fraction: f32) -> Self {
        self.default_image_fraction = default_fraction;
        self.max_image_fraction = max_fraction;
        self
    }

    pub fn with_image_spacing(mut self, spacing: f32) -> Self {
        self.image_spacing = spacing;
        self
    }

    /// Height of one body line
    pub fn body_line_height(&self) -> f32 {
        self.text_size * self.line_spacing
    }

    /// Height of one title line
    pub fn title_line_height(&self) -> f32 {
        self.title_size * self.line_spacing
    }

    /// Gap appended after every paragraph
    pub fn paragraph_gap(&self) -> f32 {
        self.text_size * self.paragraph_spacing
    }

    /// Content area left after margins; may be zero or negative for tiny
    /// viewports, which pagination treats as nothing to lay out.
    pub fn content_size(&self, viewport: Viewport) -> (f32, f32) {
        (
            viewport.width - self.margins.horizontal(),
            viewport.height - self.margins.vertical(),
        )
    }

    /// Returns a copy with out-of-range values replaced or clamped.
    pub fn validated(self) -> Self {
        let defaults = Self::default();
        let positive = |value: f32, fallback: f32| {
            if value.is_finite() && value > 0.0 {
                value
            } else {
                fallback
            }
        };
        let non_negative = |value: f32| if value.is_finite() { value.max(0.0) } else { 0.0 };
        let fraction = |value: f32, fallback: f32| {
            if value.is_finite() && value > 0.0 {
                value.min(1.0)
            } else {
                fallback
            }
        };

        let max_image_fraction = fraction(self.max_image_fraction, defaults.max_image_fraction);
        Self {
            text_size: positive(self.text_size, defaults.text_size),
            line_spacing: positive(self.line_spacing, defaults.line_spacing),
            paragraph_spacing: non_negative(self.paragraph_spacing),
            title_size: positive(self.title_size, defaults.title_size),
            margins: Margins {
                top: non_negative(self.margins.top),
                right: non_negative(self.margins.right),
                bottom: non_negative(self.margins.bottom),
                left: non_negative(self.margins.left),
            },
            default_image_fraction: fraction(
                self.default_image_fraction,
                defaults.default_image_fraction,
            )
            .min(max_image_fraction),
            max_image_fraction,
            image_spacing: non_negative(self.image_spacing),
        }
    }
}
