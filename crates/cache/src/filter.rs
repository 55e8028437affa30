//! Visual page filters and their cache fingerprints
//!
//! A [`PageFilter`] is the value object the settings layer hands us. The
//! filter tier of the cache is keyed by its [`FilterFingerprint`], which is a
//! lossless canonical encoding of every parameter: equal filters always
//! produce equal fingerprints and any parameter difference changes it.

use image::{imageops, Rgba, RgbaImage};
use serde::{Deserialize, Serialize};

/// Visual adjustments applied to a decoded page before display.
///
/// Ranges follow the reader settings sliders: brightness, contrast and
/// saturation are percentages in `-100.0..=100.0` (0 = unchanged), hue is a
/// rotation in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PageFilter {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
    pub hue: f32,
    pub grayscale: bool,
    pub invert: bool,
}

impl PageFilter {
    pub fn with_brightness(mut self, brightness: f32) -> Self {
        self.brightness = brightness;
        self
    }

    pub fn with_contrast(mut self, contrast: f32) -> Self {
        self.contrast = contrast;
        self
    }

    pub fn with_saturation(mut self, saturation: f32) -> Self {
        self.saturation = saturation;
        self
    }

    pub fn with_hue(mut self, degrees: f32) -> Self {
        self.hue = degrees;
        self
    }

    pub fn with_grayscale(mut self, grayscale: bool) -> Self {
        self.grayscale = grayscale;
        self
    }

    pub fn with_invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    /// True when applying this filter would leave every pixel unchanged.
    pub fn is_identity(&self) -> bool {
        self.brightness == 0.0
            && self.contrast == 0.0
            && self.saturation == 0.0
            && self.hue.rem_euclid(360.0) == 0.0
            && !self.grayscale
            && !self.invert
    }

    /// Fingerprint used as part of the filter-tier cache key.
    pub fn fingerprint(&self) -> FilterFingerprint {
        let mut flags = 0u8;
        if self.grayscale {
            flags |= FilterFingerprint::GRAYSCALE;
        }
        if self.invert {
            flags |= FilterFingerprint::INVERT;
        }
        FilterFingerprint {
            brightness: canonical_bits(self.brightness),
            contrast: canonical_bits(self.contrast),
            saturation: canonical_bits(self.saturation),
            hue: canonical_bits(self.hue),
            flags,
        }
    }

    /// Produce a filtered copy of `source`.
    ///
    /// Order: hue, saturation, grayscale, brightness, contrast, invert.
    /// Alpha is preserved throughout.
    pub fn apply(&self, source: &RgbaImage) -> RgbaImage {
        let mut image = if self.hue.rem_euclid(360.0) != 0.0 {
            imageops::huerotate(source, self.hue.round() as i32)
        } else {
            source.clone()
        };

        if self.grayscale {
            desaturate(&mut image, 0.0);
        } else if self.saturation != 0.0 {
            let factor = 1.0 + self.saturation.clamp(-100.0, 100.0) / 100.0;
            desaturate(&mut image, factor);
        }

        if self.brightness != 0.0 {
            let delta = self.brightness.clamp(-100.0, 100.0) / 100.0 * 255.0;
            image = imageops::brighten(&image, delta.round() as i32);
        }

        if self.contrast != 0.0 {
            image = imageops::contrast(&image, self.contrast.clamp(-100.0, 100.0));
        }

        if self.invert {
            imageops::invert(&mut image);
        }

        image
    }
}

/// Canonical encoding of a [`PageFilter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterFingerprint {
    brightness: u32,
    contrast: u32,
    saturation: u32,
    hue: u32,
    flags: u8,
}

impl FilterFingerprint {
    const GRAYSCALE: u8 = 0b01;
    const INVERT: u8 = 0b10;
}

impl std::fmt::Display for FilterFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:08x}{:08x}{:08x}{:08x}{:02x}",
            self.brightness, self.contrast, self.saturation, self.hue, self.flags
        )
    }
}

/// Bit pattern of `value` with `-0.0` folded into `0.0` and every NaN folded
/// into one quiet NaN, so numerically equal parameters fingerprint equally.
fn canonical_bits(value: f32) -> u32 {
    if value == 0.0 {
        0.0f32.to_bits()
    } else if value.is_nan() {
        f32::NAN.to_bits()
    } else {
        value.to_bits()
    }
}

/// Blend each pixel towards its luma. `factor` 0 gives grayscale, 1 leaves
/// the pixel alone, values above 1 oversaturate.
fn desaturate(image: &mut RgbaImage, factor: f32) {
    for pixel in image.pixels_mut() {
        let Rgba([r, g, b, a]) = *pixel;
        let (rf, gf, bf) = (r as f32, g as f32, b as f32);
        let luma = 0.299 * rf + 0.587 * gf + 0.114 * bf;
        let mix = |c: f32| (luma + (c - luma) * factor).round().clamp(0.0, 255.0) as u8;
        *pixel = Rgba([mix(rf), mix(gf), mix(bf), a]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RgbaImage {
        let mut image = RgbaImage::new(2, 1);
        image.put_pixel(0, 0, Rgba([200, 40, 40, 255]));
        image.put_pixel(1, 0, Rgba([10, 120, 250, 128]));
        image
    }

    #[test]
    fn test_equal_filters_share_fingerprint() {
        let a = PageFilter::default().with_brightness(10.0).with_invert(true);
        let b = PageFilter::default().with_brightness(10.0).with_invert(true);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_every_parameter_changes_fingerprint() {
        let base = PageFilter::default();
        let variants = [
            base.with_brightness(10.0),
            base.with_contrast(10.0),
            base.with_saturation(10.0),
            base.with_hue(10.0),
            base.with_grayscale(true),
            base.with_invert(true),
        ];

        for (i, a) in variants.iter().enumerate() {
            assert_ne!(a.fingerprint(), base.fingerprint(), "variant {} matched base", i);
            for (j, b) in variants.iter().enumerate() {
                if i != j {
                    assert_ne!(a.fingerprint(), b.fingerprint(), "variants {} and {}", i, j);
                }
            }
        }
    }

    #[test]
    fn test_brightness_10_and_20_differ() {
        let ten = PageFilter::default().with_brightness(10.0);
        let twenty = PageFilter::default().with_brightness(20.0);
        assert_ne!(ten.fingerprint(), twenty.fingerprint());
    }

    #[test]
    fn test_negative_zero_is_canonical() {
        let a = PageFilter::default().with_contrast(0.0);
        let b = PageFilter::default().with_contrast(-0.0);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_identity_filter_is_noop() {
        let filter = PageFilter::default();
        assert!(filter.is_identity());
        assert_eq!(filter.apply(&sample()), sample());
        assert!(!filter.with_hue(90.0).is_identity());
        assert!(filter.with_hue(360.0).is_identity());
    }

    #[test]
    fn test_invert_keeps_alpha() {
        let out = PageFilter::default().with_invert(true).apply(&sample());
        assert_eq!(out.get_pixel(0, 0), &Rgba([55, 215, 215, 255]));
        assert_eq!(out.get_pixel(1, 0), &Rgba([245, 135, 5, 128]));
    }

    #[test]
    fn test_grayscale_equalizes_channels() {
        let out = PageFilter::default().with_grayscale(true).apply(&sample());
        for pixel in out.pixels() {
            let Rgba([r, g, b, _]) = *pixel;
            assert_eq!(r, g);
            assert_eq!(g, b);
        }
        assert_eq!(out.get_pixel(1, 0)[3], 128);
    }

    #[test]
    fn test_brightness_lightens() {
        let out = PageFilter::default().with_brightness(20.0).apply(&sample());
        assert!(out.get_pixel(0, 0)[1] > 40);
        let darker = PageFilter::default().with_brightness(-20.0).apply(&sample());
        assert!(darker.get_pixel(0, 0)[0] < 200);
    }

    #[test]
    fn test_filter_serde_defaults_missing_fields() {
        let filter: PageFilter = serde_json::from_str(r#"{"brightness": 15.0}"#).unwrap();
        assert_eq!(filter, PageFilter::default().with_brightness(15.0));
    }
}
