//! Per-request compression settings.
//!
//! Presets resolve to concrete per-format knobs through the accessor methods
//! on [`Settings`]; the raw `custom_*` fields only apply to
//! [`Preset::Custom`]. Every knob is clamped to its encoder's valid range.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named quality/size trade-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Preset {
    Quality,
    #[default]
    Balanced,
    Saving,
    Custom,
}

/// Where output is written relative to the original.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SaveMode {
    /// `<stem>_compressed.<ext>` next to the original.
    #[default]
    Suffix,
    /// `Compressor/<name>` next to the original.
    SeparateFolder,
    /// Replace the original in place.
    Overwrite,
}

/// Which dimension the resize target constrains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResizeCondition {
    Width,
    Height,
    /// Longest side.
    #[default]
    Fit,
}

/// Optional downscale applied before encoding. Never upscales.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResizeSpec {
    pub enabled: bool,
    pub target_pixels: u32,
    pub condition: ResizeCondition,
}

impl Default for ResizeSpec {
    fn default() -> Self {
        Self {
            enabled: false,
            target_pixels: 2048,
            condition: ResizeCondition::Fit,
        }
    }
}

impl ResizeSpec {
    /// Compute the output dimensions for an image of `width` x `height`.
    ///
    /// Returns `None` when no resize is needed (disabled, zero target, or the
    /// image already fits). Aspect ratio is preserved and neither side drops
    /// below one pixel.
    pub fn target_dimensions(&self, width: u32, height: u32) -> Option<(u32, u32)> {
        if !self.enabled || self.target_pixels == 0 || width == 0 || height == 0 {
            return None;
        }
        let constrained = match self.condition {
            ResizeCondition::Width => width,
            ResizeCondition::Height => height,
            ResizeCondition::Fit => width.max(height),
        };
        if constrained <= self.target_pixels {
            return None;
        }
        let scale = f64::from(self.target_pixels) / f64::from(constrained);
        let w = ((f64::from(width) * scale).round() as u32).max(1);
        let h = ((f64::from(height) * scale).round() as u32).max(1);
        Some((w, h))
    }
}

/// Settings for one compression request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub preset: Preset,
    pub save_mode: SaveMode,
    pub preserve_metadata: bool,
    #[serde(rename = "convertToSRGB")]
    pub convert_to_srgb: bool,
    pub enable_gifsicle: bool,
    pub enable_gif_lossy: bool,
    pub resize: ResizeSpec,

    /// JPEG quality in `0.0..=1.0` for [`Preset::Custom`].
    pub custom_jpeg_quality: f32,
    /// PNG/GIF optimisation level for [`Preset::Custom`].
    pub custom_png_level: u8,
    pub custom_webp_quality: u8,
    pub custom_webp_method: u8,
    /// AVIF constant-quality level (lower is better) for [`Preset::Custom`].
    pub custom_avif_quality: u8,
    pub custom_avif_speed: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            preset: Preset::Balanced,
            save_mode: SaveMode::Suffix,
            preserve_metadata: true,
            convert_to_srgb: false,
            enable_gifsicle: true,
            enable_gif_lossy: false,
            resize: ResizeSpec::default(),
            custom_jpeg_quality: 0.82,
            custom_png_level: 3,
            custom_webp_quality: 85,
            custom_webp_method: 5,
            custom_avif_quality: 28,
            custom_avif_speed: 4,
        }
    }
}

impl Settings {
    /// Settings for `preset` with every other field at its default.
    pub fn with_preset(preset: Preset) -> Self {
        Self {
            preset,
            ..Self::default()
        }
    }

    /// JPEG quality in `0.0..=1.0`.
    pub fn jpeg_quality(&self) -> f32 {
        match self.preset {
            Preset::Quality => 0.95,
            Preset::Balanced => 0.88,
            Preset::Saving => 0.82,
            Preset::Custom => self.custom_jpeg_quality.clamp(0.0, 1.0),
        }
    }

    /// JPEG quality as the 0-100 integer encoders take.
    pub fn jpeg_quality_percent(&self) -> u8 {
        (self.jpeg_quality() * 100.0).round() as u8
    }

    /// oxipng optimisation level (0-6).
    pub fn png_level(&self) -> u8 {
        match self.preset {
            Preset::Quality => 4,
            Preset::Balanced => 3,
            Preset::Saving => 2,
            Preset::Custom => self.custom_png_level.min(6),
        }
    }

    /// gifsicle optimisation level (1-3).
    pub fn gif_level(&self) -> u8 {
        self.png_level().clamp(1, 3)
    }

    pub fn webp_quality(&self) -> u8 {
        match self.preset {
            Preset::Quality => 95,
            Preset::Balanced => 88,
            Preset::Saving => 82,
            Preset::Custom => self.custom_webp_quality.min(100),
        }
    }

    /// WebP compression effort (0-6).
    pub fn webp_method(&self) -> u8 {
        match self.preset {
            Preset::Quality => 6,
            Preset::Balanced => 5,
            Preset::Saving => 4,
            Preset::Custom => self.custom_webp_method.min(6),
        }
    }

    /// AVIF constant-quality level (0-63, lower is better).
    pub fn avif_quality(&self) -> u8 {
        match self.preset {
            Preset::Quality => 15,
            Preset::Balanced => 25,
            Preset::Saving => 35,
            Preset::Custom => self.custom_avif_quality.min(63),
        }
    }

    /// avifenc speed (0-10, higher is faster).
    pub fn avif_speed(&self) -> u8 {
        match self.preset {
            Preset::Quality => 2,
            Preset::Balanced => 4,
            Preset::Saving => 6,
            Preset::Custom => self.custom_avif_speed.min(10),
        }
    }

    /// True when pixels must be rewritten before a tool sees them.
    pub fn needs_pixel_prep(&self) -> bool {
        self.resize.enabled || self.convert_to_srgb
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Preset::Quality => "quality",
            Preset::Balanced => "balanced",
            Preset::Saving => "saving",
            Preset::Custom => "custom",
        })
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quality" => Ok(Preset::Quality),
            "balanced" => Ok(Preset::Balanced),
            "saving" => Ok(Preset::Saving),
            "custom" => Ok(Preset::Custom),
            other => Err(format!("unknown preset: {other}")),
        }
    }
}

impl FromStr for SaveMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "suffix" => Ok(SaveMode::Suffix),
            "separatefolder" | "separate-folder" | "folder" => Ok(SaveMode::SeparateFolder),
            "overwrite" => Ok(SaveMode::Overwrite),
            other => Err(format!("unknown save mode: {other}")),
        }
    }
}

impl FromStr for ResizeCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "width" => Ok(ResizeCondition::Width),
            "height" => Ok(ResizeCondition::Height),
            "fit" | "longest" => Ok(ResizeCondition::Fit),
            other => Err(format!("unknown resize condition: {other}")),
        }
    }
}
