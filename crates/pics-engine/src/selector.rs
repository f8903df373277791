//! Format strategy selection.
//!
//! Maps a detected container format and the request's settings to an ordered
//! list of [`Strategy`] tiers. Order: specialised external tools whose binary
//! resolves, then the embedded codec, then the system codec. The selector
//! never touches quality numbers; falling back changes the encoder only.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use pics_codec::{CodecAvailability, CodecBridge};
use pics_common::{reason, ImageFormat, Settings};
use pics_tools::{Tool, ToolRegistry};

/// One candidate way of re-encoding a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    ExternalTool { tool: Tool, path: PathBuf },
    EmbeddedCodec,
    SystemCodec,
    Unavailable,
}

impl Strategy {
    /// Reason code recorded when this tier produced the committed output.
    pub fn success_reason(&self) -> &'static str {
        match self {
            Strategy::ExternalTool { tool, .. } => tool.success_reason(),
            Strategy::EmbeddedCodec => "libwebp-compression",
            Strategy::SystemCodec => "system-codec-compression",
            Strategy::Unavailable => reason::FORMAT_NOT_COMPRESSIBLE,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::ExternalTool { tool, .. } => write!(f, "{tool}"),
            Strategy::EmbeddedCodec => f.write_str("embedded-codec"),
            Strategy::SystemCodec => f.write_str("system-codec"),
            Strategy::Unavailable => f.write_str("unavailable"),
        }
    }
}

/// Result of selection for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Do not attempt the file at all.
    Skip(&'static str),
    /// Try these tiers in order. Never empty; a lone
    /// [`Strategy::Unavailable`] means nothing can handle the format.
    Tiers(Vec<Strategy>),
}

/// Chooses tiers from the tool registry and codec bridge.
#[derive(Debug, Clone)]
pub struct StrategySelector {
    tools: Arc<ToolRegistry>,
    codecs: CodecBridge,
}

impl StrategySelector {
    pub fn new(tools: Arc<ToolRegistry>, codecs: CodecBridge) -> Self {
        Self { tools, codecs }
    }

    pub fn codecs(&self) -> &CodecBridge {
        &self.codecs
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn select(&self, format: ImageFormat, settings: &Settings) -> Selection {
        match format {
            ImageFormat::Unsupported => return Selection::Skip(reason::UNSUPPORTED_FORMAT),
            ImageFormat::Gif if !settings.enable_gifsicle => {
                return Selection::Skip(reason::GIFSICLE_DISABLED)
            }
            _ => {}
        }
        Selection::Tiers(self.select_strategies(format))
    }

    /// The ordered tier list for `format`.
    pub fn select_strategies(&self, format: ImageFormat) -> Vec<Strategy> {
        let mut tiers: Vec<Strategy> = external_tools(format)
            .iter()
            .filter_map(|&tool| {
                self.tools
                    .resolve(tool)
                    .map(|path| Strategy::ExternalTool { tool, path })
            })
            .collect();

        match self.codecs.availability(format) {
            CodecAvailability::Embedded => tiers.push(Strategy::EmbeddedCodec),
            CodecAvailability::SystemCodec => tiers.push(Strategy::SystemCodec),
            CodecAvailability::Unavailable => {}
        }

        if tiers.is_empty() {
            tiers.push(Strategy::Unavailable);
        }
        tracing::debug!(%format, tiers = ?tiers.iter().map(ToString::to_string).collect::<Vec<_>>(), "selected tiers");
        tiers
    }
}

/// Specialised encoders per format, best first.
fn external_tools(format: ImageFormat) -> &'static [Tool] {
    match format {
        ImageFormat::Jpeg => &[Tool::Cjpegli, Tool::Cjpeg],
        ImageFormat::Png => &[Tool::Oxipng],
        ImageFormat::Gif => &[Tool::Gifsicle],
        ImageFormat::WebP => &[Tool::Cwebp],
        ImageFormat::Avif => &[Tool::Avifenc],
        ImageFormat::Heif | ImageFormat::Tiff | ImageFormat::Unsupported => &[],
    }
}
